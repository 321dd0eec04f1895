// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Load generator for a local store.
//!
//! Producers write into a partition group through [`PartitionGroupStore`]
//! handles while consumers follow each partition from its left index.
//! Throughput and latency are printed by an in-process metric exporter.

use core::{
    fmt::{self, Display},
    result,
};
use std::{
    io,
    marker::PhantomData,
    num::{NonZero, NonZeroU32},
    ops::AddAssign,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, LazyLock, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, InsufficientCapacity, Jitter, Quota, RateLimiter};
use human_units::{
    FormatDuration,
    iec::{Byte, Prefix},
};
use nonzero_ext::nonzero;
use opentelemetry::{
    InstrumentationScope, KeyValue, global,
    metrics::{Counter, Meter},
};
use opentelemetry_sdk::{
    error::{OTelSdkError, OTelSdkResult},
    metrics::{
        SdkMeterProvider, Temporality,
        data::{AggregatedMetrics, Histogram, Metric, MetricData, ResourceMetrics},
        exporter::PushMetricExporter,
    },
};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use rand::{Rng as _, rng};
use strata_storage::{
    ErrorCode, GroupConfig, PartitionGroupStore, PartitionId, QosLevel, Store, WriteRequest,
};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
    task::JoinSet,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub type Result<T, E = Error> = result::Result<T, E>;

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

#[derive(thiserror::Error, Debug)]
pub enum Error {
    Api(ErrorCode),
    InsufficientCapacity(#[from] InsufficientCapacity),
    Io(Arc<io::Error>),
    OtelSdk(#[from] OTelSdkError),
    Poison,
    Storage(#[from] strata_storage::Error),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CancelKind {
    Interrupt,
    Terminate,
    Timeout,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Perf {
    path: PathBuf,
    topic: String,
    group: u32,
    partitions: u16,
    batch_size: u32,
    record_size: usize,
    per_second: Option<u32>,
    throughput: Option<u32>,
    producers: u32,
    consumers: u32,
    qos: QosLevel,
    segment_size: Option<u64>,
    duration: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct Builder<P, T> {
    path: P,
    topic: T,
    group: u32,
    partitions: u16,
    batch_size: u32,
    record_size: usize,
    per_second: Option<u32>,
    throughput: Option<u32>,
    producers: u32,
    consumers: u32,
    qos: QosLevel,
    segment_size: Option<u64>,
    duration: Option<Duration>,
}

impl Default for Builder<PhantomData<PathBuf>, PhantomData<String>> {
    fn default() -> Self {
        Self {
            path: Default::default(),
            topic: Default::default(),
            group: Default::default(),
            partitions: 1,
            batch_size: 1,
            record_size: 1024,
            per_second: None,
            throughput: None,
            producers: 1,
            consumers: 0,
            qos: QosLevel::default(),
            segment_size: None,
            duration: None,
        }
    }
}

impl<P, T> Builder<P, T> {
    pub fn path(self, path: impl Into<PathBuf>) -> Builder<PathBuf, T> {
        Builder {
            path: path.into(),
            topic: self.topic,
            group: self.group,
            partitions: self.partitions,
            batch_size: self.batch_size,
            record_size: self.record_size,
            per_second: self.per_second,
            throughput: self.throughput,
            producers: self.producers,
            consumers: self.consumers,
            qos: self.qos,
            segment_size: self.segment_size,
            duration: self.duration,
        }
    }

    pub fn topic(self, topic: impl Into<String>) -> Builder<P, String> {
        Builder {
            path: self.path,
            topic: topic.into(),
            group: self.group,
            partitions: self.partitions,
            batch_size: self.batch_size,
            record_size: self.record_size,
            per_second: self.per_second,
            throughput: self.throughput,
            producers: self.producers,
            consumers: self.consumers,
            qos: self.qos,
            segment_size: self.segment_size,
            duration: self.duration,
        }
    }

    pub fn group(self, group: u32) -> Self {
        Self { group, ..self }
    }

    pub fn partitions(self, partitions: u16) -> Self {
        Self { partitions, ..self }
    }

    pub fn batch_size(self, batch_size: u32) -> Self {
        Self { batch_size, ..self }
    }

    pub fn record_size(self, record_size: usize) -> Self {
        Self {
            record_size,
            ..self
        }
    }

    pub fn per_second(self, per_second: Option<u32>) -> Self {
        Self { per_second, ..self }
    }

    pub fn throughput(self, throughput: Option<u32>) -> Self {
        Self { throughput, ..self }
    }

    pub fn producers(self, producers: u32) -> Self {
        Self { producers, ..self }
    }

    pub fn consumers(self, consumers: u32) -> Self {
        Self { consumers, ..self }
    }

    pub fn qos(self, qos: QosLevel) -> Self {
        Self { qos, ..self }
    }

    pub fn segment_size(self, segment_size: Option<u64>) -> Self {
        Self {
            segment_size,
            ..self
        }
    }

    pub fn duration(self, duration: Option<Duration>) -> Self {
        Self { duration, ..self }
    }
}

impl Builder<PathBuf, String> {
    pub fn build(self) -> Perf {
        Perf {
            path: self.path,
            topic: self.topic,
            group: self.group,
            partitions: self.partitions.max(1),
            batch_size: self.batch_size,
            record_size: self.record_size,
            per_second: self.per_second,
            throughput: self.throughput,
            producers: self.producers,
            consumers: self.consumers,
            qos: self.qos,
            segment_size: self.segment_size,
            duration: self.duration,
        }
    }
}

static RATE_LIMIT_DURATION: LazyLock<opentelemetry::metrics::Histogram<u64>> =
    LazyLock::new(|| {
        METER
            .u64_histogram("rate_limit_duration")
            .with_unit("ms")
            .with_description("Rate limit latencies in milliseconds")
            .build()
    });

static PRODUCE_RECORD_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("produce_record_count")
        .with_description("Produced record count")
        .build()
});

static PRODUCE_BYTES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("produce_bytes")
        .with_description("Produced message bytes")
        .build()
});

static PRODUCE_DURATION: LazyLock<opentelemetry::metrics::Histogram<u64>> =
    LazyLock::new(|| {
        METER
            .u64_histogram("produce_duration")
            .with_unit("ms")
            .with_description("Write latencies in milliseconds")
            .build()
    });

static CONSUME_RECORD_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("consume_record_count")
        .with_description("Consumed record count")
        .build()
});

impl Perf {
    pub fn builder() -> Builder<PhantomData<PathBuf>, PhantomData<String>> {
        Builder::default()
    }

    async fn store(&self) -> Result<Store> {
        let store = Store::builder().path(&self.path).build()?;

        if store.partition_group_exists(&self.topic, self.group)? {
            debug!(topic = self.topic, group = self.group, "existing");
            store
                .restore_partition_group(&self.topic, self.group)
                .await?;
        } else {
            let partitions = (0..self.partitions).collect::<Vec<_>>();

            let config = self
                .segment_size
                .map(|segment_size| GroupConfig::default().segment_size(segment_size));

            store.create_partition_group(&self.topic, self.group, &partitions, config)?;
        }

        Ok(store)
    }

    pub async fn main(self) -> Result<ErrorCode> {
        let token = CancellationToken::new();

        let meter_provider = {
            let exporter = MetricExporter::new(token.clone());
            let meter_provider = SdkMeterProvider::builder()
                .with_periodic_exporter(exporter)
                .build();
            global::set_meter_provider(meter_provider.clone());

            meter_provider
        };

        let mut interrupt_signal = signal(SignalKind::interrupt())?;
        debug!(?interrupt_signal);

        let mut terminate_signal = signal(SignalKind::terminate())?;
        debug!(?terminate_signal);

        let store = self.store().await?;
        store.start()?;

        let rate_limiter = self
            .per_second
            .or(self.throughput)
            .inspect(|limit| debug!(?limit))
            .and_then(NonZeroU32::new)
            .map(Quota::per_second)
            .map(RateLimiter::direct)
            .map(Arc::new)
            .inspect(|rate_limiter| debug!(?rate_limiter));

        let record_data = {
            let mut data = vec![0u8; self.record_size];
            rng().fill(&mut data[..]);
            Bytes::from(data)
        };

        let batch_size = NonZeroU32::new(self.batch_size)
            .inspect(|batch_size| debug!(batch_size = batch_size.get()))
            .unwrap_or(nonzero!(10u32));

        let mut set = JoinSet::new();

        for id in 0..self.producers {
            let producer = Producer {
                id,
                rate_limiter: rate_limiter.clone(),
                partition: PartitionId::try_from(id % u32::from(self.partitions))
                    .unwrap_or_default(),
                record_data: record_data.clone(),
                token: token.clone(),
                store: store.get_store(&self.topic, self.group, self.qos)?,
                batch_size,
                throughput: self.throughput,
            };

            _ = set.spawn(async move {
                loop {
                    match producer.rate_limited().await {
                        Ok(false) => break,

                        Err(error) => {
                            debug!(id = producer.id, ?error);
                            break;
                        }

                        _ => continue,
                    }
                }
            });
        }

        for id in 0..self.consumers {
            let mut consumer = Consumer {
                id,
                partition: PartitionId::try_from(id % u32::from(self.partitions))
                    .unwrap_or_default(),
                token: token.clone(),
                store: store.get_store(&self.topic, self.group, self.qos)?,
                committed: store
                    .get_replicable_store(&self.topic, self.group)?
                    .subscribe(),
                max_bytes: self.record_size.saturating_mul(self.batch_size as usize),
                from: None,
            };

            _ = set.spawn(async move {
                if let Err(error) = consumer.follow().await {
                    debug!(id = consumer.id, ?error);
                }
            });
        }

        let join_all = async {
            while !set.is_empty() {
                debug!(len = set.len());
                _ = set.join_next().await;
            }
        };

        let duration = self
            .duration
            .map(sleep)
            .map(Box::pin)
            .map(|pinned| pinned as Pin<Box<dyn Future<Output = ()>>>)
            .unwrap_or(Box::pin(std::future::pending()) as Pin<Box<dyn Future<Output = ()>>>);

        let cancellation = tokio::select! {

            timeout = duration => {
                debug!(?timeout);
                Some(CancelKind::Timeout)
            }

            completed = join_all => {
                debug!(?completed);
                None
            }

            interrupt = interrupt_signal.recv() => {
                debug!(?interrupt);
                Some(CancelKind::Interrupt)
            }

            terminate = terminate_signal.recv() => {
                debug!(?terminate);
                Some(CancelKind::Terminate)
            }

        };

        debug!(?cancellation);
        token.cancel();

        while !set.is_empty() {
            _ = set.join_next().await;
        }

        meter_provider
            .shutdown()
            .inspect(|shutdown| debug!(?shutdown))?;

        store.close().await?;

        Ok(ErrorCode::None)
    }
}

#[derive(Clone, Debug)]
struct Producer {
    id: u32,
    rate_limiter: Option<Arc<DefaultDirectRateLimiter>>,
    partition: PartitionId,
    record_data: Bytes,
    token: CancellationToken,
    store: PartitionGroupStore,
    batch_size: NonZero<u32>,
    throughput: Option<u32>,
}

impl Producer {
    #[instrument(skip_all, fields(record_data_len = self.record_data.len()))]
    fn request(&self) -> Result<WriteRequest> {
        if self.batch_size.get() == 1 {
            Ok(WriteRequest::new(self.partition, self.record_data.clone()))
        } else {
            WriteRequest::batch(
                self.partition,
                (0..self.batch_size.get()).map(|_| self.record_data.clone()),
            )
            .map_err(Into::into)
        }
    }

    #[instrument(skip_all)]
    async fn produce(&self, request: WriteRequest) -> Result<()> {
        let written = self.store.write(vec![request]).await;

        match written.iter().find(|result| !result.is_ok()) {
            Some(failed) => Err(Error::Api(failed.code())),
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(id = self.id))]
    async fn rate_limited(&self) -> Result<bool> {
        let attributes = [KeyValue::new("producer", self.id.to_string())];

        let request = self.request()?;
        let bytes = (self.record_data.len() as u64) * u64::from(self.batch_size.get());

        if let Some(ref rate_limiter) = self.rate_limiter {
            let rate_limit_start = SystemTime::now();

            let cells = self
                .throughput
                .and(NonZeroU32::new(
                    u32::try_from(request.buffer().len()).unwrap_or(u32::MAX),
                ))
                .unwrap_or(self.batch_size);

            tokio::select! {
                cancelled = self.token.cancelled() => {
                    debug!(?cancelled);
                    return Ok(false)
                },

                limited = rate_limiter.until_n_ready_with_jitter(cells, Jitter::up_to(Duration::from_millis(10))) => {
                    _ = limited?;

                    RATE_LIMIT_DURATION.record(
                        rate_limit_start
                            .elapsed()
                            .inspect(|duration| debug!(rate_limit_duration_ms = duration.as_millis()))
                            .map_or(0, |duration| duration.as_millis() as u64),
                        &attributes,
                    )
                },
            }
        }

        let produce_start = SystemTime::now();

        tokio::select! {
            cancelled = self.token.cancelled() => {
                debug!(?cancelled);
                return Ok(false)
            },

            produced = self.produce(request) => {
                produced?;

                PRODUCE_RECORD_COUNT.add(u64::from(self.batch_size.get()), &attributes);
                PRODUCE_BYTES.add(bytes, &attributes);
                PRODUCE_DURATION.record(
                    produce_start
                        .elapsed()
                        .inspect(|duration| debug!(produce_duration_ms = duration.as_millis()))
                        .map_or(0, |duration| duration.as_millis() as u64),
                    &attributes,
                );
            },
        }

        Ok(!self.token.is_cancelled())
    }
}

#[derive(Debug)]
struct Consumer {
    id: u32,
    partition: PartitionId,
    token: CancellationToken,
    store: PartitionGroupStore,
    committed: watch::Receiver<strata_storage::Position>,
    max_bytes: usize,
    from: Option<u64>,
}

impl Consumer {
    #[instrument(skip_all, fields(id = self.id, partition = self.partition))]
    async fn follow(&mut self) -> Result<()> {
        let attributes = [KeyValue::new("consumer", self.id.to_string())];

        while !self.token.is_cancelled() {
            let from = match self.from {
                Some(from) => from,
                None => self.store.left_index(self.partition)?,
            };

            let read = self.store.read(self.partition, from, 1_024, self.max_bytes);

            if !read.is_ok() {
                return Err(Error::Api(read.code()));
            }

            let consumed = read.messages().len() as u64;
            CONSUME_RECORD_COUNT.add(consumed, &attributes);
            self.from = Some(from + consumed);

            if read.eop() {
                tokio::select! {
                    cancelled = self.token.cancelled() => {
                        debug!(?cancelled);
                        break
                    },

                    changed = self.committed.changed() => {
                        if changed.is_err() {
                            break
                        }
                    },
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct Observation {
    taken_at: SystemTime,
    bytes_sent: u64,
    record_count: u64,
    consumed_count: u64,
}

impl AddAssign for Observation {
    fn add_assign(&mut self, rhs: Self) {
        self.taken_at = self.taken_at.max(rhs.taken_at);
        self.bytes_sent += rhs.bytes_sent;
        self.record_count += rhs.record_count;
        self.consumed_count += rhs.consumed_count;
    }
}

impl Default for Observation {
    fn default() -> Self {
        Self {
            taken_at: SystemTime::now(),
            bytes_sent: Default::default(),
            record_count: Default::default(),
            consumed_count: Default::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
struct Info {
    started_at: SystemTime,
    previous: Option<ObservationLatency>,
    current: ObservationLatency,
}

impl Info {
    fn new(started_at: SystemTime) -> Self {
        Self {
            started_at,
            current: Default::default(),
            previous: Default::default(),
        }
    }

    fn with_previous(self, previous: Option<ObservationLatency>) -> Self {
        Self { previous, ..self }
    }

    fn elapsed(&self) -> Duration {
        self.current
            .observation
            .taken_at
            .duration_since(
                self.previous
                    .map_or(self.started_at, |previous| previous.observation.taken_at),
            )
            .unwrap_or_default()
    }

    fn delta(&self, value: impl Fn(&Observation) -> u64) -> u64 {
        value(&self.current.observation).saturating_sub(
            self.previous
                .map(|previous| value(&previous.observation))
                .unwrap_or_default(),
        )
    }

    fn bytes_sent(&self) -> u64 {
        self.delta(|observation| observation.bytes_sent)
    }

    fn records_sent(&self) -> u64 {
        self.delta(|observation| observation.record_count)
    }

    fn records_consumed(&self) -> u64 {
        self.delta(|observation| observation.consumed_count)
    }

    fn per_second(&self, count: u64) -> f64 {
        count as f64 / self.elapsed().as_secs_f64()
    }

    fn bandwidth(&self) -> Byte {
        Byte::with_iec_prefix(
            self.bytes_sent()
                .checked_div(self.elapsed().as_secs())
                .unwrap_or_default(),
            Prefix::None,
        )
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "elapsed: {}, {} records sent, {:.1} records/s, ({}/s), {} records consumed, {:.1} records/s",
            self.elapsed().format_duration(),
            self.records_sent(),
            self.per_second(self.records_sent()),
            self.bandwidth().format_iec(),
            self.records_consumed(),
            self.per_second(self.records_consumed()),
        )?;

        if let (Some(min), Some(mean), Some(max)) = (
            self.current.latency.min,
            self.current.latency.mean,
            self.current.latency.max,
        ) {
            write!(
                f,
                ", latency: {} min, {mean:.1}ms avg, {} max",
                min.format_duration(),
                max.format_duration()
            )?;
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
struct Latency {
    min: Option<Duration>,
    max: Option<Duration>,
    mean: Option<f64>,
}

impl From<&Histogram<u64>> for Latency {
    fn from(histogram: &Histogram<u64>) -> Self {
        let min = histogram
            .data_points()
            .filter_map(|dp| dp.min())
            .min()
            .map(Duration::from_millis);

        let max = histogram
            .data_points()
            .filter_map(|dp| dp.max())
            .max()
            .map(Duration::from_millis);

        let sum = histogram.data_points().map(|dp| dp.sum()).sum::<u64>() as f64;
        let count = histogram.data_points().map(|dp| dp.count()).sum::<u64>();

        let mean = (count > 0).then(|| sum / count as f64);

        Self { min, max, mean }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
struct ObservationLatency {
    observation: Observation,
    latency: Latency,
}

#[derive(Debug)]
struct MetricExporter {
    started_at: SystemTime,
    temporality: Temporality,
    previous: Mutex<Option<ObservationLatency>>,
    cancellation: CancellationToken,
}

impl MetricExporter {
    fn new(cancellation: CancellationToken) -> Self {
        let started_at = SystemTime::now();
        Self {
            started_at,
            temporality: Default::default(),
            previous: Default::default(),
            cancellation,
        }
    }

    fn sum(metric: &MetricData<u64>) -> Option<u64> {
        if let MetricData::Sum(sum) = metric {
            for (point, data) in sum.data_points().enumerate() {
                debug!(point, value = ?data.value());
            }

            Some(sum.data_points().map(|sum| sum.value()).sum::<u64>())
        } else {
            None
        }
    }

    #[instrument(skip_all, fields(scope = scope.name(), metric = metric.name()))]
    fn info(&self, scope: &InstrumentationScope, metric: &Metric, info: &mut Info) {
        if scope.name() != env!("CARGO_PKG_NAME") {
            return;
        }

        let AggregatedMetrics::U64(data) = metric.data() else {
            return;
        };

        match (metric.name(), data) {
            ("produce_record_count", data) => {
                if let Some(total) = Self::sum(data) {
                    info.current.observation.record_count = total;
                }
            }

            ("produce_bytes", data) => {
                if let Some(total) = Self::sum(data) {
                    info.current.observation.bytes_sent = total;
                }
            }

            ("consume_record_count", data) => {
                if let Some(total) = Self::sum(data) {
                    info.current.observation.consumed_count = total;
                }
            }

            ("produce_duration", MetricData::Histogram(histogram)) => {
                info.current.latency = Latency::from(histogram);
            }

            _ => (),
        }
    }
}

impl PushMetricExporter for MetricExporter {
    async fn export(&self, metrics: &ResourceMetrics) -> OTelSdkResult {
        let mut previous = self
            .previous
            .lock()
            .map_err(|error| OTelSdkError::InternalFailure(error.to_string()))?;

        if self.cancellation.is_cancelled() {
            if let Some(previous) = *previous {
                let mut info = Info::new(self.started_at);
                info.current = previous;

                println!("{info}");
            }
        } else {
            let mut info = Info::new(self.started_at).with_previous(previous.take());

            for scope in metrics.scope_metrics() {
                debug!(scope = scope.scope().name());

                for metric in scope.metrics() {
                    self.info(scope.scope(), metric, &mut info);
                }
            }

            println!("{info}");

            _ = previous.replace(info.current);
        }

        Ok(())
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    #[instrument]
    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        self.temporality
    }
}
