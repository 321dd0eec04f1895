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

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::iter;
use strata_storage::{batch, record::Record, segment::SegmentedLog};
use tempfile::tempdir;

static KB: usize = 1024;

fn encode_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_record");

    for size in [KB, 2 * KB, 4 * KB, 8 * KB, 16 * KB].iter() {
        _ = group.throughput(Throughput::Bytes(*size as u64));

        _ = group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let value = Bytes::from(iter::repeat_n(0u8, size).collect::<Vec<_>>());

            b.iter(|| {
                Record::builder()
                    .partition(6)
                    .index(32123)
                    .timestamp(1_700_000_000_000)
                    .body(value.clone())
                    .build()
                    .unwrap()
                    .encode()
            })
        });
    }

    group.finish();
}

fn encode_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_batch");

    for count in [1, 10, 100].iter() {
        _ = group.throughput(Throughput::Elements(*count as u64));

        _ = group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let messages = iter::repeat_n(Bytes::from_static(&[0u8; 128]), count).collect::<Vec<_>>();

            b.iter(|| batch::encode(&messages).unwrap())
        });
    }

    group.finish();
}

fn append_to_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_to_log");

    for size in [KB, 2 * KB, 4 * KB, 8 * KB, 16 * KB].iter() {
        _ = group.throughput(Throughput::Bytes(*size as u64));

        _ = group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = tempdir().unwrap();
            let mut log = SegmentedLog::new(dir.path(), 64 * 1024 * 1024)
                .create()
                .unwrap();

            let encoded = Record::builder()
                .partition(0)
                .index(0)
                .timestamp(0)
                .body(Bytes::from(iter::repeat_n(0u8, size).collect::<Vec<_>>()))
                .build()
                .unwrap()
                .encode();

            b.iter(|| log.append(&encoded).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, encode_record, encode_batch, append_to_log);
criterion_main!(benches);
