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

use common::{alphanumeric_string, group_dir, init_tracing, small_segments, store};
use pretty_assertions::assert_eq;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use strata_storage::{
    Error, ErrorCode, QosLevel, Result, SizeRetention, TimeRetention, WriteRequest,
    index::ENTRY_SIZE,
};
use tempfile::tempdir;
use tracing::debug;

pub mod common;

#[tokio::test]
async fn size_retention_advances_left_index() -> Result<()> {
    let _guard = init_tracing()?;

    let dir = tempdir()?;
    let store = store(dir.path())?;
    store.create_partition_group("orders", 0, &[0, 1], Some(small_segments()))?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;

    let written = orders
        .write(
            (0..100)
                .map(|i| WriteRequest::new(i % 2, alphanumeric_string(68)))
                .collect(),
        )
        .await;
    assert!(written.iter().all(|result| result.is_ok()));

    let replicable = store.get_replicable_store("orders", 0)?;
    let right_position = replicable.right_position();

    assert_eq!(
        None,
        store
            .apply_retention("orders", 0, &SizeRetention::new(1_000_000))
            .await?
    );

    let purged = store
        .apply_retention("orders", 0, &SizeRetention::new(2_048))
        .await?;
    debug!(?purged);

    let purged = purged.ok_or(strata_storage::Error::Message(String::from("nothing purged")))?;
    assert!(purged.bytes() > 0);
    assert_eq!(purged.start, replicable.left_position()?);
    assert!(right_position.distance_from(purged.start)? <= 2_048);

    for partition in [0, 1] {
        let left_index = orders.left_index(partition)?;
        assert!(left_index > 0);
        assert_eq!(50, orders.right_index(partition)?);

        assert_eq!(
            ErrorCode::PositionOverflow,
            orders.read(partition, left_index - 1, 10, 10_000).code()
        );

        let read = orders.read(partition, left_index, 100, 1_000_000);
        assert!(read.eop());
        assert_eq!((50 - left_index) as usize, read.messages().len());
    }

    store.close().await?;

    let store = common::store(dir.path())?;
    _ = store.restore().await?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;
    assert!(orders.left_index(0)? > 0);
    assert_eq!(50, orders.right_index(0)?);

    store.close().await
}

#[tokio::test]
async fn time_retention_keeps_recent_segments() -> Result<()> {
    let _guard = init_tracing()?;

    let dir = tempdir()?;
    let store = store(dir.path())?;
    store.create_partition_group("orders", 0, &[0], Some(small_segments()))?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;

    let written = orders
        .write(
            (0..50)
                .map(|_| WriteRequest::new(0, alphanumeric_string(68)))
                .collect(),
        )
        .await;
    assert!(written.iter().all(|result| result.is_ok()));

    assert_eq!(
        None,
        store
            .apply_retention("orders", 0, &TimeRetention::new(Duration::from_secs(3_600)))
            .await?
    );

    assert_eq!(0, orders.left_index(0)?);

    tokio::time::sleep(Duration::from_millis(20)).await;

    let purged = store
        .apply_retention("orders", 0, &TimeRetention::new(Duration::from_millis(10)))
        .await?;
    debug!(?purged);

    assert!(purged.is_some());
    assert!(orders.left_index(0)? > 0);
    assert_eq!(50, orders.right_index(0)?);

    store.close().await
}

fn log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut segments = dir
        .read_dir()?
        .map(|entry| entry.map(|entry| entry.path()).map_err(Into::into))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|path| path.extension().is_some_and(|extension| extension == "log"))
        .collect::<Vec<_>>();

    segments.sort();
    Ok(segments)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retention_with_concurrent_readers() -> Result<()> {
    let _guard = init_tracing()?;

    let dir = tempdir()?;
    let store = store(dir.path())?;
    store.create_partition_group("orders", 0, &[0], Some(small_segments()))?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;
    let running = Arc::new(AtomicBool::new(true));

    let readers = (0..4)
        .map(|_| {
            let orders = orders.clone();
            let running = running.clone();

            tokio::spawn(async move {
                let mut served = 0;

                while running.load(Ordering::Acquire) {
                    let left_index = orders.left_index(0)?;
                    let read = orders.read(0, left_index, 10, 10_000);

                    match read.code() {
                        ErrorCode::None => served += read.messages().len(),
                        ErrorCode::PositionOverflow => (),
                        code => {
                            return Err(Error::Message(format!(
                                "read from: {left_index}, code: {code:?}"
                            )));
                        }
                    }

                    tokio::task::yield_now().await;
                }

                Ok(served)
            })
        })
        .collect::<Vec<_>>();

    for round in 0..20 {
        let written = orders
            .write(
                (0..20)
                    .map(|_| WriteRequest::new(0, alphanumeric_string(68)))
                    .collect(),
            )
            .await;
        assert!(written.iter().all(|result| result.is_ok()));

        let purged = store
            .apply_retention("orders", 0, &SizeRetention::new(2_048))
            .await?;
        debug!(round, ?purged);
    }

    running.store(false, Ordering::Release);

    for reader in readers {
        let served = reader
            .await
            .map_err(|error| Error::Message(error.to_string()))??;
        debug!(served);
    }

    assert!(!orders.is_degraded());
    assert!(orders.left_index(0)? > 0);
    assert_eq!(400, orders.right_index(0)?);

    store.close().await
}

#[tokio::test]
async fn retention_compacts_index_files() -> Result<()> {
    let _guard = init_tracing()?;

    let dir = tempdir()?;
    let store = store(dir.path())?;
    store.create_partition_group("orders", 0, &[0], Some(small_segments()))?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;

    let written = orders
        .write(
            (0..100)
                .map(|_| WriteRequest::new(0, alphanumeric_string(68)))
                .collect(),
        )
        .await;
    assert!(written.iter().all(|result| result.is_ok()));
    _ = orders.flush().await?;

    let index_file = group_dir(dir.path(), "orders", 0).join("00000.index");
    assert_eq!(100 * ENTRY_SIZE as u64, fs::metadata(&index_file)?.len());

    let purged = store
        .apply_retention("orders", 0, &SizeRetention::new(2_048))
        .await?;
    assert!(purged.is_some());

    let left_index = orders.left_index(0)?;
    assert!(left_index > 0);
    assert_eq!(
        (100 - left_index) * ENTRY_SIZE as u64,
        fs::metadata(&index_file)?.len()
    );

    store.close().await?;

    let store = common::store(dir.path())?;
    _ = store.restore().await?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;
    assert_eq!(left_index, orders.left_index(0)?);
    assert_eq!(
        (100 - left_index) as usize,
        orders.read(0, left_index, 100, 1_000_000).messages().len()
    );

    store.close().await
}

#[tokio::test]
async fn retention_interrupted_before_segment_deletion() -> Result<()> {
    let _guard = init_tracing()?;

    let dir = tempdir()?;
    let group = group_dir(dir.path(), "orders", 0);

    let store = store(dir.path())?;
    store.create_partition_group("orders", 0, &[0], Some(small_segments()))?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;

    let written = orders
        .write(
            (0..100)
                .map(|_| WriteRequest::new(0, alphanumeric_string(68)))
                .collect(),
        )
        .await;
    assert!(written.iter().all(|result| result.is_ok()));
    _ = orders.flush().await?;

    let segments = log_files(&group)?
        .into_iter()
        .map(|path| fs::read(&path).map(|contents| (path, contents)))
        .collect::<Result<Vec<_>, _>>()?;

    _ = store
        .apply_retention("orders", 0, &SizeRetention::new(2_048))
        .await?;

    let left_index = orders.left_index(0)?;
    store.close().await?;

    let retained = log_files(&group)?.len();
    assert!(retained < segments.len());

    for (path, contents) in &segments {
        fs::write(path, contents)?;
    }

    let store = common::store(dir.path())?;
    _ = store.restore().await?;
    store.start()?;

    let orders = store.get_store("orders", 0, QosLevel::Receive)?;
    assert_eq!(left_index, orders.left_index(0)?);
    assert_eq!(100, orders.right_index(0)?);

    assert_eq!(
        ErrorCode::PositionOverflow,
        orders.read(0, left_index - 1, 10, 10_000).code()
    );
    assert_eq!(
        (100 - left_index) as usize,
        orders.read(0, left_index, 100, 1_000_000).messages().len()
    );

    assert!(
        store
            .apply_retention("orders", 0, &SizeRetention::new(2_048))
            .await?
            .is_some()
    );
    assert_eq!(retained, log_files(&group)?.len());
    assert!(!orders.is_degraded());

    store.close().await
}

