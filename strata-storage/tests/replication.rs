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
use common::{alphanumeric_string, init_tracing, small_segments, store};
use pretty_assertions::assert_eq;
use strata_storage::{
    Error, Position, QosLevel, Result, WriteRequest,
    record::{HEADER_SIZE, Record},
};
use tempfile::tempdir;
use tracing::debug;

pub mod common;

#[tokio::test]
async fn follower_reproduces_leader() -> Result<()> {
    let _guard = init_tracing()?;

    let leader_dir = tempdir()?;
    let leader = store(leader_dir.path())?;
    leader.create_partition_group("orders", 0, &[0, 1], Some(small_segments()))?;
    leader.start()?;

    let follower_dir = tempdir()?;
    let follower = store(follower_dir.path())?;
    follower.create_partition_group("orders", 0, &[0, 1], Some(small_segments()))?;
    follower.start()?;

    let produced = leader.get_store("orders", 0, QosLevel::Receive)?;

    let mut requests = (0..40)
        .map(|i| WriteRequest::new(i % 2, alphanumeric_string(50)))
        .collect::<Vec<_>>();
    requests.push(WriteRequest::batch(1, ["x", "y", "z"])?);

    let written = produced.write(requests).await;
    assert!(written.iter().all(|result| result.is_ok()));

    let source = leader.get_replicable_store("orders", 0)?;
    assert!(matches!(
        source.read_entries(Position::ZERO, 1_024),
        Err(Error::ReplicationDisabled(_))
    ));

    source.enable();
    assert!(source.is_enabled());

    let mut subscription = source.subscribe();
    assert_eq!(source.right_position(), *subscription.borrow_and_update());

    let sink = follower.get_replicable_store("orders", 0)?;
    let mut position = sink.right_position();

    while position < source.right_position() {
        let entries = source.read_entries(position, 300)?;
        debug!(%position, len = entries.len());

        position = sink.append_entries(position, entries).await?;
    }

    assert_eq!(source.right_position(), sink.right_position());

    let consumed = follower.get_store("orders", 0, QosLevel::Receive)?;

    for partition in [0, 1] {
        assert_eq!(
            produced.right_index(partition)?,
            consumed.right_index(partition)?
        );

        assert_eq!(
            produced.read(partition, 0, 100, 1_000_000),
            consumed.read(partition, 0, 100, 1_000_000)
        );
    }

    let more = produced.write(vec![WriteRequest::new(0, "more")]).await;
    assert_eq!(&[20], more[0].indices());

    subscription.changed().await.map_err(|error| Error::Message(error.to_string()))?;
    assert_eq!(source.right_position(), *subscription.borrow());

    leader.close().await?;
    follower.close().await
}

#[tokio::test]
async fn follower_rejects_misplaced_entries() -> Result<()> {
    let _guard = init_tracing()?;

    let dir = tempdir()?;
    let follower = store(dir.path())?;
    follower.create_partition_group("orders", 0, &[0], None)?;
    follower.start()?;

    let sink = follower.get_replicable_store("orders", 0)?;

    let record = |index| {
        Record::builder()
            .partition(0)
            .index(index)
            .timestamp(0)
            .body(Bytes::from_static(b"replicated"))
            .build()
            .map(|record| record.encode())
    };

    let first = record(0)?;
    let length = first.len() as u64;

    assert!(matches!(
        sink.append_entries(Position::new(length), first.clone()).await,
        Err(Error::OutOfBounds { .. })
    ));

    assert!(matches!(
        sink.append_entries(Position::ZERO, record(3)?).await,
        Err(Error::OrderingViolation { .. })
    ));

    let mut corrupt = first.to_vec();
    corrupt[HEADER_SIZE] ^= 0xff;

    assert!(matches!(
        sink.append_entries(Position::ZERO, Bytes::from(corrupt)).await,
        Err(Error::Integrity { .. })
    ));

    assert!(matches!(
        sink.append_entries(Position::ZERO, first.slice(..first.len() - 1)).await,
        Err(Error::MalformedRecord { .. })
    ));

    assert_eq!(Position::ZERO, sink.left_position()?);
    assert_eq!(Position::ZERO, sink.right_position());

    assert_eq!(
        Position::new(length),
        sink.append_entries(Position::ZERO, first).await?
    );

    let consumed = follower.get_store("orders", 0, QosLevel::Receive)?;
    assert!(!consumed.is_degraded());
    assert_eq!(1, consumed.right_index(0)?);
    assert_eq!(
        vec![Bytes::from_static(b"replicated")],
        consumed.read(0, 0, 10, 1_024).messages()
    );

    follower.close().await
}
