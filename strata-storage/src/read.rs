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

use crate::{
    Error, ErrorCode, PartitionId, Result, index::Index, segment::LogReader,
};
use bytes::Bytes;
use tracing::debug;

/// Messages read from a partition.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReadResult {
    code: ErrorCode,
    messages: Vec<Bytes>,
    eop: bool,
}

impl ReadResult {
    pub(crate) fn error(code: ErrorCode) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    pub fn messages(&self) -> &[Bytes] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Bytes> {
        self.messages
    }

    /// Whether the read reached the right index observed when it started.
    pub fn eop(&self) -> bool {
        self.eop
    }

    pub(crate) fn bytes(&self) -> usize {
        self.messages.iter().map(Bytes::len).sum()
    }
}

/// Read up to `max_messages` messages of at most `max_bytes` in total from
/// `from`, always returning the first message available.
pub(crate) fn read(
    index: &Index,
    log: &LogReader,
    partition: PartitionId,
    from: u64,
    max_messages: usize,
    max_bytes: usize,
) -> Result<ReadResult> {
    let right_index = index.right_index(partition)?;

    if from == right_index {
        return Ok(ReadResult {
            eop: true,
            ..Default::default()
        });
    }

    let entries = index.entries_from(partition, from, max_messages.max(1))?;

    let mut messages = Vec::new();
    let mut bytes = 0;
    let mut next = from;

    'entries: for entry in entries {
        if entry.index >= right_index {
            break;
        }

        let record = match log.read_record(entry.position) {
            Ok(record) => record,

            Err(Error::OutOfBounds { .. }) if entry.position < log.start()? => {
                debug!(partition, from, position = %entry.position, "retired");

                if !messages.is_empty() {
                    break;
                }

                return Err(Error::PositionOverflow {
                    partition,
                    index: from,
                    left_index: index.left_index(partition)?,
                    right_index,
                });
            }

            Err(error) => return Err(error),
        };
        let header = record.header();

        if header.partition != partition || header.index != entry.index {
            return Err(Error::Integrity {
                position: entry.position,
                reason: format!(
                    "index entry: {partition}/{}, record: {}/{}",
                    entry.index, header.partition, header.index
                ),
            });
        }

        let skip = usize::try_from(next - entry.index)?;

        for message in record.messages()?.into_iter().skip(skip) {
            if messages.len() >= max_messages
                || (!messages.is_empty() && bytes + message.len() > max_bytes)
            {
                break 'entries;
            }

            bytes += message.len();
            messages.push(message);
            next += 1;
        }
    }

    let eop = next >= right_index;
    debug!(partition, from, next, right_index, bytes, eop);

    Ok(ReadResult {
        code: ErrorCode::None,
        messages,
        eop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        index::IndexWriter,
        position::Position,
        record::Record,
        segment::{LogWriter, SegmentedLog},
    };
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn append(log: &mut LogWriter, index: &mut IndexWriter, message: u64) -> Result<()> {
        let encoded = Record::builder()
            .partition(0)
            .index(message)
            .body(Bytes::from(format!("message-{message}")))
            .build()?
            .encode();

        let position = log.append(&encoded)?;

        index
            .append(0, message, position, u32::try_from(encoded.len())?, 1)
            .map(|_| ())
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn retired_record_is_overflow() -> Result<()> {
        let dir = tempdir()?;

        let mut log = SegmentedLog::new(dir.path(), 64).create()?;
        let mut writer = IndexWriter::create(dir.path(), &[0])?;

        for message in 0..3 {
            append(&mut log, &mut writer, message)?;
        }

        _ = log.flush()?;

        let index = writer.index().clone();
        let reader = log.reader();

        assert_eq!(3, read(&index, &reader, 0, 0, 10, 1024)?.messages().len());

        let start = log.purge_before(log.position())?;
        assert_eq!(start, reader.start()?);
        assert_eq!(0, index.left_index(0)?);

        assert!(matches!(
            read(&index, &reader, 0, 0, 10, 1024),
            Err(Error::PositionOverflow {
                partition: 0,
                index: 0,
                left_index: 0,
                right_index: 3,
            })
        ));

        let tail = read(&index, &reader, 0, 2, 10, 1024)?;
        assert_eq!(
            vec![Bytes::from_static(b"message-2")],
            tail.messages().to_vec()
        );
        assert!(tail.eop());

        Ok(())
    }
}
