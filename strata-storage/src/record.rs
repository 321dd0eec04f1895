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

//! Physical record framing.
//!
//! Every record in a segment starts with a fixed size, big-endian header:
//!
//! | offset | field     | type |
//! |--------|-----------|------|
//! | 0      | length    | u32  |
//! | 4      | crc       | u32  |
//! | 8      | magic     | u8   |
//! | 9      | flags     | u8   |
//! | 10     | partition | u16  |
//! | 12     | count     | u16  |
//! | 14     | reserved  | u16  |
//! | 16     | index     | u64  |
//! | 24     | timestamp | i64  |
//!
//! The length covers the whole record including the header. The crc is
//! CRC-32/ISCSI over every byte following the crc field.

use crate::{Error, PartitionId, Result, batch, position::Position};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_32_ISCSI, Crc};

pub const HEADER_SIZE: usize = 32;
pub const MAGIC: u8 = 1;

const CRC_OFFSET: usize = 4;
const CHECKSUMMED: usize = CRC_OFFSET + size_of::<u32>();
const BATCH: u8 = 0b0000_0001;

static CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Record header.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Header {
    pub length: u32,
    pub crc: u32,
    pub flags: u8,
    pub partition: PartitionId,
    pub count: u16,
    pub index: u64,
    pub timestamp: i64,
}

impl Header {
    pub fn is_batch(&self) -> bool {
        self.flags & BATCH == BATCH
    }

    /// The logical index following the last message in this record.
    pub fn next_index(&self) -> u64 {
        self.index + u64::from(self.count)
    }

    /// Decode a header from the start of `encoded`, checking the framing
    /// fields only. The crc is verified by [`Record::decode`].
    pub fn decode(encoded: &[u8]) -> Result<Self, &'static str> {
        if encoded.len() < HEADER_SIZE {
            return Err("incomplete header");
        }

        let mut encoded = &encoded[..HEADER_SIZE];

        let length = encoded.get_u32();
        let crc = encoded.get_u32();
        let magic = encoded.get_u8();
        let flags = encoded.get_u8();
        let partition = encoded.get_u16();
        let count = encoded.get_u16();
        let _reserved = encoded.get_u16();
        let index = encoded.get_u64();
        let timestamp = encoded.get_i64();

        if magic != MAGIC {
            return Err("unknown magic");
        }

        if (length as usize) < HEADER_SIZE {
            return Err("length shorter than header");
        }

        if count == 0 {
            return Err("zero message count");
        }

        if flags & BATCH == 0 && count != 1 {
            return Err("single message record with count other than one");
        }

        Ok(Self {
            length,
            crc,
            flags,
            partition,
            count,
            index,
            timestamp,
        })
    }

    fn encode_into(&self, encoded: &mut BytesMut) {
        encoded.put_u32(self.length);
        encoded.put_u32(self.crc);
        encoded.put_u8(MAGIC);
        encoded.put_u8(self.flags);
        encoded.put_u16(self.partition);
        encoded.put_u16(self.count);
        encoded.put_u16(0);
        encoded.put_u64(self.index);
        encoded.put_i64(self.timestamp);
    }
}

/// A complete physical record: header and body.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Record {
    header: Header,
    body: Bytes,
}

impl Record {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn encoded_len(&self) -> usize {
        self.header.length as usize
    }

    /// The logical messages carried by this record.
    pub fn messages(&self) -> Result<Vec<Bytes>> {
        if self.header.is_batch() {
            batch::decode(&self.body, self.header.count)
        } else {
            Ok(vec![self.body.clone()])
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut encoded = BytesMut::with_capacity(self.encoded_len());
        self.header.encode_into(&mut encoded);
        encoded.put_slice(&self.body);
        encoded.freeze()
    }

    /// Decode and verify a record occupying all of `encoded`, read from
    /// `position`.
    pub fn decode(position: Position, encoded: Bytes) -> Result<Self> {
        let header = Header::decode(&encoded)
            .map_err(|reason| Error::MalformedRecord { position, reason })?;

        if header.length as usize != encoded.len() {
            return Err(Error::MalformedRecord {
                position,
                reason: "length differs from stored extent",
            });
        }

        let crc = checksum(&encoded);
        if crc != header.crc {
            return Err(Error::Integrity {
                position,
                reason: format!("crc: {crc:#010x}, expected: {:#010x}", header.crc),
            });
        }

        let body = encoded.slice(HEADER_SIZE..);

        Ok(Self { header, body })
    }
}

/// Checksum of an encoded record, covering everything after the crc field.
pub fn checksum(encoded: &[u8]) -> u32 {
    CRC.checksum(&encoded[CHECKSUMMED.min(encoded.len())..])
}

/// Record builder.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Builder {
    partition: PartitionId,
    index: u64,
    timestamp: i64,
    count: u16,
    batch: bool,
    body: Bytes,
}

impl Builder {
    pub fn partition(self, partition: PartitionId) -> Self {
        Self { partition, ..self }
    }

    pub fn index(self, index: u64) -> Self {
        Self { index, ..self }
    }

    pub fn timestamp(self, timestamp: i64) -> Self {
        Self { timestamp, ..self }
    }

    /// A single message body.
    pub fn body(self, body: Bytes) -> Self {
        Self {
            body,
            count: 1,
            batch: false,
            ..self
        }
    }

    /// A batch body framing `count` messages, see [`crate::batch`].
    pub fn batch(self, body: Bytes, count: u16) -> Self {
        Self {
            body,
            count,
            batch: true,
            ..self
        }
    }

    pub fn build(self) -> Result<Record> {
        if self.batch {
            if self.count == 0 {
                return Err(Error::MalformedBatch {
                    count: 0,
                    reason: "empty batch",
                });
            }

            batch::validate(&self.body, self.count)?;
        }

        let length = u32::try_from(HEADER_SIZE + self.body.len())?;

        let mut header = Header {
            length,
            crc: 0,
            flags: if self.batch { BATCH } else { 0 },
            partition: self.partition,
            count: if self.batch { self.count } else { 1 },
            index: self.index,
            timestamp: self.timestamp,
        };

        let mut encoded = BytesMut::with_capacity(HEADER_SIZE);
        header.encode_into(&mut encoded);

        let mut digest = CRC.digest();
        digest.update(&encoded[CHECKSUMMED..]);
        digest.update(&self.body);
        header.crc = digest.finalize();

        Ok(Record {
            header,
            body: self.body,
        })
    }
}
