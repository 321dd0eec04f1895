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

//! Batch body codec.
//!
//! A batch body is a sequence of messages, each prefixed with its length as
//! a big-endian `u32`. The number of messages is carried by the record
//! header rather than the body.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

const FRAME_PREFIX: usize = size_of::<u32>();

/// Length prefix and concatenate `messages`, returning the body and the
/// number of messages it carries.
pub fn encode<I>(messages: I) -> Result<(Bytes, u16)>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut body = BytesMut::new();
    let mut count = 0u16;

    for message in messages {
        let message = message.as_ref();

        count = count.checked_add(1).ok_or(Error::MalformedBatch {
            count,
            reason: "too many messages",
        })?;

        body.put_u32(u32::try_from(message.len())?);
        body.put_slice(message);
    }

    if count == 0 {
        return Err(Error::MalformedBatch {
            count,
            reason: "empty batch",
        });
    }

    debug!(count, len = body.len());

    Ok((body.freeze(), count))
}

/// Split a batch body into exactly `count` messages.
///
/// The returned buffers share storage with `body`.
pub fn decode(body: &Bytes, count: u16) -> Result<Vec<Bytes>> {
    let mut messages = Vec::with_capacity(usize::from(count));
    let mut offset = 0;

    while offset < body.len() {
        if messages.len() == usize::from(count) {
            return Err(Error::MalformedBatch {
                count,
                reason: "trailing bytes",
            });
        }

        if body.len() - offset < FRAME_PREFIX {
            return Err(Error::MalformedBatch {
                count,
                reason: "truncated frame length",
            });
        }

        let length = usize::try_from((&body[offset..offset + FRAME_PREFIX]).get_u32())?;
        offset += FRAME_PREFIX;

        if body.len() - offset < length {
            return Err(Error::MalformedBatch {
                count,
                reason: "truncated frame",
            });
        }

        messages.push(body.slice(offset..offset + length));
        offset += length;
    }

    if messages.len() != usize::from(count) {
        return Err(Error::MalformedBatch {
            count,
            reason: "frame count differs from batch size",
        });
    }

    Ok(messages)
}

/// Check that `body` frames exactly `count` messages without copying them.
pub fn validate(body: &[u8], count: u16) -> Result<()> {
    let mut remaining = body;
    let mut frames = 0usize;

    while remaining.has_remaining() {
        if remaining.remaining() < FRAME_PREFIX {
            return Err(Error::MalformedBatch {
                count,
                reason: "truncated frame length",
            });
        }

        let length = usize::try_from(remaining.get_u32())?;

        if remaining.remaining() < length {
            return Err(Error::MalformedBatch {
                count,
                reason: "truncated frame",
            });
        }

        remaining.advance(length);
        frames += 1;
    }

    if frames == usize::from(count) {
        Ok(())
    } else {
        Err(Error::MalformedBatch {
            count,
            reason: "frame count differs from batch size",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn three_messages() -> Result<()> {
        let (body, count) = encode(["a", "bb", "ccc"])?;
        assert_eq!(3, count);
        assert_eq!(3 * FRAME_PREFIX + 6, body.len());

        validate(&body, count)?;

        assert_eq!(
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"bb"),
                Bytes::from_static(b"ccc")
            ],
            decode(&body, count)?
        );

        Ok(())
    }

    #[test]
    fn empty_messages_are_framed() -> Result<()> {
        let (body, count) = encode(["", "", "xyz", ""])?;
        assert_eq!(4, count);

        let messages = decode(&body, count)?;
        assert_eq!(4, messages.len());
        assert!(messages[0].is_empty());
        assert_eq!(Bytes::from_static(b"xyz"), messages[2]);

        Ok(())
    }

    #[test]
    fn empty_batch() {
        assert!(matches!(
            encode(Vec::<Bytes>::new()),
            Err(Error::MalformedBatch { count: 0, .. })
        ));
    }

    #[test]
    fn count_mismatch() -> Result<()> {
        let (body, _) = encode(["a", "bb", "ccc"])?;

        assert!(matches!(
            decode(&body, 4),
            Err(Error::MalformedBatch { count: 4, .. })
        ));

        assert!(matches!(
            decode(&body, 2),
            Err(Error::MalformedBatch { count: 2, .. })
        ));

        assert!(validate(&body, 2).is_err());

        Ok(())
    }

    #[test]
    fn truncated_frame() -> Result<()> {
        let (body, count) = encode(["abcdef", "ghi"])?;
        let truncated = body.slice(..body.len() - 1);

        assert!(decode(&truncated, count).is_err());
        assert!(validate(&truncated, count).is_err());

        let torn_prefix = body.slice(..FRAME_PREFIX + 6 + 2);
        assert!(validate(&torn_prefix, count).is_err());

        Ok(())
    }
}
