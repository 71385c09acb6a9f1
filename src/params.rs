// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! FastCGI name-value pair encoding and decoding.
//!
//! `FCGI_PARAMS` and `FCGI_GET_VALUES` content is a sequence of pairs,
//! each prefixed by a name length and a value length. A length below
//! 128 is one byte; larger lengths are four bytes big-endian with the
//! high bit set, bounding every length by `2^31 - 1`.

use crate::{
    error::{ServerError, ServerResult},
    meta::{self, Header, RecordType},
};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// Decodes a complete name-value byte stream into a map.
///
/// Returns `None` when a length prefix or the content it announces
/// overruns the buffer. A later pair with a repeated name replaces the
/// earlier one.
pub(crate) fn decode(bytes: &[u8]) -> Option<HashMap<Vec<u8>, Vec<u8>>> {
    let mut pairs = HashMap::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (name_length, consumed) = decode_length(rest)?;
        rest = &rest[consumed..];
        let (value_length, consumed) = decode_length(rest)?;
        rest = &rest[consumed..];
        if rest.len() < name_length + value_length {
            return None;
        }
        let name = rest[..name_length].to_vec();
        let value = rest[name_length..name_length + value_length].to_vec();
        rest = &rest[name_length + value_length..];
        pairs.insert(name, value);
    }
    Some(pairs)
}

/// Decodes one length prefix, returning the length and the number of
/// prefix bytes consumed.
fn decode_length(bytes: &[u8]) -> Option<(usize, usize)> {
    let first = *bytes.first()?;
    if first < 0x80 {
        Some((first as usize, 1))
    } else {
        if bytes.len() < 4 {
            return None;
        }
        let length = u32::from_be_bytes([first & 0x7f, bytes[1], bytes[2], bytes[3]]);
        Some((length as usize, 4))
    }
}

/// Appends one encoded name-value pair to `buf`.
pub(crate) fn encode_pair(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    encode_length(buf, name.len());
    encode_length(buf, value.len());
    buf.put_slice(name);
    buf.put_slice(value);
}

/// Appends one encoded length prefix to `buf`.
fn encode_length(buf: &mut BytesMut, length: usize) {
    if length < 0x80 {
        buf.put_u8(length as u8);
    } else {
        buf.put_u32(length as u32 | 0x8000_0000);
    }
}

/// Encodes `pairs` as the content of a single record of `record_type`,
/// headed and padded to an eight-byte boundary.
///
/// Fails with `InvalidArgument` when the encoded content exceeds the
/// per-record limit of `2^16 - 1` bytes.
pub(crate) fn encode_record(
    record_type: RecordType, request_id: u16, pairs: &[(&[u8], &[u8])],
) -> ServerResult<Vec<u8>> {
    let mut content = BytesMut::new();
    for (name, value) in pairs {
        encode_pair(&mut content, name, value);
    }
    if content.len() > meta::MAX_LENGTH {
        return Err(ServerError::InvalidArgument);
    }

    let header = Header::new(record_type, request_id, content.len() as u16);
    let padding = header.padding_length as usize;
    let mut record = Vec::with_capacity(meta::HEADER_LEN + content.len() + padding);
    record.extend_from_slice(&header.encode());
    record.extend_from_slice(&content);
    record.extend_from_slice(&meta::PADDING[..padding]);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_short_and_long_lengths() {
        let mut buf = BytesMut::new();
        encode_pair(&mut buf, b"K", b"V");
        let long_value = vec![b'x'; 0x90];
        encode_pair(&mut buf, b"LONG", &long_value);

        let pairs = decode(&buf).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[b"K".as_slice()], b"V");
        assert_eq!(pairs[b"LONG".as_slice()], long_value);
    }

    #[test]
    fn decode_empty_stream() {
        assert_eq!(decode(&[]), Some(HashMap::new()));
    }

    #[test]
    fn decode_name_only_pairs() {
        let mut buf = BytesMut::new();
        encode_pair(&mut buf, b"FCGI_MAX_CONNS", b"");
        let pairs = decode(&buf).unwrap();
        assert_eq!(pairs[b"FCGI_MAX_CONNS".as_slice()], b"");
    }

    #[test]
    fn decode_rejects_overrunning_content() {
        // Name length 4 announced, one byte of content present.
        assert_eq!(decode(&[4, 0, b'a']), None);
    }

    #[test]
    fn decode_rejects_truncated_long_prefix() {
        assert_eq!(decode(&[0x80, 0x00]), None);
    }

    #[test]
    fn encode_record_is_padded() {
        let record =
            encode_record(RecordType::GetValuesResult, 0, &[(b"FCGI_MPXS_CONNS", b"1")]).unwrap();
        assert_eq!(record.len() % 8, 0);

        let header = Header::decode(&record[..meta::HEADER_LEN].try_into().unwrap());
        assert_eq!(header.record_type, RecordType::GetValuesResult);
        assert_eq!(header.request_id, 0);
        assert_eq!(
            meta::HEADER_LEN + header.content_length as usize + header.padding_length as usize,
            record.len()
        );

        let content = &record[meta::HEADER_LEN..meta::HEADER_LEN + header.content_length as usize];
        let pairs = decode(content).unwrap();
        assert_eq!(pairs[b"FCGI_MPXS_CONNS".as_slice()], b"1");
    }

    #[test]
    fn encode_record_rejects_oversized_content() {
        let value = vec![0u8; meta::MAX_LENGTH];
        let result = encode_record(RecordType::GetValuesResult, 0, &[(b"N", &value)]);
        assert!(matches!(result, Err(ServerError::InvalidArgument)));
    }
}
