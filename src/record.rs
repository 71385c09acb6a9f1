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

//! Per-connection record reassembly state.
//!
//! A connection delivers arbitrary byte chunks; [`RecordStatus`] tracks
//! the position inside the current record (header, content, padding)
//! across chunks and exposes the parsed header fields once the first
//! eight bytes are in. Routing of content bytes and dispatch of
//! complete records is the interface engine's job; the engine marks
//! records that fail header validation and this state then drains them
//! without keeping their bytes.

use crate::meta::{self, Header, RecordType};

/// Reassembly state for the record currently in flight on one
/// connection. Cleared after every complete record.
#[derive(Debug)]
pub(crate) struct RecordStatus {
    /// Wire bytes of the header, filled as they arrive.
    header: [u8; meta::HEADER_LEN],
    /// Bytes received of the current record, header included.
    bytes_received: usize,
    content_expected: u16,
    padding_expected: u8,
    record_type: RecordType,
    /// The unparsed type byte, kept for `FCGI_UNKNOWN_TYPE` replies.
    raw_type: u8,
    request_id: u16,
    /// Set when header validation failed; the record is received in
    /// full and discarded.
    invalidated_by_header: bool,
    /// Content that is not appended to a request stream: management
    /// content and begin/abort bodies.
    content_buffer: Vec<u8>,
}

impl RecordStatus {
    pub(crate) fn new() -> Self {
        Self {
            header: [0; meta::HEADER_LEN],
            bytes_received: 0,
            content_expected: 0,
            padding_expected: 0,
            record_type: RecordType::UnknownType,
            raw_type: 0,
            request_id: 0,
            invalidated_by_header: false,
            content_buffer: Vec::new(),
        }
    }

    /// Resets the state for the next record on the connection.
    pub(crate) fn clear(&mut self) {
        self.header = [0; meta::HEADER_LEN];
        self.bytes_received = 0;
        self.content_expected = 0;
        self.padding_expected = 0;
        self.record_type = RecordType::UnknownType;
        self.raw_type = 0;
        self.request_id = 0;
        self.invalidated_by_header = false;
        self.content_buffer.clear();
    }

    pub(crate) fn is_header_complete(&self) -> bool {
        self.bytes_received >= meta::HEADER_LEN
    }

    pub(crate) fn is_record_complete(&self) -> bool {
        self.is_header_complete()
            && self.bytes_received
                == meta::HEADER_LEN
                    + self.content_expected as usize
                    + self.padding_expected as usize
    }

    /// Copies header bytes out of `chunk`, returning how many were
    /// consumed and whether this call completed the header. On
    /// completion the header fields are parsed and ready to validate.
    pub(crate) fn push_header_bytes(&mut self, chunk: &[u8]) -> (usize, bool) {
        let remaining = meta::HEADER_LEN - self.bytes_received;
        let taken = remaining.min(chunk.len());
        self.header[self.bytes_received..self.bytes_received + taken]
            .copy_from_slice(&chunk[..taken]);
        self.bytes_received += taken;

        let completed = self.is_header_complete();
        if completed {
            let header = Header::decode(&self.header);
            self.content_expected = header.content_length;
            self.padding_expected = header.padding_length;
            self.record_type = header.record_type;
            self.raw_type = self.header[1];
            self.request_id = header.request_id;
        }
        (taken, completed)
    }

    /// Content bytes still expected for the current record.
    pub(crate) fn content_remaining(&self) -> usize {
        (meta::HEADER_LEN + self.content_expected as usize).saturating_sub(self.bytes_received)
    }

    /// Padding bytes still expected for the current record.
    pub(crate) fn padding_remaining(&self) -> usize {
        (meta::HEADER_LEN + self.content_expected as usize + self.padding_expected as usize)
            .saturating_sub(self.bytes_received)
    }

    /// Advances past `count` content or padding bytes that the engine
    /// has routed (or discarded) itself.
    pub(crate) fn advance(&mut self, count: usize) {
        self.bytes_received += count;
    }

    /// Appends record content that stays local to the connection.
    pub(crate) fn append_content(&mut self, bytes: &[u8]) {
        self.content_buffer.extend_from_slice(bytes);
        self.bytes_received += bytes.len();
    }

    pub(crate) fn content(&self) -> &[u8] {
        &self.content_buffer
    }

    pub(crate) fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub(crate) fn raw_type(&self) -> u8 {
        self.raw_type
    }

    pub(crate) fn request_id(&self) -> u16 {
        self.request_id
    }

    pub(crate) fn content_expected(&self) -> u16 {
        self.content_expected
    }

    /// Whether the current record is a management record.
    pub(crate) fn is_management(&self) -> bool {
        self.request_id == meta::NULL_REQUEST_ID
    }

    /// Marks the record as failing header validation; its remaining
    /// bytes are drained and discarded.
    pub(crate) fn invalidate(&mut self) {
        self.invalidated_by_header = true;
    }

    pub(crate) fn invalidated(&self) -> bool {
        self.invalidated_by_header
    }
}
