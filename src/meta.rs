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

//! Internal FastCGI protocol metadata structures and parsing.
//!
//! This module contains the internal structures and constants used
//! for parsing and generating FastCGI protocol messages.

use std::{
    fmt::{self, Display},
    mem::size_of,
};

/// FastCGI protocol version 1
pub(crate) const VERSION_1: u8 = 1;
/// Maximum length for the content of a single FastCGI record
pub(crate) const MAX_LENGTH: usize = 0xffff;
/// Length of a FastCGI header in bytes
pub(crate) const HEADER_LEN: usize = size_of::<Header>();
/// Request id reserved for management records
pub(crate) const NULL_REQUEST_ID: u16 = 0;
/// Bit 0 of the `FCGI_BEGIN_REQUEST` flags byte
pub(crate) const KEEP_CONN: u8 = 1;
/// Content length of a `FCGI_BEGIN_REQUEST` record body
pub(crate) const BEGIN_REQUEST_BODY_LEN: usize = 8;
/// Content length of a `FCGI_END_REQUEST` record body
pub(crate) const END_REQUEST_BODY_LEN: usize = 8;

/// Management variable names answered in `FCGI_GET_VALUES_RESULT`.
pub(crate) const MAX_CONNS: &[u8] = b"FCGI_MAX_CONNS";
pub(crate) const MAX_REQS: &[u8] = b"FCGI_MAX_REQS";
pub(crate) const MPXS_CONNS: &[u8] = b"FCGI_MPXS_CONNS";

/// Zero bytes used to pad emitted records to an eight-byte boundary.
pub(crate) const PADDING: [u8; 7] = [0; 7];

/// Returns the number of padding bytes which aligns `content_length`
/// bytes of content to an eight-byte boundary.
pub(crate) const fn padding_for(content_length: usize) -> usize {
    (8 - content_length % 8) % 8
}

/// FastCGI record types as defined in the protocol specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin request record type
    BeginRequest = 1,
    /// Abort request record type
    AbortRequest = 2,
    /// End request record type
    EndRequest = 3,
    /// Parameters record type
    Params = 4,
    /// Stdin record type
    Stdin = 5,
    /// Stdout record type
    Stdout = 6,
    /// Stderr record type
    Stderr = 7,
    /// Data record type
    Data = 8,
    /// Get values record type
    GetValues = 9,
    /// Get values result record type
    GetValuesResult = 10,
    /// Unknown type record type
    UnknownType = 11,
}

impl RecordType {
    /// Converts a u8 value to RecordType.
    ///
    /// Values outside the defined range map to `UnknownType`; the raw
    /// byte is kept by the record status machine so that the
    /// `FCGI_UNKNOWN_TYPE` reply can carry it.
    pub(crate) fn from_u8(u: u8) -> Self {
        match u {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            _ => RecordType::UnknownType,
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(&(*self as u8), f)
    }
}

/// An eight-byte FastCGI record header.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    /// FastCGI protocol version
    pub(crate) version: u8,
    /// Type of the FastCGI record
    pub(crate) record_type: RecordType,
    /// Request id for this record
    pub(crate) request_id: u16,
    /// Length of the content data
    pub(crate) content_length: u16,
    /// Length of padding data
    pub(crate) padding_length: u8,
    /// Reserved byte
    pub(crate) reserved: u8,
}

impl Header {
    /// Creates a new header for `content_length` bytes of content,
    /// padded to the next eight-byte boundary.
    pub(crate) fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            record_type,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize) as u8,
            reserved: 0,
        }
    }

    /// Serializes the header into its eight-byte wire form.
    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type as u8,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            self.reserved,
        ]
    }

    /// Deserializes a header from its eight-byte wire form.
    #[inline]
    pub(crate) fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: buf[0],
            record_type: RecordType::from_u8(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
            reserved: buf[7],
        }
    }
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Responder role - handles requests and returns responses
    Responder = 1,
    /// Authorizer role - performs authorization checks
    Authorizer = 2,
    /// Filter role - filters data between web server and application
    Filter = 3,
}

impl Role {
    /// Converts a u16 value to a known role.
    ///
    /// Roles outside the defined range return `None`; the interface
    /// still carries them as raw values and leaves the decision to the
    /// application, which may answer with `reject_role`.
    pub fn from_u16(u: u16) -> Option<Self> {
        match u {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// FastCGI protocol status codes carried by `FCGI_END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Request completed successfully
    RequestComplete = 0,
    /// This app can't multiplex connections
    CantMpxConn = 1,
    /// New request rejected; too busy
    Overloaded = 2,
    /// Role value not known
    UnknownRole = 3,
}

/// Decoded body of a `FCGI_BEGIN_REQUEST` record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BeginRequestBody {
    /// The requested role, carried raw so that unknown values survive
    pub(crate) role: u16,
    /// Flags byte (bit 0 = keep-conn flag)
    pub(crate) flags: u8,
}

impl BeginRequestBody {
    /// Decodes the eight-byte body of a begin request record.
    ///
    /// The caller guarantees `content.len() == BEGIN_REQUEST_BODY_LEN`;
    /// header validation rejects begin records of any other length.
    pub(crate) fn decode(content: &[u8]) -> Self {
        Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        }
    }

    /// Whether the client asked for the connection to be kept open
    /// after the request completes.
    pub(crate) fn keep_conn(&self) -> bool {
        self.flags & KEEP_CONN != 0
    }
}

/// Complete `FCGI_END_REQUEST` record, header and body.
#[derive(Debug)]
pub(crate) struct EndRequestRecord {
    /// Request id the record answers
    pub(crate) request_id: u16,
    /// The application status code
    pub(crate) app_status: u32,
    /// The protocol status
    pub(crate) protocol_status: ProtocolStatus,
}

impl EndRequestRecord {
    /// Serializes the record into its sixteen-byte wire form. The body
    /// is eight bytes, so no padding is required.
    pub(crate) fn encode(&self) -> [u8; HEADER_LEN + END_REQUEST_BODY_LEN] {
        let header = Header::new(
            RecordType::EndRequest,
            self.request_id,
            END_REQUEST_BODY_LEN as u16,
        )
        .encode();
        let app = self.app_status.to_be_bytes();
        [
            header[0],
            header[1],
            header[2],
            header[3],
            header[4],
            header[5],
            header[6],
            header[7],
            app[0],
            app[1],
            app[2],
            app[3],
            self.protocol_status as u8,
            0,
            0,
            0,
        ]
    }
}

/// Complete `FCGI_UNKNOWN_TYPE` management record.
#[derive(Debug)]
pub(crate) struct UnknownTypeRecord {
    /// The raw type byte of the record being answered
    pub(crate) raw_type: u8,
}

impl UnknownTypeRecord {
    /// Serializes the record into its sixteen-byte wire form.
    pub(crate) fn encode(&self) -> [u8; HEADER_LEN + 8] {
        let header = Header::new(RecordType::UnknownType, NULL_REQUEST_ID, 8).encode();
        [
            header[0],
            header[1],
            header[2],
            header[3],
            header[4],
            header[5],
            header[6],
            header[7],
            self.raw_type,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
        ]
    }
}
