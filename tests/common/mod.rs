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

//! Shared test plumbing: tracing setup, serialisation of interface
//! construction, and a byte-level FastCGI client for driving the
//! interface over real sockets.

#![allow(dead_code)]

use fastcgi_server::{Request, Server};
use std::{
    io::Read,
    net::TcpStream,
    sync::{Mutex, MutexGuard, Once, PoisonError},
    time::Duration,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static START: Once = Once::new();

/// Setup function that is only run once, even if called multiple times.
pub fn setup() {
    START.call_once(|| {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

static SERIAL: Mutex<()> = Mutex::new(());

/// Serialises tests constructing an interface: the interface enforces
/// one live instance per process.
pub fn interface_guard() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Short poll bound used when driving the interface in tests.
pub const POLL: Option<Duration> = Some(Duration::from_millis(100));

/// Runs one step of the interface, asserting nothing became ready.
pub fn drive(server: &mut Server) {
    let batch = server.accept_requests(POLL).unwrap();
    assert!(batch.is_empty(), "unexpected ready requests: {batch:?}");
}

/// Steps the interface until a non-empty batch arrives.
pub fn poll_requests(server: &mut Server, attempts: usize) -> Vec<Request> {
    for _ in 0..attempts {
        let batch = server.accept_requests(POLL).unwrap();
        if !batch.is_empty() {
            return batch;
        }
    }
    Vec::new()
}

pub const BEGIN_REQUEST: u8 = 1;
pub const ABORT_REQUEST: u8 = 2;
pub const END_REQUEST: u8 = 3;
pub const PARAMS: u8 = 4;
pub const STDIN: u8 = 5;
pub const STDOUT: u8 = 6;
pub const STDERR: u8 = 7;
pub const DATA: u8 = 8;
pub const GET_VALUES: u8 = 9;
pub const GET_VALUES_RESULT: u8 = 10;
pub const UNKNOWN_TYPE: u8 = 11;

pub const REQUEST_COMPLETE: u8 = 0;
pub const CANT_MPX_CONN: u8 = 1;
pub const OVERLOADED: u8 = 2;
pub const UNKNOWN_ROLE: u8 = 3;

/// Builds one record with eight-byte alignment padding.
pub fn record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let id = request_id.to_be_bytes();
    let len = (content.len() as u16).to_be_bytes();
    let padding = (8 - content.len() % 8) % 8;
    let mut bytes = vec![1, record_type, id[0], id[1], len[0], len[1], padding as u8, 0];
    bytes.extend_from_slice(content);
    bytes.extend(std::iter::repeat_n(0u8, padding));
    bytes
}

pub fn begin_request(request_id: u16, role: u16, flags: u8) -> Vec<u8> {
    let role = role.to_be_bytes();
    record(
        BEGIN_REQUEST,
        request_id,
        &[role[0], role[1], flags, 0, 0, 0, 0, 0],
    )
}

pub fn abort_request(request_id: u16) -> Vec<u8> {
    record(ABORT_REQUEST, request_id, &[])
}

/// Encodes one name-value pair with short or long length prefixes.
pub fn pair(name: &[u8], value: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for len in [name.len(), value.len()] {
        if len < 0x80 {
            bytes.push(len as u8);
        } else {
            bytes.extend_from_slice(&(len as u32 | 0x8000_0000).to_be_bytes());
        }
    }
    bytes.extend_from_slice(name);
    bytes.extend_from_slice(value);
    bytes
}

/// Decodes name-value pairs out of record content.
pub fn decode_pairs(mut content: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut pairs = Vec::new();
    while !content.is_empty() {
        let mut lens = [0usize; 2];
        for len in &mut lens {
            if content[0] < 0x80 {
                *len = content[0] as usize;
                content = &content[1..];
            } else {
                *len = (u32::from_be_bytes(content[..4].try_into().unwrap()) & 0x7fff_ffff)
                    as usize;
                content = &content[4..];
            }
        }
        pairs.push((content[..lens[0]].to_vec(), content[lens[0]..lens[0] + lens[1]].to_vec()));
        content = &content[lens[0] + lens[1]..];
    }
    pairs
}

/// One record as observed on the client side of the wire.
#[derive(Debug)]
pub struct WireRecord {
    pub record_type: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
    pub padding: u8,
}

impl WireRecord {
    /// Total size on the wire, header included.
    pub fn wire_len(&self) -> usize {
        8 + self.content.len() + self.padding as usize
    }
}

/// Reads one complete record, or `None` on orderly end of stream.
pub fn read_record(stream: &mut impl Read) -> Option<WireRecord> {
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        match stream.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return None,
            Ok(0) => panic!("end of stream inside a record header"),
            Ok(n) => filled += n,
            Err(e) => panic!("reading record header: {e}"),
        }
    }
    assert_eq!(header[0], 1, "unexpected protocol version");

    let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding = header[6];
    let mut content = vec![0u8; content_length];
    stream.read_exact(&mut content).unwrap();
    let mut pad = vec![0u8; padding as usize];
    stream.read_exact(&mut pad).unwrap();

    Some(WireRecord {
        record_type: header[1],
        request_id: u16::from_be_bytes([header[2], header[3]]),
        content,
        padding,
    })
}

/// Reads records until end of stream.
pub fn read_to_eof(stream: &mut TcpStream) -> Vec<WireRecord> {
    let mut records = Vec::new();
    while let Some(record) = read_record(stream) {
        records.push(record);
    }
    records
}

/// Asserts the next record is an `FCGI_END_REQUEST` and returns its
/// application and protocol statuses.
pub fn expect_end_request(stream: &mut impl Read, request_id: u16) -> (u32, u8) {
    let record = read_record(stream).expect("expected FCGI_END_REQUEST, got end of stream");
    assert_eq!(record.record_type, END_REQUEST);
    assert_eq!(record.request_id, request_id);
    assert_eq!(record.content.len(), 8);
    let app_status = u32::from_be_bytes(record.content[..4].try_into().unwrap());
    (app_status, record.content[4])
}

/// Asserts the next two records terminate the request's stdout and
/// stderr streams.
pub fn expect_terminal_streams(stream: &mut impl Read, request_id: u16) {
    for record_type in [STDOUT, STDERR] {
        let record = read_record(stream).expect("expected a terminal stream record");
        assert_eq!(record.record_type, record_type);
        assert_eq!(record.request_id, request_id);
        assert!(record.content.is_empty());
    }
}
