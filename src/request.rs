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

//! Application-facing FastCGI request handles.
//!
//! A [`Request`] is created exclusively by the interface once every
//! input stream of a request has terminated. It owns a half-open write
//! channel back to the client and may outlive the interface: after the
//! interface is gone its writes simply return `false`.

use crate::{
    error::ServerError,
    meta::{self, EndRequestRecord, Header, ProtocolStatus, RecordType},
    server::{InterfaceState, RequestKey},
    socket::{self, Channel, WriteError},
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    io::IoSlice,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, warn};

/// Write half of a connection, shared by the interface and every
/// request handle on the connection.
///
/// The mutex around this value is the per-connection write mutex: it
/// serialises whole gather lists, so records from concurrent handles
/// never interleave inside a record. Shutting the writer drops the
/// channel reference; once every reference is gone the descriptor
/// closes, so no handle can observe a reused descriptor as its own.
#[derive(Debug)]
pub(crate) struct ConnWriter {
    channel: Option<Arc<Channel>>,
}

impl ConnWriter {
    pub(crate) fn new(channel: Arc<Channel>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    /// Marks the connection as closed for writing and releases the
    /// writer's hold on the descriptor.
    pub(crate) fn shut(&mut self) {
        self.channel = None;
    }

    /// Writes a full gather list, or reports that the connection is
    /// unusable. Detecting a closed or failed peer shuts the writer so
    /// later calls fail fast.
    pub(crate) fn send(&mut self, bufs: &mut [IoSlice<'_>]) -> bool {
        let Some(channel) = &self.channel else {
            return false;
        };
        match socket::gather_write(channel, bufs) {
            Ok(()) => true,
            Err(WriteError::PeerClosed) => {
                debug!(disposition = %ServerError::ConnectionClosed, "Write not delivered.");
                self.shut();
                false
            }
            Err(WriteError::Os(e)) => {
                warn!(error = %e, "Unrecoverable write error on connection.");
                self.shut();
                false
            }
        }
    }
}

/// Request state shared between a handle and the interface.
///
/// The input side is frozen at assignment; the interface only flips
/// the observational flags afterwards.
pub(crate) struct RequestShared {
    pub(crate) key: RequestKey,
    pub(crate) role: u16,
    pub(crate) keep_conn: bool,
    /// Internal per-connection slot backing the identifier allocator.
    pub(crate) slot: u16,
    pub(crate) params: HashMap<Vec<u8>, Vec<u8>>,
    pub(crate) stdin: Bytes,
    pub(crate) data: Bytes,
    /// Set by the interface when an `FCGI_ABORT_REQUEST` is observed,
    /// and on connection closure.
    pub(crate) aborted: AtomicBool,
    pub(crate) connection_closed: AtomicBool,
    pub(crate) app_status_on_abort: u32,
}

/// A complete FastCGI request, ready to be answered.
///
/// Handles are moved-only and may be driven from any thread. Input
/// observers never block; output calls may block on the connection
/// socket and are serialised per connection.
///
/// Dropping a handle without completing it completes the request with
/// the interface's configured abort status.
pub struct Request {
    shared: Arc<RequestShared>,
    writer: Arc<Mutex<ConnWriter>>,
    state: Arc<InterfaceState>,
    completed: bool,
}

impl Request {
    pub(crate) fn new(
        shared: Arc<RequestShared>, writer: Arc<Mutex<ConnWriter>>, state: Arc<InterfaceState>,
    ) -> Self {
        Self {
            shared,
            writer,
            state,
            completed: false,
        }
    }

    /// The decoded `FCGI_PARAMS` name-value pairs of the request.
    pub fn params(&self) -> &HashMap<Vec<u8>, Vec<u8>> {
        &self.shared.params
    }

    /// The buffered `FCGI_STDIN` stream.
    pub fn stdin(&self) -> &[u8] {
        &self.shared.stdin
    }

    /// The buffered `FCGI_DATA` stream.
    pub fn data(&self) -> &[u8] {
        &self.shared.data
    }

    /// The role requested by the client, as the raw protocol value.
    ///
    /// Unknown roles are carried through; [`reject_role`] answers them.
    ///
    /// [`reject_role`]: Request::reject_role
    pub fn role(&self) -> u16 {
        self.shared.role
    }

    /// Whether the client asked for the connection to be kept open
    /// after this request completes.
    pub fn keep_conn(&self) -> bool {
        self.shared.keep_conn
    }

    /// The FastCGI request id the client chose for this request.
    pub fn fcgi_id(&self) -> u16 {
        self.shared.key.1
    }

    /// True once the interface has observed an `FCGI_ABORT_REQUEST`
    /// for this request, or its connection has closed.
    ///
    /// The interface never acts on an abort of an assigned request by
    /// itself; honoring it is the application's decision.
    pub fn abort_status(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
            || self.shared.connection_closed.load(Ordering::Acquire)
    }

    /// Writes bytes to the request's `FCGI_STDOUT` stream.
    ///
    /// The bytes are framed as one or more records of at most
    /// `2^16 - 1` content bytes each, padded to an eight-byte boundary,
    /// and written atomically with respect to other writers on the
    /// connection. Returns `false` without blocking when the request
    /// has completed or the connection is known to be closed.
    pub fn write_stdout(&mut self, data: &[u8]) -> bool {
        self.write_stream(RecordType::Stdout, data)
    }

    /// Writes bytes to the request's `FCGI_STDERR` stream.
    ///
    /// Framing and failure behavior match [`write_stdout`].
    ///
    /// [`write_stdout`]: Request::write_stdout
    pub fn write_stderr(&mut self, data: &[u8]) -> bool {
        self.write_stream(RecordType::Stderr, data)
    }

    /// Completes the request: terminates both output streams and sends
    /// `FCGI_END_REQUEST` with `FCGI_REQUEST_COMPLETE` and the given
    /// application status.
    ///
    /// Completing an already-completed request returns `false` and
    /// performs no I/O. After completion every output call fails.
    pub fn complete(&mut self, app_status: u32) -> bool {
        self.finish(ProtocolStatus::RequestComplete, app_status)
    }

    /// Rejects the request's role: terminates both output streams and
    /// sends `FCGI_END_REQUEST` with `FCGI_UNKNOWN_ROLE`.
    ///
    /// Like [`complete`], this is idempotent and ends the handle's
    /// write ability.
    ///
    /// [`complete`]: Request::complete
    pub fn reject_role(&mut self, app_status: u32) -> bool {
        self.finish(ProtocolStatus::UnknownRole, app_status)
    }

    fn write_stream(&mut self, record_type: RecordType, data: &[u8]) -> bool {
        if self.completed {
            return false;
        }
        if data.is_empty() {
            // An empty record would terminate the stream; completion
            // owns the terminal records.
            return true;
        }

        let id = self.fcgi_id();
        let headers: Vec<[u8; meta::HEADER_LEN]> = data
            .chunks(meta::MAX_LENGTH)
            .map(|chunk| Header::new(record_type, id, chunk.len() as u16).encode())
            .collect();
        let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(headers.len() * 3);
        for (header, chunk) in headers.iter().zip(data.chunks(meta::MAX_LENGTH)) {
            slices.push(IoSlice::new(header));
            slices.push(IoSlice::new(chunk));
            let padding = meta::padding_for(chunk.len());
            if padding > 0 {
                slices.push(IoSlice::new(&meta::PADDING[..padding]));
            }
        }

        let sent = self.lock_writer().send(&mut slices);
        if !sent {
            self.schedule_connection_closure();
        }
        sent
    }

    /// Emits the terminal records and returns the request's slot to
    /// the interface.
    fn finish(&mut self, protocol_status: ProtocolStatus, app_status: u32) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;

        let id = self.fcgi_id();
        let stdout_end = Header::new(RecordType::Stdout, id, 0).encode();
        let stderr_end = Header::new(RecordType::Stderr, id, 0).encode();
        let end_request = EndRequestRecord {
            request_id: id,
            app_status,
            protocol_status,
        }
        .encode();
        let sent = {
            let mut slices = [
                IoSlice::new(&stdout_end),
                IoSlice::new(&stderr_end),
                IoSlice::new(&end_request),
            ];
            self.lock_writer().send(&mut slices)
        };
        debug!(
            id,
            ?protocol_status,
            app_status,
            sent,
            "Request completed."
        );

        self.return_to_interface();
        sent
    }

    /// The completion handshake: removes the store entry, releases the
    /// request count and identifier slot, and schedules the connection
    /// for closure when the client did not ask to keep it.
    fn return_to_interface(&self) {
        let Ok(mut inner) = self.state.lock_checked() else {
            return;
        };
        let key = self.shared.key;
        if inner.remove_entry(key).is_none() {
            // The interface already purged the connection.
            return;
        }
        let consistent = inner.note_request_removed(key.0, self.shared.slot);
        if !self.shared.keep_conn {
            inner.schedule_closure(key.0);
        }
        drop(inner);
        if !consistent {
            self.state.latch();
        }
    }

    fn schedule_connection_closure(&self) {
        if let Ok(mut inner) = self.state.lock_checked() {
            inner.schedule_closure(self.shared.key.0);
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, ConnWriter> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Request")
            .field("fcgi_id", &self.fcgi_id())
            .field("role", &self.shared.role)
            .field("keep_conn", &self.shared.keep_conn)
            .field("params", &self.shared.params.len())
            .field("stdin", &self.shared.stdin.len())
            .field("data", &self.shared.data.len())
            .field("completed", &self.completed)
            .finish()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.completed {
            let app_status = self.shared.app_status_on_abort;
            self.finish(ProtocolStatus::RequestComplete, app_status);
        }
    }
}
