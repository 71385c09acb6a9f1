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

//! The FastCGI server interface engine.
//!
//! A [`Server`] owns a listening stream socket, admits and rejects
//! connections, drives per-connection record reassembly, services
//! management records, tracks live requests, and produces a batch of
//! ready [`Request`] handles on each call to
//! [`accept_requests`](Server::accept_requests).
//!
//! Exactly one thread drives `accept_requests` at a time. Handles may
//! be driven from any number of threads; a single interface-state
//! mutex serialises every mutation of the request store, and one write
//! mutex per connection serialises outbound records. The write mutex
//! is never acquired while the interface-state mutex is held.

use crate::{
    error::{ServerError, ServerResult},
    id::IdAllocator,
    meta::{
        self, BeginRequestBody, EndRequestRecord, ProtocolStatus, RecordType, Role,
        UnknownTypeRecord,
    },
    params,
    record::RecordStatus,
    request::{ConnWriter, Request, RequestShared},
    socket::{self, Channel, Listener, ReadDisposition, SocketFamily},
};
use bytes::BytesMut;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    env, io,
    io::IoSlice,
    net::IpAddr,
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{debug, error, warn};

/// Environment variable restricting which web-server addresses may
/// connect. Ignored for unix-domain listening sockets.
const WEB_SERVER_ADDRS: &str = "FCGI_WEB_SERVER_ADDRS";

/// Bytes read from a connection at a time.
const READ_BUFFER_LEN: usize = 8192;

/// One live interface per process; construction of a second is
/// rejected until the first is dropped.
static INTERFACE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// A request identifier: the connection's descriptor paired with the
/// FastCGI request id the client chose. Id zero never names a request.
pub(crate) type RequestKey = (RawFd, u16);

/// Interface state shared with request handles.
pub(crate) struct InterfaceState {
    /// Latched once an internal inconsistency is observed; every
    /// subsequent public method fails with `InterfaceCorrupted`.
    bad: AtomicBool,
    inner: Mutex<StateInner>,
}

impl InterfaceState {
    fn new() -> Self {
        Self {
            bad: AtomicBool::new(false),
            inner: Mutex::new(StateInner::default()),
        }
    }

    /// Acquires the interface-state mutex, refusing when the interface
    /// is corrupted. A poisoned mutex latches corruption.
    pub(crate) fn lock_checked(&self) -> ServerResult<MutexGuard<'_, StateInner>> {
        if self.is_bad() {
            return Err(ServerError::InterfaceCorrupted);
        }
        match self.inner.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => {
                self.latch();
                Err(ServerError::InterfaceCorrupted)
            }
        }
    }

    pub(crate) fn latch(&self) {
        if !self.bad.swap(true, Ordering::AcqRel) {
            error!("Interface latched as corrupted; refusing further work.");
        }
    }

    pub(crate) fn is_bad(&self) -> bool {
        self.bad.load(Ordering::Acquire)
    }
}

/// Everything guarded by the interface-state mutex.
#[derive(Default)]
pub(crate) struct StateInner {
    /// The request store, ordered so a connection's entries are a
    /// contiguous range.
    requests: BTreeMap<RequestKey, StoreEntry>,
    /// Live request count per connection, assigned entries included.
    request_count: HashMap<RawFd, u16>,
    /// Per-connection identifier allocators backing the store slots.
    allocators: HashMap<RawFd, IdAllocator>,
    /// Connections to close once no request entries remain on them.
    closure_requests: BTreeSet<RawFd>,
}

impl StateInner {
    fn has_requests(&self, fd: RawFd) -> bool {
        self.requests
            .range((fd, 0)..=(fd, u16::MAX))
            .next()
            .is_some()
    }

    fn keys_for_connection(&self, fd: RawFd) -> Vec<RequestKey> {
        self.requests
            .range((fd, 0)..=(fd, u16::MAX))
            .map(|(key, _)| *key)
            .collect()
    }

    pub(crate) fn remove_entry(&mut self, key: RequestKey) -> Option<StoreEntry> {
        self.requests.remove(&key)
    }

    pub(crate) fn schedule_closure(&mut self, fd: RawFd) {
        self.closure_requests.insert(fd);
    }

    /// Bookkeeping for a removed store entry: decrements the
    /// connection's request count and releases the entry's slot.
    /// Returns false when either side was inconsistent; the caller
    /// latches corruption.
    pub(crate) fn note_request_removed(&mut self, fd: RawFd, slot: u16) -> bool {
        let count_consistent = match self.request_count.get_mut(&fd) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        };
        let slot_consistent = match self.allocators.get_mut(&fd) {
            Some(allocator) => allocator.release(slot).is_ok(),
            None => false,
        };
        count_consistent && slot_consistent
    }
}

/// One entry of the request store.
pub(crate) enum StoreEntry {
    /// Streams still arriving; owned and mutated by the engine alone.
    Pending(PendingRequest),
    /// Surfaced to the application; the input side is frozen and the
    /// engine only flips the observational flags.
    Assigned(Arc<RequestShared>),
}

/// Per-request buffers and completion flags while the request is
/// being received.
pub(crate) struct PendingRequest {
    role: u16,
    /// True iff the originating begin record did not set keep-conn.
    close_on_completion: bool,
    slot: u16,
    params_stream: BytesMut,
    stdin_stream: BytesMut,
    data_stream: BytesMut,
    params_complete: bool,
    stdin_complete: bool,
    data_complete: bool,
    decoded_params: Option<HashMap<Vec<u8>, Vec<u8>>>,
}

impl PendingRequest {
    fn new(role: u16, close_on_completion: bool, slot: u16) -> Self {
        Self {
            role,
            close_on_completion,
            slot,
            params_stream: BytesMut::new(),
            stdin_stream: BytesMut::new(),
            data_stream: BytesMut::new(),
            params_complete: false,
            stdin_complete: false,
            data_complete: false,
            decoded_params: None,
        }
    }

    fn append_stream(&mut self, record_type: RecordType, bytes: &[u8]) {
        match record_type {
            RecordType::Params => self.params_stream.extend_from_slice(bytes),
            RecordType::Stdin => self.stdin_stream.extend_from_slice(bytes),
            _ => self.data_stream.extend_from_slice(bytes),
        }
    }

    fn stream_complete(&self, record_type: RecordType) -> bool {
        match record_type {
            RecordType::Params => self.params_complete,
            RecordType::Stdin => self.stdin_complete,
            _ => self.data_complete,
        }
    }

    fn set_stream_complete(&mut self, record_type: RecordType) {
        match record_type {
            RecordType::Params => self.params_complete = true,
            RecordType::Stdin => self.stdin_complete = true,
            _ => self.data_complete = true,
        }
    }

    /// The completion predicate: a responder needs params and stdin,
    /// an authorizer only params, a filter (and any unknown role) the
    /// data stream as well.
    fn is_ready(&self) -> bool {
        let role = Role::from_u16(self.role);
        self.params_complete
            && (self.stdin_complete || role == Some(Role::Authorizer))
            && (self.data_complete
                || matches!(role, Some(Role::Responder) | Some(Role::Authorizer)))
    }
}

/// Engine-side state of one connection.
struct Conn {
    channel: Arc<Channel>,
    status: RecordStatus,
    writer: Arc<Mutex<ConnWriter>>,
}

/// How the read-records routine ended for a connection.
enum ReadEnd {
    /// The peer closed the connection, or reading failed hard; the
    /// connection is discarded.
    PeerClosed,
    /// Dispatch observed an invariant violation; the interface is
    /// corrupted.
    Fatal(ServerError),
}

/// The FastCGI server interface.
///
/// See the [crate documentation](crate) for the driving pattern. Only
/// one live instance may exist per process; a second construction is
/// rejected until the first is dropped.
pub struct Server {
    listener: Listener,
    allowed_clients: Option<HashSet<IpAddr>>,
    max_connections: usize,
    max_requests_per_connection: u16,
    app_status_on_abort: u32,
    overload: bool,
    state: Arc<InterfaceState>,
    conns: HashMap<RawFd, Conn>,
}

impl Server {
    /// Constructs the interface around an already-listening stream
    /// socket.
    ///
    /// The socket may be of the inet, inet6, or unix domain; anything
    /// else, or a non-listening or non-stream socket, is rejected. For
    /// inet domains the `FCGI_WEB_SERVER_ADDRS` environment variable,
    /// when set and non-empty, must yield at least one address of the
    /// socket's family; connections from other addresses are then
    /// closed on accept.
    ///
    /// `app_status_on_abort` is the application status reported when
    /// the interface itself ends a request: an abort before assignment
    /// or a handle dropped without completion.
    pub fn new(
        listener: impl Into<OwnedFd>, max_connections: usize, max_requests_per_connection: u16,
        app_status_on_abort: u32,
    ) -> ServerResult<Self> {
        if max_connections == 0 {
            return Err(ServerError::ConstructionRejected {
                reason: "max_connections must be at least 1".into(),
            });
        }
        if max_requests_per_connection == 0 {
            return Err(ServerError::ConstructionRejected {
                reason: "max_requests_per_connection must be at least 1".into(),
            });
        }

        let (listener, family) = Listener::from_owned(listener.into())?;
        let allowed_clients = allowed_clients_from_env(family)?;
        listener.set_nonblocking()?;

        if INTERFACE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServerError::ConstructionRejected {
                reason: "another interface instance is live in this process".into(),
            });
        }

        debug!(
            ?family,
            max_connections, max_requests_per_connection, "Server interface constructed."
        );
        Ok(Self {
            listener,
            allowed_clients,
            max_connections,
            max_requests_per_connection,
            app_status_on_abort,
            overload: false,
            state: Arc::new(InterfaceState::new()),
            conns: HashMap::new(),
        })
    }

    /// Sets the operator overload flag. While set, every new request
    /// is rejected with `FCGI_OVERLOADED`.
    pub fn set_overload(&mut self, overload: bool) {
        self.overload = overload;
    }

    /// The operator overload flag.
    pub fn overload(&self) -> bool {
        self.overload
    }

    /// Number of currently connected client sockets.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// False once the interface has latched an internal inconsistency.
    pub fn interface_status(&self) -> bool {
        !self.state.is_bad()
    }

    /// Admits pending connections, services readable ones, and returns
    /// the batch of requests that became ready for the application.
    ///
    /// Blocks in its poll for up to `timeout`, or indefinitely with
    /// `None`. An empty batch is normal: the poll may have woken for a
    /// new connection or a partial record.
    ///
    /// Exactly one thread may drive this method.
    pub fn accept_requests(&mut self, timeout: Option<Duration>) -> ServerResult<Vec<Request>> {
        if self.state.is_bad() {
            return Err(ServerError::InterfaceCorrupted);
        }

        self.drain_accepts()?;
        self.process_closure_requests()?;

        let (listener_ready, readable) = self.poll_connections(timeout)?;
        if listener_ready {
            self.drain_accepts()?;
        }

        let mut ready = Vec::new();
        for fd in readable {
            let Some(mut conn) = self.conns.remove(&fd) else {
                continue;
            };
            let mut conn_ready = Vec::new();
            let outcome = self.read_records(fd, &mut conn, &mut conn_ready);
            self.conns.insert(fd, conn);
            match outcome {
                Ok(()) => ready.append(&mut conn_ready),
                Err(ReadEnd::PeerClosed) => self.close_connection(fd),
                Err(ReadEnd::Fatal(e)) => {
                    self.state.latch();
                    if let Ok(mut inner) = self.state.inner.lock() {
                        inner.schedule_closure(fd);
                    }
                    return Err(e);
                }
            }
        }

        self.assign_ready(ready)
    }

    /// Accepts until the listen backlog is drained, applying the
    /// address filter and the connection limit.
    fn drain_accepts(&mut self) -> ServerResult<()> {
        while let Some((channel, peer)) = self.listener.accept()? {
            if let Some(allowed) = &self.allowed_clients {
                let permitted = peer.ip().is_some_and(|ip| allowed.contains(&ip));
                if !permitted {
                    debug!(?peer, "Closed connection from disallowed address.");
                    continue;
                }
            }
            if self.conns.len() >= self.max_connections {
                debug!(?peer, "Closed connection beyond the connection limit.");
                continue;
            }

            channel.set_nonblocking()?;
            let fd = channel.as_raw_fd();
            let channel = Arc::new(channel);
            let writer = Arc::new(Mutex::new(ConnWriter::new(Arc::clone(&channel))));
            {
                let mut inner = self.state.lock_checked()?;
                inner.request_count.insert(fd, 0);
                inner.allocators.insert(fd, IdAllocator::new());
            }
            self.conns.insert(
                fd,
                Conn {
                    channel,
                    status: RecordStatus::new(),
                    writer,
                },
            );
            debug!(fd, "Accepted connection.");
        }
        Ok(())
    }

    /// Closes every connection scheduled for closure whose request
    /// entries are all gone. Connections still carrying entries stay
    /// scheduled.
    fn process_closure_requests(&mut self) -> ServerResult<()> {
        let to_close: Vec<RawFd> = {
            let inner = self.state.lock_checked()?;
            inner
                .closure_requests
                .iter()
                .copied()
                .filter(|fd| !inner.has_requests(*fd))
                .collect()
        };
        for fd in to_close {
            self.close_connection(fd);
        }
        Ok(())
    }

    /// Waits for readability on the listener and every connection.
    fn poll_connections(&self, timeout: Option<Duration>) -> ServerResult<(bool, Vec<RawFd>)> {
        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(duration) => {
                let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
        };

        let mut order = Vec::with_capacity(self.conns.len());
        let mut fds = Vec::with_capacity(self.conns.len() + 1);
        fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
        for (&fd, conn) in &self.conns {
            order.push(fd);
            fds.push(PollFd::new(conn.channel.as_fd(), PollFlags::POLLIN));
        }

        loop {
            match poll(&mut fds, poll_timeout) {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }

        let wanted =
            PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        let ready = |poll_fd: &PollFd<'_>| {
            poll_fd
                .revents()
                .is_some_and(|revents| revents.intersects(wanted))
        };
        let listener_ready = ready(&fds[0]);
        let readable = order
            .iter()
            .zip(&fds[1..])
            .filter(|(_, poll_fd)| ready(poll_fd))
            .map(|(&fd, _)| fd)
            .collect();
        Ok((listener_ready, readable))
    }

    /// Reads from one connection until it would block, reassembling
    /// and dispatching records.
    ///
    /// Identifiers of requests that became ready for assignment are
    /// pushed to `ready`. Data received in the same call in which the
    /// peer is found closed is discarded with the connection.
    fn read_records(
        &mut self, fd: RawFd, conn: &mut Conn, ready: &mut Vec<RequestKey>,
    ) -> Result<(), ReadEnd> {
        let mut buf = [0u8; READ_BUFFER_LEN];
        loop {
            let (received, disposition) = socket::read_some(&conn.channel, &mut buf);
            match disposition {
                ReadDisposition::Eof => {
                    debug!(fd, "Connection closed by the peer.");
                    return Err(ReadEnd::PeerClosed);
                }
                ReadDisposition::Error(e) => {
                    warn!(fd, error = %e, "Unrecoverable read error on connection.");
                    return Err(ReadEnd::PeerClosed);
                }
                ReadDisposition::FilledBuffer | ReadDisposition::WouldBlock => {}
            }

            let mut chunk = &buf[..received];
            while !chunk.is_empty() {
                if !conn.status.is_header_complete() {
                    let (taken, header_completed) = conn.status.push_header_bytes(chunk);
                    chunk = &chunk[taken..];
                    if header_completed {
                        self.validate_header(fd, &mut conn.status)
                            .map_err(ReadEnd::Fatal)?;
                    }
                } else if conn.status.content_remaining() > 0 {
                    let taken = conn.status.content_remaining().min(chunk.len());
                    self.route_content(fd, &mut conn.status, &chunk[..taken])
                        .map_err(ReadEnd::Fatal)?;
                    chunk = &chunk[taken..];
                } else {
                    let taken = conn.status.padding_remaining().min(chunk.len());
                    conn.status.advance(taken);
                    chunk = &chunk[taken..];
                }

                if conn.status.is_record_complete() {
                    self.dispatch_complete_record(fd, conn, ready)
                        .map_err(ReadEnd::Fatal)?;
                    conn.status.clear();
                }
            }

            if matches!(disposition, ReadDisposition::WouldBlock) {
                return Ok(());
            }
        }
    }

    /// Header-validation rules, run once the header of a record is
    /// complete. Management records are accepted unconditionally;
    /// everything else must name a known, still-open request stream.
    /// Invalidated records are drained without touching the store.
    fn validate_header(&self, fd: RawFd, status: &mut RecordStatus) -> ServerResult<()> {
        if status.is_management() {
            return Ok(());
        }
        let key = (fd, status.request_id());
        match status.record_type() {
            RecordType::BeginRequest => {
                if status.content_expected() as usize != meta::BEGIN_REQUEST_BODY_LEN {
                    status.invalidate();
                } else if self.state.lock_checked()?.requests.contains_key(&key) {
                    status.invalidate();
                }
            }
            RecordType::AbortRequest => {
                if status.content_expected() != 0 {
                    status.invalidate();
                } else {
                    match self.state.lock_checked()?.requests.get(&key) {
                        None => status.invalidate(),
                        Some(StoreEntry::Assigned(shared))
                            if shared.aborted.load(Ordering::Acquire) =>
                        {
                            status.invalidate()
                        }
                        Some(_) => {}
                    }
                }
            }
            RecordType::Params | RecordType::Stdin | RecordType::Data => {
                match self.state.lock_checked()?.requests.get(&key) {
                    Some(StoreEntry::Pending(pending))
                        if !pending.stream_complete(status.record_type()) => {}
                    _ => status.invalidate(),
                }
            }
            _ => status.invalidate(),
        }
        if status.invalidated() {
            debug!(
                fd,
                id = status.request_id(),
                record_type = status.raw_type(),
                disposition = %ServerError::MalformedRecord,
                "Draining record."
            );
        }
        Ok(())
    }

    /// Routes content bytes of the record in flight: stream content is
    /// appended to the request store, management and begin/abort
    /// bodies stay with the connection, invalidated bytes are dropped.
    fn route_content(
        &self, fd: RawFd, status: &mut RecordStatus, bytes: &[u8],
    ) -> ServerResult<()> {
        if status.invalidated() {
            status.advance(bytes.len());
            return Ok(());
        }
        match status.record_type() {
            RecordType::Params | RecordType::Stdin | RecordType::Data
                if !status.is_management() =>
            {
                let key = (fd, status.request_id());
                let mut inner = self.state.lock_checked()?;
                match inner.requests.get_mut(&key) {
                    Some(StoreEntry::Pending(pending)) => {
                        pending.append_stream(status.record_type(), bytes);
                        status.advance(bytes.len());
                        Ok(())
                    }
                    _ => {
                        // Validated at header completion; absence now
                        // is an invariant violation.
                        self.state.latch();
                        Err(ServerError::InterfaceCorrupted)
                    }
                }
            }
            _ => {
                status.append_content(bytes);
                Ok(())
            }
        }
    }

    /// Complete-record dispatch.
    fn dispatch_complete_record(
        &mut self, fd: RawFd, conn: &mut Conn, ready: &mut Vec<RequestKey>,
    ) -> ServerResult<()> {
        if conn.status.is_management() {
            if conn.status.record_type() == RecordType::GetValues {
                self.answer_get_values(fd, conn);
            } else {
                let reply = UnknownTypeRecord {
                    raw_type: conn.status.raw_type(),
                }
                .encode();
                debug!(
                    fd,
                    record_type = conn.status.raw_type(),
                    "Answered unknown management record."
                );
                self.send_to_connection(fd, &conn.writer, &reply);
            }
            return Ok(());
        }
        if conn.status.invalidated() {
            return Ok(());
        }

        match conn.status.record_type() {
            RecordType::BeginRequest => self.dispatch_begin_request(fd, conn),
            RecordType::AbortRequest => self.dispatch_abort_request(fd, conn, ready),
            RecordType::Params | RecordType::Stdin | RecordType::Data => {
                self.dispatch_stream_record(fd, conn, ready)
            }
            _ => {
                // Header validation admits no other type this far.
                self.state.latch();
                Err(ServerError::InterfaceCorrupted)
            }
        }
    }

    /// Answers `FCGI_GET_VALUES` with the three defined names, in a
    /// single padded record. Unknown names are omitted; a malformed
    /// name-value stream is ignored.
    fn answer_get_values(&self, fd: RawFd, conn: &Conn) {
        let Some(names) = params::decode(conn.status.content()) else {
            debug!(fd, "Ignored malformed FCGI_GET_VALUES record.");
            return;
        };
        let max_conns = self.max_connections.to_string();
        let max_reqs =
            (self.max_connections as u64 * self.max_requests_per_connection as u64).to_string();

        let mut pairs: Vec<(&[u8], &[u8])> = Vec::with_capacity(3);
        if names.contains_key(meta::MAX_CONNS) {
            pairs.push((meta::MAX_CONNS, max_conns.as_bytes()));
        }
        if names.contains_key(meta::MAX_REQS) {
            pairs.push((meta::MAX_REQS, max_reqs.as_bytes()));
        }
        if names.contains_key(meta::MPXS_CONNS) {
            pairs.push((meta::MPXS_CONNS, b"1"));
        }

        debug!(fd, answered = pairs.len(), "Answered FCGI_GET_VALUES.");
        match params::encode_record(RecordType::GetValuesResult, meta::NULL_REQUEST_ID, &pairs) {
            Ok(record) => self.send_to_connection(fd, &conn.writer, &record),
            // Unreachable with the three defined names; kept so growth
            // of the name table cannot overflow a record silently.
            Err(_) => warn!(fd, "FCGI_GET_VALUES_RESULT exceeded a single record."),
        }
    }

    /// Creates a store entry for a new request, or rejects it when the
    /// connection is at its request limit or the interface is
    /// overloaded.
    fn dispatch_begin_request(&mut self, fd: RawFd, conn: &mut Conn) -> ServerResult<()> {
        let id = conn.status.request_id();
        let body = BeginRequestBody::decode(conn.status.content());

        let rejection = {
            let mut inner = self.state.lock_checked()?;
            let state = &mut *inner;
            let Some(count) = state.request_count.get_mut(&fd) else {
                self.state.latch();
                return Err(ServerError::InterfaceCorrupted);
            };
            if *count >= self.max_requests_per_connection {
                Some(if self.max_requests_per_connection == 1 {
                    ProtocolStatus::CantMpxConn
                } else {
                    ProtocolStatus::Overloaded
                })
            } else if self.overload {
                Some(ProtocolStatus::Overloaded)
            } else {
                let Some(allocator) = state.allocators.get_mut(&fd) else {
                    self.state.latch();
                    return Err(ServerError::InterfaceCorrupted);
                };
                let slot = match allocator.allocate() {
                    Ok(slot) => slot,
                    Err(e) => {
                        self.state.latch();
                        return Err(e);
                    }
                };
                *count += 1;
                state.requests.insert(
                    (fd, id),
                    StoreEntry::Pending(PendingRequest::new(body.role, !body.keep_conn(), slot)),
                );
                None
            }
        };

        match rejection {
            Some(protocol_status) => {
                let disposition = ServerError::RequestLimit {
                    cant_multiplex: protocol_status == ProtocolStatus::CantMpxConn,
                };
                debug!(fd, id, ?protocol_status, %disposition, "Rejected new request.");
                let record = EndRequestRecord {
                    request_id: id,
                    app_status: 1,
                    protocol_status,
                }
                .encode();
                self.send_to_connection(fd, &conn.writer, &record);
            }
            None => {
                debug!(fd, id, role = body.role, keep_conn = body.keep_conn(), "Began request.");
            }
        }
        Ok(())
    }

    /// Flags an assigned request as aborted, or ends and removes an
    /// unassigned one.
    fn dispatch_abort_request(
        &mut self, fd: RawFd, conn: &mut Conn, ready: &mut Vec<RequestKey>,
    ) -> ServerResult<()> {
        let id = conn.status.request_id();
        let key = (fd, id);

        let mut consistent = true;
        let send_end_request = {
            let mut inner = self.state.lock_checked()?;
            match inner.requests.remove(&key) {
                // Removed by its handle between header validation and
                // now; the abort can be ignored.
                None => false,
                Some(StoreEntry::Assigned(shared)) => {
                    shared.aborted.store(true, Ordering::Release);
                    inner.requests.insert(key, StoreEntry::Assigned(shared));
                    debug!(fd, id, "Noted abort for assigned request.");
                    false
                }
                Some(StoreEntry::Pending(pending)) => {
                    if pending.close_on_completion {
                        inner.schedule_closure(fd);
                    }
                    // The request may have completed earlier in this
                    // same read call without being assigned yet.
                    ready.retain(|ready_key| *ready_key != key);
                    consistent = inner.note_request_removed(fd, pending.slot);
                    true
                }
            }
        };
        if !consistent {
            self.state.latch();
            return Err(ServerError::InterfaceCorrupted);
        }
        if send_end_request {
            debug!(fd, id, "Ended request aborted before assignment.");
            let record = EndRequestRecord {
                request_id: id,
                app_status: self.app_status_on_abort,
                protocol_status: ProtocolStatus::RequestComplete,
            }
            .encode();
            self.send_to_connection(fd, &conn.writer, &record);
        }
        Ok(())
    }

    /// Handles a stream record at completion. Content was routed as it
    /// arrived, so only terminal (zero-length) records act here: they
    /// complete the stream, and once the completion predicate holds
    /// the params stream is decoded and the request yielded, or the
    /// request is rejected when its params are malformed.
    fn dispatch_stream_record(
        &mut self, fd: RawFd, conn: &mut Conn, ready: &mut Vec<RequestKey>,
    ) -> ServerResult<()> {
        if conn.status.content_expected() != 0 {
            return Ok(());
        }
        let record_type = conn.status.record_type();
        let id = conn.status.request_id();
        let key = (fd, id);

        #[derive(Clone, Copy)]
        enum Outcome {
            StillArriving,
            Ready,
            MalformedParams { close: bool, slot: u16 },
        }

        let mut consistent = true;
        let outcome = {
            let mut inner = self.state.lock_checked()?;
            let Some(StoreEntry::Pending(pending)) = inner.requests.get_mut(&key) else {
                self.state.latch();
                return Err(ServerError::InterfaceCorrupted);
            };
            pending.set_stream_complete(record_type);
            // Yield only on the transition into readiness: a responder
            // already yielded in this batch stays yielded when a stray
            // terminal record completes a stream its role never needed.
            let outcome = if !pending.is_ready() || pending.decoded_params.is_some() {
                Outcome::StillArriving
            } else {
                match params::decode(&pending.params_stream) {
                    Some(map) => {
                        pending.decoded_params = Some(map);
                        Outcome::Ready
                    }
                    None => Outcome::MalformedParams {
                        close: pending.close_on_completion,
                        slot: pending.slot,
                    },
                }
            };
            if let Outcome::MalformedParams { close, slot } = outcome {
                inner.requests.remove(&key);
                if close {
                    inner.schedule_closure(fd);
                }
                consistent = inner.note_request_removed(fd, slot);
            }
            outcome
        };
        if !consistent {
            self.state.latch();
            return Err(ServerError::InterfaceCorrupted);
        }

        match outcome {
            Outcome::StillArriving => {}
            Outcome::Ready => {
                debug!(fd, id, "Request ready for assignment.");
                ready.push(key);
            }
            Outcome::MalformedParams { .. } => {
                debug!(fd, id, disposition = %ServerError::MalformedParams, "Rejected request.");
                let record = EndRequestRecord {
                    request_id: id,
                    app_status: 1,
                    protocol_status: ProtocolStatus::RequestComplete,
                }
                .encode();
                self.send_to_connection(fd, &conn.writer, &record);
            }
        }
        Ok(())
    }

    /// Moves ready store entries into the assigned state and builds
    /// their application handles.
    fn assign_ready(&mut self, ready: Vec<RequestKey>) -> ServerResult<Vec<Request>> {
        let mut requests = Vec::with_capacity(ready.len());
        for key in ready {
            let Some(conn) = self.conns.get(&key.0) else {
                self.state.latch();
                return Err(ServerError::InterfaceCorrupted);
            };
            let writer = Arc::clone(&conn.writer);
            let shared = {
                let mut inner = self.state.lock_checked()?;
                let Some(StoreEntry::Pending(pending)) = inner.requests.remove(&key) else {
                    self.state.latch();
                    return Err(ServerError::InterfaceCorrupted);
                };
                let Some(params) = pending.decoded_params else {
                    self.state.latch();
                    return Err(ServerError::InterfaceCorrupted);
                };
                let shared = Arc::new(RequestShared {
                    key,
                    role: pending.role,
                    keep_conn: !pending.close_on_completion,
                    slot: pending.slot,
                    params,
                    stdin: pending.stdin_stream.freeze(),
                    data: pending.data_stream.freeze(),
                    aborted: AtomicBool::new(false),
                    connection_closed: AtomicBool::new(false),
                    app_status_on_abort: self.app_status_on_abort,
                });
                inner
                    .requests
                    .insert(key, StoreEntry::Assigned(Arc::clone(&shared)));
                shared
            };
            debug!(fd = key.0, id = key.1, "Assigned request to the application.");
            requests.push(Request::new(shared, writer, Arc::clone(&self.state)));
        }
        Ok(requests)
    }

    /// Closes a connection and purges all of its state. Assigned
    /// requests on it are flagged so their handles observe the closure
    /// and their writes fail.
    fn close_connection(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.remove(&fd) {
            let mut writer = conn.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.shut();
            drop(writer);
            debug!(fd, "Closed connection.");
        }
        let Ok(mut inner) = self.state.lock_checked() else {
            return;
        };
        inner.request_count.remove(&fd);
        inner.allocators.remove(&fd);
        inner.closure_requests.remove(&fd);
        for key in inner.keys_for_connection(fd) {
            if let Some(StoreEntry::Assigned(shared)) = inner.requests.remove(&key) {
                shared.connection_closed.store(true, Ordering::Release);
                shared.aborted.store(true, Ordering::Release);
            }
        }
    }

    /// Writes pre-encoded record bytes on a connection, scheduling the
    /// connection for closure when the peer is gone.
    fn send_to_connection(&self, fd: RawFd, writer: &Mutex<ConnWriter>, bytes: &[u8]) {
        let sent = {
            let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
            writer.send(&mut [IoSlice::new(bytes)])
        };
        if !sent {
            debug!(fd, "Send failed; scheduling connection closure.");
            if let Ok(mut inner) = self.state.lock_checked() {
                inner.schedule_closure(fd);
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close_connection(fd);
        }
        INTERFACE_ACTIVE.store(false, Ordering::Release);
    }
}

/// Derives the client address allow-list from `FCGI_WEB_SERVER_ADDRS`.
///
/// Unix-domain sockets ignore the variable. For inet domains a set and
/// non-empty value must yield at least one address of the socket's
/// family, or construction is rejected.
fn allowed_clients_from_env(family: SocketFamily) -> ServerResult<Option<HashSet<IpAddr>>> {
    if family == SocketFamily::Unix {
        return Ok(None);
    }
    let Ok(raw) = env::var(WEB_SERVER_ADDRS) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }

    let allowed: HashSet<IpAddr> = raw
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .filter(|ip: &IpAddr| match family {
            SocketFamily::Inet => ip.is_ipv4(),
            SocketFamily::Inet6 => ip.is_ipv6(),
            SocketFamily::Unix => false,
        })
        .collect();
    if allowed.is_empty() {
        return Err(ServerError::ConstructionRejected {
            reason: format!(
                "{WEB_SERVER_ADDRS} holds no address of the listening socket's family"
            ),
        });
    }
    Ok(Some(allowed))
}
