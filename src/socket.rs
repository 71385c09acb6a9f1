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

//! Socket plumbing beneath the server interface.
//!
//! The interface accepts any listening stream socket of a supported
//! domain; [`Listener`] and [`Channel`] close over the domain so the
//! rest of the crate is domain-agnostic. [`read_some`] and
//! [`gather_write`] mask `EINTR`, partial transfers, and the
//! peer-closed error family so callers see whole-record semantics.

use crate::error::{ServerError, ServerResult};
use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::socket::{AddressFamily, SockType, SockaddrLike, SockaddrStorage, getsockname, sockopt},
};
use std::{
    io::{self, IoSlice, Read, Write},
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
};

/// Address family of a listening socket, as supported by the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketFamily {
    Inet,
    Inet6,
    Unix,
}

/// A listening stream socket of a supported domain.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Peer address of an accepted connection. Unix-domain peers carry no
/// address the interface filters on.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PeerAddr {
    Inet(SocketAddr),
    Unix,
}

impl PeerAddr {
    pub(crate) fn ip(&self) -> Option<IpAddr> {
        match self {
            PeerAddr::Inet(addr) => Some(addr.ip()),
            PeerAddr::Unix => None,
        }
    }
}

impl Listener {
    /// Takes ownership of an already-listening socket descriptor.
    ///
    /// Fails with `ConstructionRejected` when the descriptor is not a
    /// socket, not a stream socket, not listening, or of an unsupported
    /// domain.
    pub(crate) fn from_owned(fd: OwnedFd) -> ServerResult<(Self, SocketFamily)> {
        let rejected = |reason: &str| ServerError::ConstructionRejected {
            reason: reason.into(),
        };

        let listening = nix::sys::socket::getsockopt(&fd, sockopt::AcceptConn)
            .map_err(|_| rejected("descriptor is not a socket"))?;
        if !listening {
            return Err(rejected("socket is not listening"));
        }
        let sock_type = nix::sys::socket::getsockopt(&fd, sockopt::SockType)
            .map_err(|_| rejected("descriptor is not a socket"))?;
        if sock_type != SockType::Stream {
            return Err(rejected("socket is not a stream socket"));
        }

        let name = getsockname::<SockaddrStorage>(fd.as_raw_fd())
            .map_err(|_| rejected("listening socket has no local name"))?;
        let (listener, family) = match name.family() {
            Some(AddressFamily::Inet) => (Listener::Tcp(TcpListener::from(fd)), SocketFamily::Inet),
            Some(AddressFamily::Inet6) => {
                (Listener::Tcp(TcpListener::from(fd)), SocketFamily::Inet6)
            }
            Some(AddressFamily::Unix) => {
                (Listener::Unix(UnixListener::from(fd)), SocketFamily::Unix)
            }
            _ => return Err(rejected("unsupported socket domain")),
        };
        Ok((listener, family))
    }

    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.set_nonblocking(true),
            Listener::Unix(listener) => listener.set_nonblocking(true),
        }
    }

    /// Accepts one pending connection, or `None` when the backlog is
    /// empty. `EINTR` and aborted handshakes are retried internally.
    pub(crate) fn accept(&self) -> io::Result<Option<(Channel, PeerAddr)>> {
        loop {
            let result = match self {
                Listener::Tcp(listener) => listener
                    .accept()
                    .map(|(stream, addr)| (Channel::Tcp(stream), PeerAddr::Inet(addr))),
                Listener::Unix(listener) => listener
                    .accept()
                    .map(|(stream, _)| (Channel::Unix(stream), PeerAddr::Unix)),
            };
            match result {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(listener) => listener.as_fd(),
            Listener::Unix(listener) => listener.as_fd(),
        }
    }
}

/// A connected stream socket. Reads and writes go through shared
/// references so the engine can read while request handles write.
#[derive(Debug)]
pub(crate) enum Channel {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Channel {
    pub(crate) fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Channel::Tcp(stream) => stream.set_nonblocking(true),
            Channel::Unix(stream) => stream.set_nonblocking(true),
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Tcp(stream) => (&mut &*stream).read(buf),
            Channel::Unix(stream) => (&mut &*stream).read(buf),
        }
    }

    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Channel::Tcp(stream) => (&mut &*stream).write_vectored(bufs),
            Channel::Unix(stream) => (&mut &*stream).write_vectored(bufs),
        }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Channel::Tcp(stream) => stream.as_fd(),
            Channel::Unix(stream) => stream.as_fd(),
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Channel::Tcp(stream) => stream.as_raw_fd(),
            Channel::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

/// How a [`read_some`] call ended.
#[derive(Debug)]
pub(crate) enum ReadDisposition {
    /// The buffer was filled; more data may be pending.
    FilledBuffer,
    /// The socket has no more data for now.
    WouldBlock,
    /// The peer closed the connection in an orderly fashion.
    Eof,
    /// A read error other than interruption or exhaustion.
    Error(io::Error),
}

/// Reads up to `buf.len()` bytes from a nonblocking channel,
/// transparently retrying on interruption by a signal.
///
/// Returns the number of bytes read and the reason reading stopped.
/// A connection reset is reported as `Eof`; data already read is still
/// returned to the caller first.
pub(crate) fn read_some(channel: &Channel, buf: &mut [u8]) -> (usize, ReadDisposition) {
    let mut filled = 0;
    loop {
        match channel.read(&mut buf[filled..]) {
            Ok(0) => return (filled, ReadDisposition::Eof),
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    return (filled, ReadDisposition::FilledBuffer);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return (filled, ReadDisposition::WouldBlock);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                return (filled, ReadDisposition::Eof);
            }
            Err(e) => return (filled, ReadDisposition::Error(e)),
        }
    }
}

/// How a [`gather_write`] call failed.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The peer closed the connection; the bytes were not delivered.
    PeerClosed,
    /// A hard error other than the peer-closed family.
    Os(io::Error),
}

/// Writes every byte of `bufs` to the channel.
///
/// Partial transfers advance through the slice list, interruption by a
/// signal retries, and a full socket buffer waits for writability, so
/// a successful return means the whole gather list reached the kernel.
/// `EPIPE` and `ECONNRESET` are reported as `PeerClosed` rather than
/// as errors.
pub(crate) fn gather_write(
    channel: &Channel, mut bufs: &mut [IoSlice<'_>],
) -> Result<(), WriteError> {
    let mut remaining: usize = bufs.iter().map(|b| b.len()).sum();
    while remaining > 0 {
        match channel.write_vectored(bufs) {
            Ok(0) => return Err(WriteError::PeerClosed),
            Ok(n) => {
                remaining -= n;
                if remaining > 0 {
                    IoSlice::advance_slices(&mut bufs, n);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(channel.as_fd()).map_err(WriteError::Os)?;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                return Err(WriteError::PeerClosed);
            }
            Err(e) => return Err(WriteError::Os(e)),
        }
    }
    Ok(())
}

/// Blocks until `fd` is writable, retrying on interruption.
fn wait_writable(fd: BorrowedFd<'_>) -> io::Result<()> {
    loop {
        let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}
