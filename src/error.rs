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

//! Error types and result type aliases for the server interface.
//!
//! Most protocol-level failures are handled locally by the interface
//! (a malformed record is drained and discarded, a malformed request is
//! rejected on the wire); the variants here exist so that those
//! dispositions have names, and so that the few interface-wide failures
//! can surface from public methods.

use std::io;

/// Result type alias for FastCGI server interface operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Error types that can occur while running the server interface.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Wrapper of `std::io::Error`.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The interface could not be constructed from the given socket and
    /// environment. No instance is produced.
    #[error("Interface construction rejected: {reason}")]
    ConstructionRejected {
        /// Why the socket or environment was unacceptable
        reason: String,
    },

    /// The peer closed the connection, or a write was attempted on a
    /// connection already known to be closed.
    #[error("Connection closed by the peer")]
    ConnectionClosed,

    /// A record failed header validation and was drained and discarded.
    #[error("Record invalidated by header validation")]
    MalformedRecord,

    /// A completed `FCGI_PARAMS` stream could not be decoded as a
    /// name-value pair sequence. The request is rejected on the wire.
    #[error("FCGI_PARAMS stream is not a well-formed name-value sequence")]
    MalformedParams,

    /// A `FCGI_BEGIN_REQUEST` arrived while the connection was at its
    /// request limit.
    #[error("New request beyond the per-connection request limit")]
    RequestLimit {
        /// True when the limit is one and the rejection was reported as
        /// `FCGI_CANT_MPX_CONN` rather than `FCGI_OVERLOADED`
        cant_multiplex: bool,
    },

    /// The interface observed a violation of one of its internal
    /// invariants. The failure is latched: every subsequent public
    /// method call returns this error.
    #[error("The interface observed an internal inconsistency and refuses further work")]
    InterfaceCorrupted,

    /// An argument exceeded a protocol limit, such as a record content
    /// length above `u16::MAX`.
    #[error("Argument exceeds a FastCGI protocol limit")]
    InvalidArgument,
}
