// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error taxonomy.
//!
//! Errors are grouped into four classes, mirroring the recovery
//! strategy a caller should apply:
//!
//! - **Transient**: retry is meaningful (timeouts, would-block, interrupts).
//! - **PeerScoped**: the local process is fine, but a specific peer/connection
//!   is unusable; other peers are unaffected.
//! - **Programmer**: caller misuse (bad handle, invalid argument, buffer
//!   already freed). Not recoverable by retrying.
//! - **Fatal**: local resource exhaustion or provider failure; the transport
//!   instance should be torn down.

use std::fmt;

/// Status code returned by `Error::code`, stable across provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    TimedOut,
    Again,
    Interrupted,
    Io,
    NoMemory,
    InvalidArgument,
    NotFound,
    NotConnected,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Debug)]
pub enum Error {
    // --- Transient: retry may succeed ---
    /// An `eq_wait` or rendezvous call exceeded its deadline.
    TimedOut,
    /// Operation would block (non-blocking poll found nothing).
    WouldBlock,
    /// A blocking call was interrupted (e.g. by a signal).
    Interrupted,

    // --- PeerScoped: this connection/peer is unusable ---
    /// The named peer is not present in the registry.
    PeerNotFound(String),
    /// The connection transitioned to the `Error` state.
    ConnectionFailed { peer: String, reason: String },
    /// The remote end closed or reset the connection.
    ConnectionClosed(String),
    /// Rendezvous control-plane retries were exhausted.
    RendezvousExhausted { target: String, attempts: u32 },

    // --- Programmer: caller misuse ---
    /// A handle (buffer, connection, event queue) did not resolve.
    InvalidHandle(&'static str),
    /// An argument failed validation (e.g. zero-length buffer, bad offset).
    InvalidArgument(String),
    /// A URL failed to parse per the `transport://host:port/path` grammar.
    MalformedUrl(String),
    /// A remote buffer descriptor's declared size exceeds the provider's bound.
    DescriptorTooLarge { size: usize, max: usize },

    // --- Fatal: local resource exhaustion or provider failure ---
    /// A freelist or command-buffer pool has no slots available.
    ResourceExhausted(&'static str),
    /// Memory registration with the provider failed.
    RegistrationFailed(String),
    /// The underlying provider (verbs/MPI) reported an unrecoverable error.
    ProviderError(String),
    /// An I/O error bubbled up from a socket or file operation.
    Io(std::io::Error),
}

impl Error {
    /// Maps this error onto a small, stable status-code surface suitable
    /// for FFI or logging dashboards.
    #[must_use]
    pub fn code(&self) -> StatusCode {
        match self {
            Error::TimedOut => StatusCode::TimedOut,
            Error::WouldBlock => StatusCode::Again,
            Error::Interrupted => StatusCode::Interrupted,
            Error::PeerNotFound(_) => StatusCode::NotFound,
            Error::ConnectionFailed { .. } | Error::ConnectionClosed(_) => {
                StatusCode::NotConnected
            }
            Error::RendezvousExhausted { .. } => StatusCode::TimedOut,
            Error::InvalidHandle(_)
            | Error::InvalidArgument(_)
            | Error::MalformedUrl(_)
            | Error::DescriptorTooLarge { .. } => StatusCode::InvalidArgument,
            Error::ResourceExhausted(_) => StatusCode::NoMemory,
            Error::RegistrationFailed(_) | Error::ProviderError(_) => StatusCode::Io,
            Error::Io(_) => StatusCode::Io,
        }
    }

    /// True if a caller retrying the same operation might succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TimedOut | Error::WouldBlock | Error::Interrupted)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TimedOut => write!(f, "operation timed out"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Interrupted => write!(f, "operation interrupted"),
            Error::PeerNotFound(pid) => write!(f, "peer not found: {pid}"),
            Error::ConnectionFailed { peer, reason } => {
                write!(f, "connection to {peer} failed: {reason}")
            }
            Error::ConnectionClosed(peer) => write!(f, "connection to {peer} closed"),
            Error::RendezvousExhausted { target, attempts } => write!(
                f,
                "rendezvous with {target} exhausted after {attempts} attempts"
            ),
            Error::InvalidHandle(kind) => write!(f, "invalid {kind} handle"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::MalformedUrl(url) => write!(f, "malformed url: {url}"),
            Error::DescriptorTooLarge { size, max } => {
                write!(f, "descriptor too large: {size} bytes (max {max})")
            }
            Error::ResourceExhausted(pool) => write!(f, "{pool} pool exhausted"),
            Error::RegistrationFailed(msg) => write!(f, "memory registration failed: {msg}"),
            Error::ProviderError(msg) => write!(f, "provider error: {msg}"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => Error::WouldBlock,
            std::io::ErrorKind::Interrupted => Error::Interrupted,
            std::io::ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::Io(e),
        }
    }
}
