// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # NNTI - uniform network transport for a distributed HPC runtime
//!
//! A single asynchronous messaging and RDMA abstraction over InfiniBand
//! verbs and MPI, so the rest of the runtime never has to branch on
//! which fabric a given rank was launched with.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use nnti::transport::Transport;
//! use nnti::config::RuntimeConfig;
//!
//! fn main() -> nnti::Result<()> {
//!     let transport = Transport::new(RuntimeConfig::new())?;
//!     transport.start()?;
//!     transport.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          Transport facade                           |
//! |   connect/disconnect | alloc/register | send/put/get/atomic | EQ    |
//! +---------------------------------------------------------------------+
//! |          Progress engine           |        Rendezvous glue         |
//! |   completion dispatch, op records  |   out-of-band connect exchange |
//! +---------------------------------------------------------------------+
//! |                          Provider adapters                          |
//! |   verbs (3 QPs/conn) | MPI (rank + RMA window) | loopback (in-proc)  |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`transport::Transport`] | Entry point: connect, send, put/get, atomics, event queues |
//! | [`core::buffer::Buffer`] | A registered local memory region |
//! | [`core::buffer::RemoteBufferDescriptor`] | A packed, sendable handle to a remote window |
//! | [`engine::eq::EventQueue`] | Where completions land for application polling |
//! | [`engine::wr::WorkRequest`] | One submitted send/put/get/atomic operation |
//!
//! ## Modules overview
//!
//! - [`transport`] - provider-agnostic facade and the verbs/MPI/loopback adapters
//! - [`engine`] - command framing, event queues, work requests, the progress loop
//! - [`core`] - PID/URL addressing, the peer registry, buffers, the freelist
//! - [`connection`] - per-peer connection state machine
//! - [`rendezvous`] - out-of-band connect/disconnect/stats control plane
//! - [`config`] - compile-time constants and the runtime key/value config store
//! - [`error`] - the crate's `Error`/`Result` types
//! - [`logging`] - optional embedder-facing logging facade

// Clippy: No blanket suppressions. Fix issues properly or use inline #[allow] with justification.

extern crate self as nnti;

/// Global configuration (wire-format constants, runtime config store).
pub mod config;
/// Per-peer connection state machine and provider-side resources.
pub mod connection;
/// Addressing, the peer registry, buffers, and the freelist.
pub mod core;
/// Command framing, event queues, work requests, and the progress loop.
pub mod engine;
/// The crate's error taxonomy.
pub mod error;
/// Optional installable logging facade (gated on the `logging` feature).
pub mod logging;
/// Out-of-band connect/disconnect/stats control plane.
pub mod rendezvous;
/// Provider-agnostic facade and the verbs/MPI/loopback adapters.
pub mod transport;

pub use error::{Error, Result};
pub use transport::Transport;

/// NNTI version string.
pub const VERSION: &str = "1.0.10";
