// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Progress engine
//!
//! Everything the transport runs on its single cooperative thread: the
//! wire framing for command messages, the bounded event queues
//! delivered to applications, the work-request/op-record bookkeeping
//! for in-flight operations, and the dispatch loop that ties them
//! together.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `wr` | Work requests, completion events, and the completion-destination chain. |
//! | `eq` | Bounded SPSC event queue with optional synchronous callback. |
//! | `command` | Command-message wire framing and the pre-posted command buffer. |
//! | `progress` | The single-threaded completion-dispatch loop. |
//! | `wake` | Low-latency wake notification shared by EQs and the progress loop. |

pub mod command;
pub mod eq;
pub mod progress;
pub mod wake;
pub mod wr;

pub use command::{CommandBuffer, CommandMessage};
pub use eq::{EqCallback, EventQueue, PushResult};
pub use progress::{Completion, CompletionKind, CompletionSource, ProgressEngine};
pub use wake::WakeNotifier;
pub use wr::{dispatch, BufferDestination, Event, EventKind, OpKind, OpRecord, WorkId, WorkRequest, WrFlags, WrState};
