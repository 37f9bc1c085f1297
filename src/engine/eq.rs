// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event queue: a bounded, single-producer/single-consumer completion
//! channel with an optional synchronous callback and a wake-up signal
//! for `eq_wait`.

use crate::engine::wake::WakeNotifier;
use crate::engine::wr::Event;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Optional synchronous callback invoked by `invoke_cb` before an event
/// would otherwise be pushed onto the queue. Returning `true` means the
/// callback accepted the event (push is skipped).
pub type EqCallback = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Result of a producer-side `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Ok,
    Full,
}

/// A bounded SPSC event queue. Producer is the progress engine; consumer
/// is the application via `eq_wait`.
pub struct EventQueue {
    slots: ArrayQueue<Event>,
    wake: WakeNotifier,
    callback: parking_lot::RwLock<Option<EqCallback>>,
    dropped: AtomicU64,
}

impl EventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity.max(1)),
            wake: WakeNotifier::new(),
            callback: parking_lot::RwLock::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn set_callback(&self, cb: EqCallback) {
        *self.callback.write() = Some(cb);
    }

    /// Tries the synchronous callback, if one is installed. Returns
    /// `true` if the callback accepted the event (the caller must not
    /// also push it).
    pub fn invoke_cb(&self, event: &Event) -> bool {
        match &*self.callback.read() {
            Some(cb) => cb(event),
            None => false,
        }
    }

    /// Producer-only: enqueue an event. On `Full`, the caller is
    /// responsible for counting the drop and recycling the event.
    pub fn push(&self, event: Event) -> PushResult {
        match self.slots.push(event) {
            Ok(()) => {
                self.wake.notify();
                PushResult::Ok
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushResult::Full
            }
        }
    }

    /// Consumer-only: dequeue one event, if any is pending.
    #[must_use]
    pub fn pop(&self) -> Option<Event> {
        self.slots.pop()
    }

    /// Idempotent wake-up: unblocks a waiter in `eq_wait` without
    /// requiring a pending event (used by `interrupt()`).
    pub fn notify(&self) {
        self.wake.notify();
    }

    /// Blocks up to `timeout` for a wake signal. Returns `true` if
    /// woken by `notify`, `false` on timeout.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wake.wait_timeout(timeout)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of events dropped because the queue was full and no
    /// callback in the completion chain accepted them.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
