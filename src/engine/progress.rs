// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded cooperative progress loop.
//!
//! Everything that isn't provider I/O runs on the thread that calls
//! [`ProgressEngine::run`] or [`ProgressEngine::poll_once`]: decoding
//! completions, running the completion-destination chain, reposting
//! command-buffer slots, and driving rendezvous continuations.
//! Application threads only ever run user callbacks from an `eq_wait`
//! drain path, never concurrently with this loop.

use crate::core::buffer::{Buffer, BufferId};
use crate::core::freelist::Freelist;
use crate::core::pid::Pid;
use crate::core::registry::Registry;
use crate::engine::eq::EventQueue;
use crate::engine::wake::WakeNotifier;
use crate::engine::wr::{dispatch, BufferDestination, Event, EventKind, OpRecord, WrState};
use crate::error::StatusCode;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cap on the ring of recently-finished completions kept for a
/// `wait(wid, timeout)` caller that arrives after its event already
/// fired, so waiting never requires an unbounded per-op allocation.
const RECENT_COMPLETIONS_CAPACITY: usize = 4096;

/// Maps a submitted op's kind to the [`EventKind`] its terminal event
/// should carry when the progress loop completes it out of band (peer
/// failure, cancellation) rather than from a real provider completion.
fn event_kind_for_op(op: crate::engine::wr::OpKind) -> EventKind {
    use crate::engine::wr::OpKind;
    match op {
        OpKind::Send => EventKind::Send,
        OpKind::Put => EventKind::Put,
        OpKind::Get => EventKind::Get,
        OpKind::Fadd => EventKind::Fadd,
        OpKind::Cswap => EventKind::Cswap,
    }
}

/// The completion class a provider reports back to the progress loop,
/// matching the dispatch table of §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    RecvEager,
    RecvRendezvous,
    RecvUnexpected,
    SendEager,
    SendRendezvous,
    AckReceived,
    RdmaWrite,
    RdmaRead,
    Atomic,
}

/// A provider-reported completion, decoded enough for the progress loop
/// to act on without further provider calls.
#[derive(Debug, Clone)]
pub struct Completion {
    pub kind: CompletionKind,
    pub peer: Pid,
    /// The command-buffer slot this completion concerns, for RECV classes.
    pub slot: Option<usize>,
    /// The engine-assigned op id this completion concerns, for
    /// initiator-side SEND/RDMA/ATOMIC classes and for `AckReceived`
    /// (where it is looked up by `src_op_id` instead and this is unset).
    pub op_id: Option<u64>,
    /// Correlates an ACK back to the send it completes.
    pub src_op_id: Option<u32>,
    pub bytes: u64,
    pub status: StatusCode,
}

/// Feeds the progress loop provider completions. Implemented per
/// provider (verbs completion queue, MPI probe/test, or the in-process
/// loopback mailbox).
pub trait CompletionSource: Send + Sync {
    /// Returns the next completion without blocking, if any is ready.
    fn try_next(&self) -> Option<Completion>;
}

/// A not-yet-delivered unexpected receive, correlated to an
/// [`Event::context`] id so a later `next_unexpected`/`get_unexpected`
/// call can find the provider and slot that still hold its bytes.
pub struct PendingUnexpected {
    pub peer: Pid,
    pub slot: usize,
    pub rendezvous: bool,
}

/// Owns in-flight operation bookkeeping and runs the single-threaded
/// progress loop over whatever [`CompletionSource`] the active provider
/// supplies.
pub struct ProgressEngine {
    registry: Arc<Registry>,
    buffers: Arc<DashMap<BufferId, Arc<Buffer>>>,
    ops: DashMap<u64, Arc<OpRecord>>,
    ops_by_src_op_id: DashMap<u32, u64>,
    unexpected_eq: parking_lot::RwLock<Option<Arc<EventQueue>>>,
    pending_unexpected: DashMap<u64, PendingUnexpected>,
    next_unexpected_id: AtomicU64,
    dropped_events: AtomicU64,
    /// Receives every event that the dispatch chain (§4.8) could not
    /// place anywhere, so steady-state drops recycle instead of leaking.
    dropped_pool: Freelist<Event>,
    running: AtomicBool,
    wake: Arc<WakeNotifier>,
    next_op_id: AtomicU64,
    /// Completed op ids already removed from `ops`, kept a little longer
    /// so a `wait(wid, timeout)` caller that arrives after the event
    /// already fired still observes it instead of blocking forever.
    recent: Mutex<VecDeque<(u64, Event)>>,
}

impl ProgressEngine {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        buffers: Arc<DashMap<BufferId, Arc<Buffer>>>,
        freelist_size: usize,
    ) -> ProgressEngine {
        ProgressEngine {
            registry,
            buffers,
            ops: DashMap::new(),
            ops_by_src_op_id: DashMap::new(),
            unexpected_eq: parking_lot::RwLock::new(None),
            pending_unexpected: DashMap::new(),
            next_unexpected_id: AtomicU64::new(1),
            dropped_events: AtomicU64::new(0),
            dropped_pool: Freelist::new(freelist_size),
            running: AtomicBool::new(false),
            wake: Arc::new(WakeNotifier::new()),
            next_op_id: AtomicU64::new(1),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_COMPLETIONS_CAPACITY)),
        }
    }

    /// Number of dropped-completion slots currently parked in the reuse
    /// pool, for the freelist-monotonicity property under steady load.
    #[must_use]
    pub fn dropped_pool_len(&self) -> usize {
        self.dropped_pool.len()
    }

    /// Configured capacity of the dropped-completion reuse pool.
    #[must_use]
    pub fn dropped_pool_capacity(&self) -> usize {
        self.dropped_pool.capacity()
    }

    pub fn set_unexpected_eq(&self, eq: Arc<EventQueue>) {
        *self.unexpected_eq.write() = Some(eq);
    }

    #[must_use]
    pub fn next_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a submitted operation so a later completion can find it
    /// by op id (or, for long sends, by `src_op_id` when its ACK arrives).
    pub fn track(&self, record: Arc<OpRecord>) {
        if record.wr.op == crate::engine::wr::OpKind::Send {
            self.ops_by_src_op_id.insert(record.src_op_id, record.id);
        }
        self.ops.insert(record.id, record);
    }

    #[must_use]
    pub fn lookup(&self, id: u64) -> Option<Arc<OpRecord>> {
        self.ops.get(&id).map(|e| e.value().clone())
    }

    fn untrack(&self, id: u64) {
        if let Some((_, record)) = self.ops.remove(&id) {
            self.ops_by_src_op_id.remove(&record.src_op_id);
        }
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Unblocks a thread parked in `run`'s idle backoff without requiring
    /// a real completion (used by the facade's `interrupt()`).
    pub fn interrupt(&self) {
        self.wake.notify();
    }

    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.notify();
    }

    /// Drains and dispatches every completion currently ready, without
    /// blocking. Returns the number dispatched.
    pub fn poll_once(&self, source: &dyn CompletionSource) -> usize {
        let mut n = 0;
        while let Some(completion) = source.try_next() {
            self.dispatch_one(completion);
            n += 1;
        }
        n
    }

    /// Runs until [`ProgressEngine::request_stop`] is called, backing off
    /// from a tight poll to a bounded sleep when idle (§4.10).
    pub fn run(&self, source: &dyn CompletionSource) {
        self.running.store(true, Ordering::Release);
        let mut backoff = Duration::from_micros(1);
        const MAX_BACKOFF: Duration = Duration::from_micros(100);
        while self.running.load(Ordering::Acquire) {
            let did_work = self.poll_once(source) > 0;
            if did_work {
                backoff = Duration::from_micros(1);
                continue;
            }
            self.wake.wait_timeout(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Removes and returns the pending unexpected-receive record for
    /// `id`, if any remains. Called once by the facade's
    /// `next_unexpected`/`get_unexpected` when it is ready to fetch the
    /// bytes; a second call for the same id finds nothing, matching the
    /// "deliver exactly once" contract of an unexpected receive.
    pub(crate) fn take_pending_unexpected(&self, id: u64) -> Option<PendingUnexpected> {
        self.pending_unexpected.remove(&id).map(|(_, v)| v)
    }

    /// Routes a receive completion that the provider could not place
    /// against any posted buffer through the unexpected-receive EQ,
    /// recording enough to later complete delivery via
    /// [`ProgressEngine::take_pending_unexpected`] plus
    /// [`crate::transport::provider::Provider::complete_unexpected`].
    fn push_unexpected_event(&self, completion: &Completion, rendezvous: bool) {
        let guard = self.unexpected_eq.read();
        let Some(eq) = guard.as_ref() else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            self.dropped_pool.push(self.event_from_completion(completion, EventKind::Recv, 0));
            log::warn!("unexpected receive from {} with no eq configured", completion.peer);
            return;
        };

        let id = self.next_unexpected_id.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = completion.slot {
            self.pending_unexpected.insert(
                id,
                PendingUnexpected {
                    peer: completion.peer,
                    slot,
                    rendezvous,
                },
            );
        }

        let event = self.event_from_completion(completion, EventKind::Recv, id);
        if !eq.invoke_cb(&event) {
            use crate::engine::eq::PushResult;
            if eq.push(event) != PushResult::Ok {
                self.pending_unexpected.remove(&id);
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                self.dropped_pool.push(event);
                log::warn!("unexpected-receive event dropped: eq full");
            }
        }
    }

    fn event_from_completion(&self, completion: &Completion, kind: EventKind, context: u64) -> Event {
        Event {
            result: completion.status,
            kind,
            peer: completion.peer,
            length: completion.bytes,
            start: 0,
            offset: 0,
            context,
        }
    }

    fn finish_op(&self, id: u64, event: Event) {
        let Some(record) = self.lookup(id) else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            self.dropped_pool.push(event);
            return;
        };
        record.set_state(WrState::Done);
        let buffer_eq = self
            .buffers
            .get(&record.wr.local_buffer)
            .and_then(|b| b.value().eq().cloned());
        let buffer_dest = BufferDestination { eq: buffer_eq.as_ref() };
        if !dispatch(&record.wr, &buffer_dest, event, &self.dropped_events) {
            self.dropped_pool.push(event);
        }
        self.untrack(id);
        self.remember_recent(id, event);
    }

    /// Records a just-finished op's terminal event in a bounded ring, so
    /// a `wait(wid, timeout)` call that arrives after the completion
    /// already dispatched can still observe it once instead of blocking
    /// until its timeout.
    fn remember_recent(&self, id: u64, event: Event) {
        let mut recent = self.recent.lock();
        if recent.len() >= RECENT_COMPLETIONS_CAPACITY {
            recent.pop_front();
        }
        recent.push_back((id, event));
    }

    /// Looks up (without removing) a recently-finished op's terminal
    /// event, for callers that missed the live dispatch.
    #[must_use]
    pub fn recent_result(&self, id: u64) -> Option<Event> {
        self.recent.lock().iter().find(|(rid, _)| *rid == id).map(|(_, e)| *e)
    }

    /// `true` if `id` is still tracked as in-flight (submitted, not yet completed).
    #[must_use]
    pub fn is_in_flight(&self, id: u64) -> bool {
        self.ops.contains_key(&id)
    }

    /// Best-effort cancel: forgets the op record so a later completion
    /// finds nothing to dispatch to (and is dropped and counted). Per
    /// §5, a WR that the provider has already posted cannot truly be
    /// revoked; this only ever removes bookkeeping this engine owns.
    #[must_use]
    pub fn forget(&self, id: u64) -> bool {
        self.ops.remove(&id).is_some()
    }

    /// Completes every in-flight op addressed to `peer` with a non-OK
    /// event, for the peer-scoped error path (§7): once a connection
    /// moves to `error`, nothing further should be left waiting on it.
    pub fn fail_ops_for_peer(&self, peer: Pid, status: StatusCode) {
        let ids: Vec<u64> = self
            .ops
            .iter()
            .filter(|e| e.value().wr.peer == peer)
            .map(|e| *e.key())
            .collect();
        for id in ids {
            let kind = self
                .lookup(id)
                .map(|r| event_kind_for_op(r.wr.op))
                .unwrap_or(EventKind::Send);
            let event = Event {
                result: status,
                kind,
                peer,
                length: 0,
                start: 0,
                offset: 0,
                context: 0,
            };
            self.finish_op(id, event);
        }
    }

    /// `true` if any tracked op still references `buffer` as its local
    /// buffer, used by `unregister_memory` to refuse tearing down a
    /// buffer with outstanding operations (§4.3).
    #[must_use]
    pub fn has_ops_referencing_buffer(&self, buffer: BufferId) -> bool {
        self.ops.iter().any(|e| e.value().wr.local_buffer == buffer)
    }

    /// The oldest still-undelivered unexpected receive, if any, for
    /// `next_unexpected` callers that have not already pulled a specific
    /// [`Event`] out of an EQ.
    #[must_use]
    pub(crate) fn take_oldest_pending_unexpected(&self) -> Option<(u64, PendingUnexpected)> {
        let oldest = self.pending_unexpected.iter().map(|e| *e.key()).min()?;
        self.pending_unexpected.remove(&oldest).map(|(id, v)| (id, v))
    }

    fn dispatch_one(&self, completion: Completion) {
        match completion.kind {
            CompletionKind::RecvEager => {
                // This provider never posts a target buffer ahead of
                // time (§4.10's "unexpected" path), so every eager
                // receive is, in practice, unexpected; route it through
                // the same machinery so `next_unexpected` can fetch it.
                self.push_unexpected_event(&completion, false);
            }
            CompletionKind::RecvRendezvous => {
                self.push_unexpected_event(&completion, true);
            }
            CompletionKind::RecvUnexpected => {
                self.push_unexpected_event(&completion, false);
            }
            CompletionKind::SendEager => {
                if let Some(id) = completion.op_id {
                    let event = self.event_from_completion(&completion, EventKind::Send, 0);
                    self.finish_op(id, event);
                }
            }
            CompletionKind::SendRendezvous => {
                if let Some(id) = completion.op_id {
                    if let Some(record) = self.lookup(id) {
                        record.set_state(WrState::RdmaRtsComplete);
                    }
                }
                log::trace!("rendezvous header sent to {}, awaiting ack", completion.peer);
            }
            CompletionKind::AckReceived => {
                if let Some(src_op_id) = completion.src_op_id {
                    if let Some(id) = self.ops_by_src_op_id.get(&src_op_id).map(|e| *e) {
                        if let Some(record) = self.lookup(id) {
                            record.set_state(WrState::AckReceived);
                        }
                        let event = self.event_from_completion(&completion, EventKind::Send, 0);
                        self.finish_op(id, event);
                    } else {
                        log::warn!("ack received for unknown src_op_id {src_op_id}");
                    }
                }
            }
            CompletionKind::RdmaWrite => {
                if let Some(id) = completion.op_id {
                    let event = self.event_from_completion(&completion, EventKind::Put, 0);
                    self.finish_op(id, event);
                }
            }
            CompletionKind::RdmaRead => {
                if let Some(id) = completion.op_id {
                    let event = self.event_from_completion(&completion, EventKind::Get, 0);
                    self.finish_op(id, event);
                }
            }
            CompletionKind::Atomic => {
                if let Some(id) = completion.op_id {
                    // Big-endian reply byte-swap, if the provider did not
                    // already normalize it, is the provider adapter's
                    // concern (it owns the raw reply buffer layout); by
                    // the time a `Completion` reaches here `bytes` already
                    // carries the host-order result.
                    let kind = self.lookup(id).map(|r| event_kind_for_op(r.wr.op)).unwrap_or(EventKind::Fadd);
                    let event = self.event_from_completion(&completion, kind, 0);
                    self.finish_op(id, event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::BufferId as Bid;
    use crate::engine::wr::{OpKind, WorkRequest, WrFlags};
    use crossbeam::queue::SegQueue;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn test_pid() -> Pid {
        Pid::pack(Ipv4Addr::new(10, 0, 0, 1), 9000)
    }

    struct QueueSource(SegQueue<Completion>);

    impl CompletionSource for QueueSource {
        fn try_next(&self) -> Option<Completion> {
            self.0.pop()
        }
    }

    fn base_wr(cb: Option<crate::engine::wr::WrCallback>) -> WorkRequest {
        WorkRequest {
            op: OpKind::Send,
            flags: WrFlags::empty(),
            peer: test_pid(),
            local_buffer: Bid(1),
            local_offset: 0,
            length: 4,
            remote_offset: 0,
            remote: None,
            operand1: 0,
            operand2: 0,
            cb,
            alt_eq: None,
            context: 0,
        }
    }

    #[test]
    fn send_eager_completion_fires_wr_callback_and_untracks() {
        let engine = ProgressEngine::new(Arc::new(Registry::new()), Arc::new(DashMap::new()), 64);
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let wr = base_wr(Some(Arc::new(move |_e| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })));
        let id = engine.next_op_id();
        engine.track(Arc::new(OpRecord::new(id, wr, 0)));

        let source = QueueSource(SegQueue::new());
        source.0.push(Completion {
            kind: CompletionKind::SendEager,
            peer: test_pid(),
            slot: None,
            op_id: Some(id),
            src_op_id: None,
            bytes: 4,
            status: StatusCode::Ok,
        });
        assert_eq!(engine.poll_once(&source), 1);
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert!(engine.lookup(id).is_none());
    }

    #[test]
    fn ack_received_completes_originating_send_by_src_op_id() {
        let engine = ProgressEngine::new(Arc::new(Registry::new()), Arc::new(DashMap::new()), 64);
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let wr = base_wr(Some(Arc::new(move |_e| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })));
        let id = engine.next_op_id();
        engine.track(Arc::new(OpRecord::new(id, wr, 77)));

        let source = QueueSource(SegQueue::new());
        source.0.push(Completion {
            kind: CompletionKind::AckReceived,
            peer: test_pid(),
            slot: None,
            op_id: None,
            src_op_id: Some(77),
            bytes: 0,
            status: StatusCode::Ok,
        });
        assert_eq!(engine.poll_once(&source), 1);
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unexpected_receive_with_no_eq_counts_a_drop() {
        let engine = ProgressEngine::new(Arc::new(Registry::new()), Arc::new(DashMap::new()), 64);
        let source = QueueSource(SegQueue::new());
        source.0.push(Completion {
            kind: CompletionKind::RecvUnexpected,
            peer: test_pid(),
            slot: Some(0),
            op_id: None,
            src_op_id: None,
            bytes: 4,
            status: StatusCode::Ok,
        });
        engine.poll_once(&source);
        assert_eq!(engine.dropped_events(), 1);
    }

    #[test]
    fn unexpected_receive_pushes_to_configured_eq() {
        let engine = ProgressEngine::new(Arc::new(Registry::new()), Arc::new(DashMap::new()), 64);
        let eq = Arc::new(EventQueue::new(4));
        engine.set_unexpected_eq(eq.clone());
        let source = QueueSource(SegQueue::new());
        source.0.push(Completion {
            kind: CompletionKind::RecvUnexpected,
            peer: test_pid(),
            slot: Some(0),
            op_id: None,
            src_op_id: None,
            bytes: 4,
            status: StatusCode::Ok,
        });
        engine.poll_once(&source);
        assert_eq!(eq.len(), 1);
    }

    #[test]
    fn dropped_completion_recycles_into_the_freelist() {
        let engine = ProgressEngine::new(Arc::new(Registry::new()), Arc::new(DashMap::new()), 64);
        assert_eq!(engine.dropped_pool_len(), 0);
        let source = QueueSource(SegQueue::new());
        // No WR was ever tracked for this op id, so the completion-destination
        // chain has nothing to hand the event to.
        source.0.push(Completion {
            kind: CompletionKind::SendEager,
            peer: test_pid(),
            slot: None,
            op_id: Some(999),
            src_op_id: None,
            bytes: 4,
            status: StatusCode::Ok,
        });
        engine.poll_once(&source);
        assert_eq!(engine.dropped_events(), 1);
        assert_eq!(engine.dropped_pool_len(), 1);
        assert_eq!(engine.dropped_pool_capacity(), 64);
    }

    #[test]
    fn interrupt_wakes_a_blocked_run_loop() {
        let engine = Arc::new(ProgressEngine::new(Arc::new(Registry::new()), Arc::new(DashMap::new()), 64));
        let e = engine.clone();
        let source = Arc::new(QueueSource(SegQueue::new()));
        let s = source.clone();
        let handle = std::thread::spawn(move || e.run(s.as_ref()));
        std::thread::sleep(Duration::from_millis(5));
        engine.request_stop();
        handle.join().unwrap();
    }
}
