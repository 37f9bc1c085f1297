// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Work requests, completion events, and the per-operation record the
//! progress engine tracks from submission through completion.

use crate::core::buffer::BufferId;
use crate::core::pid::Pid;
use crate::engine::eq::{EventQueue, PushResult};
use crate::error::StatusCode;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// The operation kind carried both by a work request and by the command
/// message's wire `op` byte (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Send,
    Put,
    Get,
    Fadd,
    Cswap,
}

impl OpKind {
    #[must_use]
    pub fn to_wire(self) -> u8 {
        match self {
            OpKind::Send => 0,
            OpKind::Put => 1,
            OpKind::Get => 2,
            OpKind::Fadd => 3,
            OpKind::Cswap => 4,
        }
    }

    pub fn from_wire(byte: u8) -> Option<OpKind> {
        match byte {
            0 => Some(OpKind::Send),
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Get),
            3 => Some(OpKind::Fadd),
            4 => Some(OpKind::Cswap),
            _ => None,
        }
    }
}

/// The completion class an [`Event`] reports, matching the progress
/// engine's decoded completion (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Send,
    Recv,
    Put,
    Get,
    Fadd,
    Cswap,
}

bitflags! {
    /// Work-request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WrFlags: u32 {
        /// The caller-owned buffer is the send region; the framing code
        /// writes the header directly in front of it instead of copying,
        /// and the WR is never returned to a freelist (§4.5, §9).
        const ZERO_COPY = 1 << 0;
    }
}

/// Immutable completion record delivered to an event queue or per-WR
/// callback. Free-listed under steady-state load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub result: StatusCode,
    pub kind: EventKind,
    pub peer: Pid,
    pub length: u64,
    /// Start offset of the affected window within the local buffer.
    pub start: u64,
    pub offset: u64,
    /// Opaque caller context, or an internal id correlating this event
    /// to a pending unexpected-receive record.
    pub context: u64,
}

/// Per-WR callback. Returning `true` means the callback accepted the
/// event (no further completion destination is tried).
pub type WrCallback = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Caller's description of one outstanding operation (§3).
#[derive(Clone)]
pub struct WorkRequest {
    pub op: OpKind,
    pub flags: WrFlags,
    pub peer: Pid,
    pub local_buffer: BufferId,
    pub local_offset: u64,
    pub length: u64,
    pub remote_offset: u64,
    /// Target window for PUT/GET/FADD/CSWAP, obtained out of band (typically
    /// unpacked from an earlier SEND's payload). Unused for SEND.
    pub remote: Option<crate::core::buffer::RemoteBufferDescriptor>,
    /// For FADD: the addend. For CSWAP: the compare value.
    pub operand1: u64,
    /// For CSWAP: the swap value. Unused otherwise.
    pub operand2: u64,
    pub cb: Option<WrCallback>,
    pub alt_eq: Option<Arc<EventQueue>>,
    pub context: u64,
}

/// Opaque token returned to the caller for `cancel`/`wait` (§3, §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkId(pub u64);

/// Per-WR state machine stage for long (rendezvous) transfers (§4.8).
/// Eager operations only ever pass through `Init` and `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WrState {
    Init = 0,
    /// Initiator: the header-only rendezvous send has completed locally.
    RdmaRtsComplete = 1,
    /// Initiator: the target's ACK has arrived; the op is user-complete.
    AckReceived = 2,
    /// Target: the one-sided read from the initiator has been issued.
    GetIssued = 3,
    /// Target: the one-sided read has landed.
    GetComplete = 4,
    /// Target: the ACK has been sent back to the initiator.
    AckSent = 5,
    Done = 6,
}

impl WrState {
    fn from_u8(v: u8) -> WrState {
        match v {
            0 => WrState::Init,
            1 => WrState::RdmaRtsComplete,
            2 => WrState::AckReceived,
            3 => WrState::GetIssued,
            4 => WrState::GetComplete,
            5 => WrState::AckSent,
            _ => WrState::Done,
        }
    }
}

/// The engine-owned record tracking one in-flight operation from
/// submission to completion. Holds the immutable [`WorkRequest`] plus
/// the mutable state the progress engine advances.
pub struct OpRecord {
    pub id: u64,
    pub wr: WorkRequest,
    /// Correlates a long send's header with its ACK (`src_op_id`, §3).
    pub src_op_id: u32,
    state: AtomicU8,
}

impl OpRecord {
    #[must_use]
    pub fn new(id: u64, wr: WorkRequest, src_op_id: u32) -> OpRecord {
        OpRecord {
            id,
            wr,
            src_op_id,
            state: AtomicU8::new(WrState::Init as u8),
        }
    }

    #[must_use]
    pub fn state(&self) -> WrState {
        WrState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WrState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() == WrState::Done
    }
}

/// Buffer-level completion destinations: the buffer's default EQ and its
/// (rarely present) synchronous callback-only EQ. Passed alongside a
/// [`WorkRequest`] so the dispatch chain can reach step 3 and step 5.
pub struct BufferDestination<'a> {
    pub eq: Option<&'a Arc<EventQueue>>,
}

/// Runs the completion-destination chain of §4.8 in order, stopping at
/// the first destination that accepts the event. Returns `true` if some
/// destination accepted it. If nothing accepts, the caller must recycle
/// `event` into a freelist; the drop is counted here.
pub fn dispatch(
    wr: &WorkRequest,
    buffer: &BufferDestination<'_>,
    event: Event,
    dropped: &std::sync::atomic::AtomicU64,
) -> bool {
    // 1. per-WR callback
    if let Some(cb) = &wr.cb {
        if cb(&event) {
            return true;
        }
    }
    // 2. alternate EQ callback
    if let Some(eq) = &wr.alt_eq {
        if eq.invoke_cb(&event) {
            return true;
        }
    }
    // 3. buffer EQ callback
    if let Some(eq) = buffer.eq {
        if eq.invoke_cb(&event) {
            return true;
        }
    }
    // 4. alternate EQ push
    if let Some(eq) = &wr.alt_eq {
        if eq.push(event) == PushResult::Ok {
            return true;
        }
        dropped.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    // 5. buffer EQ push
    if let Some(eq) = buffer.eq {
        if eq.push(event) == PushResult::Ok {
            return true;
        }
        dropped.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    dropped.fetch_add(1, Ordering::Relaxed);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    fn test_peer() -> Pid {
        Pid::pack(Ipv4Addr::new(10, 0, 0, 7), 9000)
    }

    fn base_wr() -> WorkRequest {
        WorkRequest {
            op: OpKind::Send,
            flags: WrFlags::empty(),
            peer: test_peer(),
            local_buffer: BufferId(1),
            local_offset: 0,
            length: 4,
            remote_offset: 0,
            remote: None,
            operand1: 0,
            operand2: 0,
            cb: None,
            alt_eq: None,
            context: 0,
        }
    }

    fn event() -> Event {
        Event {
            result: StatusCode::Ok,
            kind: EventKind::Send,
            peer: test_peer(),
            length: 4,
            start: 0,
            offset: 0,
            context: 0,
        }
    }

    #[test]
    fn wire_op_round_trips() {
        for op in [OpKind::Send, OpKind::Put, OpKind::Get, OpKind::Fadd, OpKind::Cswap] {
            assert_eq!(OpKind::from_wire(op.to_wire()), Some(op));
        }
    }

    #[test]
    fn op_record_starts_init_and_advances() {
        let rec = OpRecord::new(1, base_wr(), 42);
        assert_eq!(rec.state(), WrState::Init);
        rec.set_state(WrState::RdmaRtsComplete);
        rec.set_state(WrState::AckReceived);
        rec.set_state(WrState::Done);
        assert!(rec.is_done());
    }

    #[test]
    fn dispatch_prefers_wr_callback_over_eq() {
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        let mut wr = base_wr();
        wr.cb = Some(Arc::new(move |_e| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        }));
        let dropped = AtomicU64::new(0);
        dispatch(&wr, &BufferDestination { eq: None }, event(), &dropped);
        assert_eq!(called.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dispatch_falls_through_to_buffer_eq_push() {
        let wr = base_wr();
        let eq = EventQueue::new(4);
        let dropped = AtomicU64::new(0);
        dispatch(&wr, &BufferDestination { eq: Some(&Arc::new(eq)) }, event(), &dropped);
        assert_eq!(dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn dispatch_drops_and_counts_when_nothing_accepts() {
        let wr = base_wr();
        let dropped = AtomicU64::new(0);
        dispatch(&wr, &BufferDestination { eq: None }, event(), &dropped);
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn alt_eq_takes_priority_over_buffer_eq() {
        let mut wr = base_wr();
        let alt = Arc::new(EventQueue::new(4));
        wr.alt_eq = Some(alt.clone());
        let buf_eq = Arc::new(EventQueue::new(4));
        let dropped = AtomicU64::new(0);
        dispatch(&wr, &BufferDestination { eq: Some(&buf_eq) }, event(), &dropped);
        assert_eq!(alt.len(), 1);
        assert_eq!(buf_eq.len(), 0);
    }
}
