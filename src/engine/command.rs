// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command message wire framing and the pre-posted command buffer that
//! feeds the progress loop.
//!
//! A command message is a fixed header followed by a length-prefixed
//! provider handle and, for eager sends, the inline payload. The header
//! layout is exactly `COMMAND_HEADER_SIZE` bytes; nothing here is
//! self-describing beyond that, matching the wire contract the progress
//! engine and its peer both compile against.

use crate::config::{ACK_SENTINEL, COMMAND_HEADER_SIZE, MAX_PACKED_INITIATOR_HDL};
use crate::core::pid::Pid;
use crate::engine::wr::OpKind;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One byte naming the length of the packed initiator handle that
/// follows the fixed header. Resolves the wire grammar's otherwise
/// unstated variable-tail length.
const HANDLE_LEN_PREFIX: usize = 1;

/// A decoded or to-be-encoded command message (§3, §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub initiator_pid: Pid,
    pub initiator_offset: u64,
    pub target_offset: u64,
    pub payload_length: u64,
    /// Remote virtual address of the target window; `0` marks an
    /// unexpected receive, [`ACK_SENTINEL`] marks a rendezvous ACK.
    pub target_base_addr: u64,
    pub src_op_id: u32,
    pub op: OpKind,
    pub packed_initiator_hdl: Vec<u8>,
    pub eager_payload: Vec<u8>,
}

impl CommandMessage {
    /// `true` if this message carries no pre-registered destination
    /// buffer (the target must stash it for later matching).
    #[must_use]
    pub fn is_unexpected(&self) -> bool {
        self.target_base_addr == 0
    }

    /// `true` if this message is a zero-length rendezvous ACK.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.target_base_addr == ACK_SENTINEL
    }

    /// Builds the ACK sent by a rendezvous target back to the initiator
    /// once its one-sided read has landed (§4.5).
    #[must_use]
    pub fn ack(initiator_pid: Pid, src_op_id: u32) -> CommandMessage {
        CommandMessage {
            initiator_pid,
            initiator_offset: 0,
            target_offset: 0,
            payload_length: 0,
            target_base_addr: ACK_SENTINEL,
            src_op_id,
            op: OpKind::Send,
            packed_initiator_hdl: Vec::new(),
            eager_payload: Vec::new(),
        }
    }

    /// Encodes this message for wire transmission. Fails if the packed
    /// handle exceeds [`MAX_PACKED_INITIATOR_HDL`].
    pub fn pack(&self) -> Result<Vec<u8>> {
        if self.packed_initiator_hdl.len() > MAX_PACKED_INITIATOR_HDL {
            return Err(Error::InvalidArgument(format!(
                "packed_initiator_hdl of {} bytes exceeds the {}-byte limit",
                self.packed_initiator_hdl.len(),
                MAX_PACKED_INITIATOR_HDL
            )));
        }
        let mut out = Vec::with_capacity(
            COMMAND_HEADER_SIZE + HANDLE_LEN_PREFIX + self.packed_initiator_hdl.len() + self.eager_payload.len(),
        );
        out.extend_from_slice(&self.initiator_pid.raw().to_le_bytes());
        out.extend_from_slice(&self.initiator_offset.to_le_bytes());
        out.extend_from_slice(&self.target_offset.to_le_bytes());
        out.extend_from_slice(&self.payload_length.to_le_bytes());
        out.extend_from_slice(&self.target_base_addr.to_le_bytes());
        out.extend_from_slice(&self.src_op_id.to_le_bytes());
        out.push(self.op.to_wire());
        out.push(self.packed_initiator_hdl.len() as u8);
        out.extend_from_slice(&self.packed_initiator_hdl);
        out.extend_from_slice(&self.eager_payload);
        Ok(out)
    }

    /// Decodes a message received from the wire.
    pub fn unpack(raw: &[u8]) -> Result<CommandMessage> {
        if raw.len() < COMMAND_HEADER_SIZE + HANDLE_LEN_PREFIX {
            return Err(Error::InvalidArgument("command message shorter than header".into()));
        }
        let mut cursor = 0usize;
        let take = |cursor: &mut usize, n: usize| -> &[u8] {
            let slice = &raw[*cursor..*cursor + n];
            *cursor += n;
            slice
        };
        let initiator_pid = Pid::from_raw(u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap()));
        let initiator_offset = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap());
        let target_offset = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap());
        let payload_length = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap());
        let target_base_addr = u64::from_le_bytes(take(&mut cursor, 8).try_into().unwrap());
        let src_op_id = u32::from_le_bytes(take(&mut cursor, 4).try_into().unwrap());
        let op_byte = take(&mut cursor, 1)[0];
        let op = OpKind::from_wire(op_byte)
            .ok_or_else(|| Error::InvalidArgument(format!("unrecognized command op byte {op_byte}")))?;
        let handle_len = take(&mut cursor, 1)[0] as usize;
        if handle_len > MAX_PACKED_INITIATOR_HDL || cursor + handle_len > raw.len() {
            return Err(Error::InvalidArgument("command message handle length out of range".into()));
        }
        let packed_initiator_hdl = take(&mut cursor, handle_len).to_vec();
        let eager_payload = raw[cursor..].to_vec();
        Ok(CommandMessage {
            initiator_pid,
            initiator_offset,
            target_offset,
            payload_length,
            target_base_addr,
            src_op_id,
            op,
            packed_initiator_hdl,
            eager_payload,
        })
    }
}

/// A single pre-posted receive slot (§4.6). Holds the last message
/// decoded into it and whether it is currently posted with the
/// provider awaiting a receive completion.
struct Slot {
    buf: Mutex<Vec<u8>>,
    posted: AtomicBool,
}

/// A ring of `N` pre-posted, MTU-sized receive slots feeding the
/// progress loop. Slot identity is stable for the life of the buffer;
/// the progress engine locates the owning slot directly from a
/// completion's context (its index).
pub struct CommandBuffer {
    slots: Vec<Slot>,
    mtu: usize,
    next_repost: AtomicU64,
}

impl CommandBuffer {
    /// Builds a command buffer with `depth` slots of `mtu` bytes each.
    /// Per §4.6, `depth` should be at least twice the expected in-flight
    /// concurrency; this is logged, not enforced, since the caller may
    /// not yet know its workload's concurrency at construction time.
    #[must_use]
    pub fn new(depth: usize, mtu: usize) -> CommandBuffer {
        if depth < 2 {
            log::warn!("command buffer depth {depth} is below the minimum useful concurrency of 2");
        }
        let slots = (0..depth.max(1))
            .map(|_| Slot {
                buf: Mutex::new(vec![0u8; mtu]),
                posted: AtomicBool::new(true),
            })
            .collect();
        CommandBuffer {
            slots,
            mtu,
            next_repost: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Copies `data` into slot `index`'s backing buffer, ready for the
    /// provider to post as a receive. Fails if `data` exceeds the MTU.
    pub fn stage(&self, index: usize, data: &[u8]) -> Result<()> {
        if data.len() > self.mtu {
            return Err(Error::InvalidArgument(format!(
                "staged message of {} bytes exceeds mtu of {}",
                data.len(),
                self.mtu
            )));
        }
        let slot = self
            .slots
            .get(index)
            .ok_or(Error::InvalidHandle("command buffer slot"))?;
        let mut buf = slot.buf.lock();
        buf.clear();
        buf.extend_from_slice(data);
        Ok(())
    }

    /// Decodes the command message currently staged in slot `index`.
    pub fn decode(&self, index: usize) -> Result<CommandMessage> {
        let slot = self
            .slots
            .get(index)
            .ok_or(Error::InvalidHandle("command buffer slot"))?;
        CommandMessage::unpack(&slot.buf.lock())
    }

    /// Marks slot `index` consumed; the provider must repost it as a
    /// fresh receive before it can carry another message (§4.6).
    pub fn consume(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.posted.store(false, Ordering::Release);
        }
        self.next_repost.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks slot `index` reposted (re-submitted as a receive).
    pub fn repost(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.posted.store(true, Ordering::Release);
        }
    }

    #[must_use]
    pub fn is_posted(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map(|s| s.posted.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Total number of consume calls observed, useful for repost-lag stats.
    #[must_use]
    pub fn consumed_count(&self) -> u64 {
        self.next_repost.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_pid() -> Pid {
        Pid::pack(Ipv4Addr::new(10, 0, 0, 1), 9000)
    }

    fn eager_message() -> CommandMessage {
        CommandMessage {
            initiator_pid: test_pid(),
            initiator_offset: 0,
            target_offset: 16,
            payload_length: 4,
            target_base_addr: 0xDEAD_BEEF,
            src_op_id: 7,
            op: OpKind::Send,
            packed_initiator_hdl: vec![1, 2, 3],
            eager_payload: vec![0xAA, 0xBB, 0xCC, 0xDD],
        }
    }

    #[test]
    fn pack_unpack_round_trips_eager() {
        let msg = eager_message();
        let packed = msg.pack().unwrap();
        let unpacked = CommandMessage::unpack(&packed).unwrap();
        assert_eq!(msg, unpacked);
    }

    #[test]
    fn zero_target_base_addr_is_unexpected() {
        let mut msg = eager_message();
        msg.target_base_addr = 0;
        assert!(msg.is_unexpected());
        assert!(!msg.is_ack());
    }

    #[test]
    fn ack_constructor_is_recognized_as_ack() {
        let ack = CommandMessage::ack(test_pid(), 42);
        assert!(ack.is_ack());
        assert!(ack.eager_payload.is_empty());
        assert_eq!(ack.src_op_id, 42);
    }

    #[test]
    fn oversized_handle_rejected_on_pack() {
        let mut msg = eager_message();
        msg.packed_initiator_hdl = vec![0u8; MAX_PACKED_INITIATOR_HDL + 1];
        assert!(msg.pack().is_err());
    }

    #[test]
    fn rendezvous_header_only_has_no_eager_payload() {
        let mut msg = eager_message();
        msg.eager_payload.clear();
        msg.payload_length = 1 << 20;
        let packed = msg.pack().unwrap();
        let unpacked = CommandMessage::unpack(&packed).unwrap();
        assert!(unpacked.eager_payload.is_empty());
        assert_eq!(unpacked.payload_length, 1 << 20);
    }

    #[test]
    fn command_buffer_stage_decode_consume_repost_cycle() {
        let cb = CommandBuffer::new(4, 256);
        assert_eq!(cb.depth(), 4);
        let msg = eager_message();
        let packed = msg.pack().unwrap();
        cb.stage(0, &packed).unwrap();
        let decoded = cb.decode(0).unwrap();
        assert_eq!(decoded, msg);
        assert!(cb.is_posted(0));
        cb.consume(0);
        assert!(!cb.is_posted(0));
        assert_eq!(cb.consumed_count(), 1);
        cb.repost(0);
        assert!(cb.is_posted(0));
    }

    #[test]
    fn stage_rejects_payload_larger_than_mtu() {
        let cb = CommandBuffer::new(2, 8);
        assert!(cb.stage(0, &[0u8; 16]).is_err());
    }
}
