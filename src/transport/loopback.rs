// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process, hardware-free provider (§4.13): two `Transport` instances
//! in the same address space exchange command messages through a
//! process-wide mailbox directory and perform one-sided operations with
//! direct memory access instead of a real network.
//!
//! Exists so the rest of the crate, and anyone embedding it, can exercise
//! the full connect/send/put/get/atomic surface in a single test binary
//! with no verbs device or MPI runtime available.

use super::provider::{Provider, Registration, SubmitContext};
use crate::config::ACK_SENTINEL;
use crate::connection::{Connection, ConnectionResources, PeerParams};
use crate::core::buffer::BufferFlags;
use crate::core::pid::Pid;
use crate::engine::command::{CommandBuffer, CommandMessage};
use crate::engine::progress::{Completion, CompletionKind, CompletionSource};
use crate::engine::wr::OpKind;
use crate::error::{Error, Result};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

struct LoopbackEndpoint {
    inbox: Arc<CommandBuffer>,
    completions: Arc<SegQueue<Completion>>,
    deliver_cursor: AtomicUsize,
}

static DIRECTORY: OnceLock<DashMap<Pid, LoopbackEndpoint>> = OnceLock::new();

fn directory() -> &'static DashMap<Pid, LoopbackEndpoint> {
    DIRECTORY.get_or_init(DashMap::new)
}

struct LoopbackCompletionSource(Arc<SegQueue<Completion>>);

impl CompletionSource for LoopbackCompletionSource {
    fn try_next(&self) -> Option<Completion> {
        self.0.pop()
    }
}

/// Decodes the `ptr`/`len` pair a loopback [`Registration`] packs as its
/// provider handle.
fn decode_handle(blob: &[u8]) -> Result<(usize, usize)> {
    if blob.len() < 16 {
        return Err(Error::InvalidArgument("loopback memory handle too short".into()));
    }
    let ptr = u64::from_le_bytes(blob[0..8].try_into().unwrap()) as usize;
    let len = u64::from_le_bytes(blob[8..16].try_into().unwrap()) as usize;
    Ok((ptr, len))
}

pub struct LoopbackProvider {
    pid: Mutex<Option<Pid>>,
    mtu: usize,
    command_depth: usize,
    inbox: Arc<CommandBuffer>,
    completions: Arc<SegQueue<Completion>>,
}

impl LoopbackProvider {
    #[must_use]
    pub fn new(mtu: usize, command_depth: usize) -> LoopbackProvider {
        LoopbackProvider {
            pid: Mutex::new(None),
            mtu,
            command_depth,
            inbox: Arc::new(CommandBuffer::new(command_depth, mtu)),
            completions: Arc::new(SegQueue::new()),
        }
    }

    /// Publishes this instance's mailbox into the process-wide directory
    /// under `pid`, so peers in the same process can find it. Must be
    /// called before `start()`.
    pub fn bind(&self, pid: Pid) {
        *self.pid.lock() = Some(pid);
        directory().insert(
            pid,
            LoopbackEndpoint {
                inbox: self.inbox.clone(),
                completions: self.completions.clone(),
                deliver_cursor: AtomicUsize::new(0),
            },
        );
    }

    fn local_pid(&self) -> Result<Pid> {
        self.pid.lock().ok_or(Error::InvalidHandle("loopback provider not bound"))
    }

    fn submit_send(&self, ctx: SubmitContext<'_>) -> Result<()> {
        let me = self.local_pid()?;
        let header_budget = self.mtu.saturating_sub(64);
        let eager = ctx.wr.length as usize <= header_budget;

        // Safety: the caller's registration guarantees `[ptr, ptr+len)` is
        // valid and alive for at least the duration of this call.
        let payload = if eager {
            unsafe {
                std::slice::from_raw_parts(
                    (ctx.local.ptr() + ctx.wr.local_offset as usize) as *const u8,
                    ctx.wr.length as usize,
                )
                .to_vec()
            }
        } else {
            Vec::new()
        };

        // Rendezvous receivers have no payload to decode out of the
        // command message itself; they instead need the source window's
        // address to RDMA-read from, packed the same way a registered
        // buffer's handle is.
        let packed_initiator_hdl = if eager {
            Vec::new()
        } else {
            let src_ptr = (ctx.local.ptr() + ctx.wr.local_offset as usize) as u64;
            let mut blob = Vec::with_capacity(16);
            blob.extend_from_slice(&src_ptr.to_le_bytes());
            blob.extend_from_slice(&u64::from(ctx.wr.length).to_le_bytes());
            blob
        };

        let msg = CommandMessage {
            initiator_pid: me,
            initiator_offset: ctx.wr.local_offset,
            target_offset: ctx.wr.remote_offset,
            payload_length: ctx.wr.length,
            target_base_addr: 0,
            src_op_id: ctx.src_op_id,
            op: OpKind::Send,
            packed_initiator_hdl,
            eager_payload: payload,
        };
        let packed = msg.pack()?;

        let endpoint = directory()
            .get(&ctx.wr.peer)
            .ok_or_else(|| Error::PeerNotFound(ctx.wr.peer.to_string()))?;
        let slot = endpoint.deliver_cursor.fetch_add(1, Ordering::Relaxed) % endpoint.inbox.depth();
        endpoint.inbox.stage(slot, &packed)?;
        endpoint.completions.push(Completion {
            kind: if eager {
                CompletionKind::RecvEager
            } else {
                CompletionKind::RecvRendezvous
            },
            peer: me,
            slot: Some(slot),
            op_id: None,
            src_op_id: Some(ctx.src_op_id),
            bytes: ctx.wr.length,
            status: crate::error::StatusCode::Ok,
        });

        self.completions.push(Completion {
            kind: if eager {
                CompletionKind::SendEager
            } else {
                CompletionKind::SendRendezvous
            },
            peer: ctx.wr.peer,
            slot: None,
            op_id: Some(ctx.op_id),
            src_op_id: None,
            bytes: ctx.wr.length,
            status: crate::error::StatusCode::Ok,
        });

        // A header-only rendezvous send has no in-band ACK path in this
        // provider; complete it immediately rather than model the
        // request/get/ack round trip a wire transport needs.
        if !eager {
            self.completions.push(Completion {
                kind: CompletionKind::AckReceived,
                peer: ctx.wr.peer,
                slot: None,
                op_id: None,
                src_op_id: Some(ctx.src_op_id),
                bytes: 0,
                status: crate::error::StatusCode::Ok,
            });
        }
        Ok(())
    }

    fn remote_addr(&self, ctx: &SubmitContext<'_>) -> Result<usize> {
        let remote = ctx
            .remote
            .ok_or_else(|| Error::InvalidArgument("one-sided op missing remote descriptor".into()))?;
        let (base_ptr, base_len) = decode_handle(remote.provider_blob())?;
        let window_start = base_ptr + remote.offset() as usize;
        if remote.offset() as usize + remote.length() as usize > base_len {
            return Err(Error::InvalidArgument("remote descriptor window exceeds registered region".into()));
        }
        Ok(window_start + ctx.wr.remote_offset as usize)
    }

    fn submit_rdma(&self, ctx: SubmitContext<'_>, kind: CompletionKind, write: bool) -> Result<()> {
        let remote_addr = self.remote_addr(&ctx)?;
        let local_addr = ctx.local.ptr() + ctx.wr.local_offset as usize;
        let len = ctx.wr.length as usize;
        // Safety: both ends are registered regions whose caller-supplied
        // descriptors have just been range-checked above.
        unsafe {
            if write {
                std::ptr::copy_nonoverlapping(local_addr as *const u8, remote_addr as *mut u8, len);
            } else {
                std::ptr::copy_nonoverlapping(remote_addr as *const u8, local_addr as *mut u8, len);
            }
        }
        self.completions.push(Completion {
            kind,
            peer: ctx.wr.peer,
            slot: None,
            op_id: Some(ctx.op_id),
            src_op_id: None,
            bytes: ctx.wr.length,
            status: crate::error::StatusCode::Ok,
        });
        Ok(())
    }

    fn submit_atomic(&self, ctx: SubmitContext<'_>, compare_and_swap: bool) -> Result<()> {
        let remote_addr = self.remote_addr(&ctx)?;
        if remote_addr % 8 != 0 {
            return Err(Error::InvalidArgument("atomic target must be 8-byte aligned".into()));
        }
        // Safety: the remote window has been validated to contain at
        // least 8 bytes at an 8-byte aligned address.
        let cell = unsafe { &*(remote_addr as *const std::sync::atomic::AtomicU64) };
        let old = if compare_and_swap {
            cell.compare_exchange(
                ctx.wr.operand1,
                ctx.wr.operand2,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .unwrap_or_else(|actual| actual)
        } else {
            cell.fetch_add(ctx.wr.operand1, Ordering::SeqCst)
        };

        let local_addr = ctx.local.ptr() + ctx.wr.local_offset as usize;
        // Safety: the local buffer is registered for at least 8 bytes at
        // this offset; atomics always carry an 8-byte result (§3).
        unsafe {
            std::ptr::write_unaligned(local_addr as *mut u64, old);
        }

        self.completions.push(Completion {
            kind: CompletionKind::Atomic,
            peer: ctx.wr.peer,
            slot: None,
            op_id: Some(ctx.op_id),
            src_op_id: None,
            bytes: 8,
            status: crate::error::StatusCode::Ok,
        });
        Ok(())
    }
}

impl Provider for LoopbackProvider {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn start(&self) -> Result<()> {
        self.local_pid()?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(pid) = *self.pid.lock() {
            directory().remove(&pid);
        }
        Ok(())
    }

    fn prepare_connection(&self, peer: Pid) -> Result<(Connection, PeerParams)> {
        let conn = Connection::new(peer, ConnectionResources::Loopback);
        let params = PeerParams {
            hostname: String::new(),
            addr: peer.to_string(),
            port: peer.unpack().1,
            provider_fields: Vec::new(),
        };
        Ok((conn, params))
    }

    fn complete_connection(&self, conn: &Connection, _remote: &PeerParams) -> Result<()> {
        if !directory().contains_key(&conn.pid()) {
            return Err(Error::PeerNotFound(conn.pid().to_string()));
        }
        conn.mark_ready();
        Ok(())
    }

    fn disconnect(&self, conn: &Connection) -> Result<()> {
        conn.mark_closed();
        Ok(())
    }

    fn register_memory(&self, ptr: usize, len: usize, _flags: BufferFlags) -> Result<Registration> {
        let mut blob = Vec::with_capacity(16);
        blob.extend_from_slice(&(ptr as u64).to_le_bytes());
        blob.extend_from_slice(&(len as u64).to_le_bytes());
        Ok(Registration { provider_handle: blob })
    }

    fn unregister_memory(&self, _provider_handle: &[u8]) -> Result<()> {
        Ok(())
    }

    fn submit(&self, ctx: SubmitContext<'_>) -> Result<()> {
        match ctx.wr.op {
            OpKind::Send => self.submit_send(ctx),
            OpKind::Put => self.submit_rdma(ctx, CompletionKind::RdmaWrite, true),
            OpKind::Get => self.submit_rdma(ctx, CompletionKind::RdmaRead, false),
            OpKind::Fadd => self.submit_atomic(ctx, false),
            OpKind::Cswap => self.submit_atomic(ctx, true),
        }
    }

    fn completion_source(&self) -> Arc<dyn CompletionSource> {
        Arc::new(LoopbackCompletionSource(self.completions.clone()))
    }

    /// Delivers the message staged at `slot` in this endpoint's own
    /// inbox: copies the eager payload, or RDMA-reads against the
    /// initiator handle packed for a rendezvous send, into
    /// `[dest_ptr, dest_ptr+dest_len)`, then reposts the slot.
    ///
    /// No second ACK is sent for the rendezvous case: `submit_send`
    /// already self-completes the sender's `AckReceived` the moment it
    /// stages the header, since this provider has no in-band ACK frame
    /// to model a real request/get/ack round trip with. Sending one here
    /// too would double-fire the same `src_op_id`.
    fn complete_unexpected(&self, _peer: Pid, slot: usize, dest_ptr: usize, dest_len: usize) -> Result<u64> {
        let msg = self.inbox.decode(slot)?;
        let delivered = if !msg.eager_payload.is_empty() {
            let n = msg.eager_payload.len().min(dest_len);
            // Safety: the caller supplies a valid, writable region of at
            // least `dest_len` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(msg.eager_payload.as_ptr(), dest_ptr as *mut u8, n);
            }
            n
        } else {
            let (src_ptr, src_len) = decode_handle(&msg.packed_initiator_hdl)?;
            let n = src_len.min(dest_len);
            // Safety: the initiator handle names a region the sender
            // guaranteed stays alive for the duration of this rendezvous
            // exchange; `dest_ptr` is caller-supplied and writable.
            unsafe {
                std::ptr::copy_nonoverlapping(src_ptr as *const u8, dest_ptr as *mut u8, n);
            }
            n
        };
        self.inbox.consume(slot);
        self.inbox.repost(slot);
        Ok(delivered as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::Buffer;
    use crate::core::buffer::BufferId;
    use crate::engine::wr::{WorkRequest, WrFlags};
    use std::net::Ipv4Addr;

    fn pid(last_octet: u8, port: u16) -> Pid {
        Pid::pack(Ipv4Addr::new(127, 0, 0, last_octet), port)
    }

    fn region(bytes: &mut [u8]) -> (usize, usize) {
        (bytes.as_mut_ptr() as usize, bytes.len())
    }

    #[test]
    fn bind_then_start_succeeds_and_registers_in_directory() {
        let provider = LoopbackProvider::new(2048, 4);
        provider.bind(pid(1, 9100));
        assert!(provider.start().is_ok());
        provider.stop().unwrap();
        assert!(!directory().contains_key(&pid(1, 9100)));
    }

    #[test]
    fn start_without_bind_fails() {
        let provider = LoopbackProvider::new(2048, 4);
        assert!(provider.start().is_err());
    }

    #[test]
    fn eager_send_delivers_payload_and_completes_both_sides() {
        let a = LoopbackProvider::new(2048, 4);
        let b = LoopbackProvider::new(2048, 4);
        a.bind(pid(2, 9200));
        b.bind(pid(2, 9201));

        let mut src = [0xABu8; 16];
        let (ptr, len) = region(&mut src);
        let reg = a.register_memory(ptr, len, BufferFlags::LOCAL_READ).unwrap();
        let buffer = Buffer::new(ptr, len, BufferFlags::LOCAL_READ, None, reg.provider_handle, false);

        let wr = WorkRequest {
            op: OpKind::Send,
            flags: WrFlags::empty(),
            peer: pid(2, 9201),
            local_buffer: BufferId(1),
            local_offset: 0,
            length: 16,
            remote_offset: 0,
            remote: None,
            operand1: 0,
            operand2: 0,
            cb: None,
            alt_eq: None,
            context: 0,
        };
        let ctx = SubmitContext {
            op_id: 1,
            src_op_id: 7,
            wr: &wr,
            local: &buffer,
            remote: None,
        };
        a.submit(ctx).unwrap();

        let send_completion = a.completion_source().try_next().unwrap();
        assert_eq!(send_completion.kind, CompletionKind::SendEager);

        let recv_completion = b.completion_source().try_next().unwrap();
        assert_eq!(recv_completion.kind, CompletionKind::RecvEager);
        let slot = recv_completion.slot.unwrap();
        let decoded = b.inbox.decode(slot).unwrap();
        assert_eq!(decoded.eager_payload, vec![0xABu8; 16]);
    }

    #[test]
    fn put_copies_bytes_directly_into_the_remote_region() {
        let a = LoopbackProvider::new(2048, 4);
        a.bind(pid(3, 9300));

        let mut src = [7u8; 8];
        let mut dst = [0u8; 8];
        let (src_ptr, src_len) = region(&mut src);
        let (dst_ptr, dst_len) = region(&mut dst);

        let local_reg = a.register_memory(src_ptr, src_len, BufferFlags::LOCAL_READ).unwrap();
        let local_buffer = Buffer::new(src_ptr, src_len, BufferFlags::LOCAL_READ, None, local_reg.provider_handle, false);
        let remote_reg = a.register_memory(dst_ptr, dst_len, BufferFlags::REMOTE_WRITE).unwrap();
        let remote_buffer = Buffer::new(dst_ptr, dst_len, BufferFlags::REMOTE_WRITE, None, remote_reg.provider_handle, false);
        let rbd = remote_buffer.make_remote_descriptor(0, 8).unwrap();

        let wr = WorkRequest {
            op: OpKind::Put,
            flags: WrFlags::empty(),
            peer: pid(3, 9300),
            local_buffer: BufferId(1),
            local_offset: 0,
            length: 8,
            remote_offset: 0,
            remote: None,
            operand1: 0,
            operand2: 0,
            cb: None,
            alt_eq: None,
            context: 0,
        };
        let ctx = SubmitContext {
            op_id: 1,
            src_op_id: 0,
            wr: &wr,
            local: &local_buffer,
            remote: Some(&rbd),
        };
        a.submit(ctx).unwrap();
        assert_eq!(dst, [7u8; 8]);
        let completion = a.completion_source().try_next().unwrap();
        assert_eq!(completion.kind, CompletionKind::RdmaWrite);
    }

    #[test]
    fn fetch_add_returns_previous_value_and_applies_addend() {
        let a = LoopbackProvider::new(2048, 4);
        a.bind(pid(4, 9400));

        let mut counter = 10u64.to_le_bytes();
        let mut local = 0u64.to_le_bytes();
        let (counter_ptr, counter_len) = region(&mut counter);
        let (local_ptr, local_len) = region(&mut local);

        let remote_reg = a.register_memory(counter_ptr, counter_len, BufferFlags::REMOTE_ATOMIC).unwrap();
        let remote_buffer = Buffer::new(counter_ptr, counter_len, BufferFlags::REMOTE_ATOMIC, None, remote_reg.provider_handle, false);
        let rbd = remote_buffer.make_remote_descriptor(0, 8).unwrap();
        let local_reg = a.register_memory(local_ptr, local_len, BufferFlags::LOCAL_WRITE).unwrap();
        let local_buffer = Buffer::new(local_ptr, local_len, BufferFlags::LOCAL_WRITE, None, local_reg.provider_handle, false);

        let wr = WorkRequest {
            op: OpKind::Fadd,
            flags: WrFlags::empty(),
            peer: pid(4, 9400),
            local_buffer: BufferId(1),
            local_offset: 0,
            length: 8,
            remote_offset: 0,
            remote: None,
            operand1: 5,
            operand2: 0,
            cb: None,
            alt_eq: None,
            context: 0,
        };
        let ctx = SubmitContext {
            op_id: 1,
            src_op_id: 0,
            wr: &wr,
            local: &local_buffer,
            remote: Some(&rbd),
        };
        a.submit(ctx).unwrap();
        assert_eq!(u64::from_le_bytes(local), 10);
        assert_eq!(u64::from_le_bytes(counter), 15);
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let a = LoopbackProvider::new(2048, 4);
        a.bind(pid(5, 9500));
        let mut src = [0u8; 4];
        let (ptr, len) = region(&mut src);
        let reg = a.register_memory(ptr, len, BufferFlags::LOCAL_READ).unwrap();
        let buffer = Buffer::new(ptr, len, BufferFlags::LOCAL_READ, None, reg.provider_handle, false);
        let wr = WorkRequest {
            op: OpKind::Send,
            flags: WrFlags::empty(),
            peer: pid(99, 9999),
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
        };
        let ctx = SubmitContext {
            op_id: 1,
            src_op_id: 0,
            wr: &wr,
            local: &buffer,
            remote: None,
        };
        assert!(a.submit(ctx).is_err());
    }
}
