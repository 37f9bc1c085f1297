// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MPI-backed provider: peers are ranks in a shared `MPI_COMM_WORLD`
//! rather than verbs queue pairs, and the rendezvous exchange negotiates
//! a rank instead of a QP number/LID/GID triple.
//!
//! One-sided operations ride MPI's RMA window API (`MPI_Win`); eager
//! sends use a pair of tagged send/receive calls into the pre-posted
//! command buffer, matching this crate's tag-as-slot convention below.

use super::provider::{Provider, Registration, SubmitContext};
use crate::connection::{Connection, ConnectionResources, PeerParams};
use crate::core::buffer::BufferFlags;
use crate::core::pid::Pid;
use crate::engine::progress::{Completion, CompletionKind, CompletionSource};
use crate::engine::wr::OpKind;
use crate::error::{Error, Result};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use mpi::collective::CommunicatorCollectives;
use mpi::point_to_point::{Destination, Source};
use mpi::topology::Communicator;
use mpi::Tag;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Reserves a tag range for command-buffer traffic so application tags
/// (if this process shares `COMM_WORLD` with other MPI code) never alias.
const COMMAND_TAG: Tag = 0x4E54;
/// Tag carrying one-sided-result replies (fetch-and-op/compare-and-swap).
const ATOMIC_REPLY_TAG: Tag = 0x4E55;

struct MpiCompletionSource(Arc<SegQueue<Completion>>);

impl CompletionSource for MpiCompletionSource {
    fn try_next(&self) -> Option<Completion> {
        self.0.pop()
    }
}

/// One registered window, tracked so `submit` can resolve a peer rank's
/// remote descriptor (rank + displacement) back to a local `MPI_Win`.
struct Window {
    win: mpi::window::Window<u8>,
}

/// Provider adapter over `rsmpi`. Every rank in `MPI_COMM_WORLD` maps to
/// exactly one [`Pid`] via the rendezvous exchange's `rank` field; there
/// is no independent addressing scheme the way verbs has LID/GID.
pub struct MpiProvider {
    universe: mpi::environment::Universe,
    completions: Arc<SegQueue<Completion>>,
    windows: DashMap<usize, Window>,
    next_window_id: std::sync::atomic::AtomicUsize,
    /// Resolves a peer's [`Pid`] to its MPI rank, filled in by
    /// `complete_connection` once the rendezvous exchange supplies it.
    ranks: DashMap<Pid, i32>,
}

impl MpiProvider {
    /// Initializes the MPI runtime (`MPI_Init`, implicitly via
    /// `mpi::initialize`). Must be called at most once per process; MPI
    /// itself enforces this and aborts on a second call.
    pub fn init() -> Result<MpiProvider> {
        let universe = mpi::initialize()
            .ok_or_else(|| Error::ProviderError("MPI_Init failed or was already called".into()))?;
        Ok(MpiProvider {
            universe,
            completions: Arc::new(SegQueue::new()),
            windows: DashMap::new(),
            next_window_id: std::sync::atomic::AtomicUsize::new(1),
            ranks: DashMap::new(),
        })
    }

    fn world(&self) -> mpi::topology::SimpleCommunicator {
        self.universe.world()
    }

    #[must_use]
    pub fn local_rank(&self) -> i32 {
        self.world().rank()
    }
}

impl Provider for MpiProvider {
    fn name(&self) -> &'static str {
        "mpi"
    }

    fn start(&self) -> Result<()> {
        self.world().barrier();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.windows.clear();
        Ok(())
    }

    fn prepare_connection(&self, peer: Pid) -> Result<(Connection, PeerParams)> {
        // The rank is not known yet; the rendezvous exchange fills it in
        // via `complete_connection` once the peer's response carries it.
        let conn = Connection::new(peer, ConnectionResources::Mpi { rank: -1 });
        let mut params = PeerParams {
            hostname: String::new(),
            addr: peer.to_string(),
            port: peer.unpack().1,
            provider_fields: Vec::new(),
        };
        params
            .provider_fields
            .push(("rank".to_string(), self.local_rank().to_string()));
        Ok((conn, params))
    }

    fn complete_connection(&self, conn: &Connection, remote: &PeerParams) -> Result<()> {
        let rank: i32 = remote
            .get("rank")
            .ok_or_else(|| Error::InvalidArgument("mpi rendezvous response missing rank".into()))?
            .parse()
            .map_err(|_| Error::InvalidArgument("mpi rendezvous rank is not an integer".into()))?;
        if rank < 0 || rank >= self.world().size() {
            return Err(Error::InvalidArgument(format!("rank {rank} out of range for this communicator")));
        }
        self.ranks.insert(conn.pid(), rank);
        conn.mark_ready();
        Ok(())
    }

    fn disconnect(&self, conn: &Connection) -> Result<()> {
        conn.mark_closed();
        Ok(())
    }

    fn register_memory(&self, ptr: usize, len: usize, _flags: BufferFlags) -> Result<Registration> {
        // Safety: the caller's buffer registration guarantees `[ptr, ptr+len)`
        // is valid for the lifetime of the resulting window.
        let slice = unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len) };
        let win = mpi::window::WindowBuilder::new(&self.world(), slice).create();
        let id = self.next_window_id.fetch_add(1, Ordering::Relaxed);
        self.windows.insert(id, Window { win });

        let mut blob = Vec::with_capacity(16);
        blob.extend_from_slice(&(id as u64).to_le_bytes());
        blob.extend_from_slice(&(self.local_rank() as u64).to_le_bytes());
        Ok(Registration { provider_handle: blob })
    }

    fn unregister_memory(&self, provider_handle: &[u8]) -> Result<()> {
        if provider_handle.len() < 8 {
            return Err(Error::InvalidArgument("malformed mpi memory handle".into()));
        }
        let id = u64::from_le_bytes(provider_handle[0..8].try_into().unwrap()) as usize;
        self.windows.remove(&id);
        Ok(())
    }

    fn submit(&self, ctx: SubmitContext<'_>) -> Result<()> {
        match ctx.wr.op {
            OpKind::Send => self.submit_send(ctx),
            OpKind::Put | OpKind::Get => self.submit_rma(ctx),
            OpKind::Fadd | OpKind::Cswap => self.submit_atomic(ctx),
        }
    }

    /// Only reports completions for operations this rank initiated
    /// (send/put/get/atomic). Surfacing inbound command-buffer traffic
    /// needs a posted `MPI_Irecv` polled alongside these, which would
    /// require a second background thread or a redesign of the progress
    /// loop's single-source assumption; tracked as follow-up work rather
    /// than guessed at here.
    fn completion_source(&self) -> Arc<dyn CompletionSource> {
        Arc::new(MpiCompletionSource(self.completions.clone()))
    }

    /// Inbound command-buffer traffic is never surfaced by this provider
    /// (see `completion_source` above), so there is no slot to complete.
    fn complete_unexpected(&self, _peer: Pid, _slot: usize, _dest_ptr: usize, _dest_len: usize) -> Result<u64> {
        Err(Error::ProviderError("mpi unexpected-receive completion not yet implemented".into()))
    }
}

impl MpiProvider {
    fn peer_rank(&self, peer: Pid) -> Result<i32> {
        self.ranks
            .get(&peer)
            .map(|r| *r)
            .ok_or_else(|| Error::PeerNotFound(peer.to_string()))
    }

    fn submit_send(&self, ctx: SubmitContext<'_>) -> Result<()> {
        // Safety: `local` is a caller-registered, currently-valid region.
        let payload = unsafe {
            std::slice::from_raw_parts(
                (ctx.local.ptr() + ctx.wr.local_offset as usize) as *const u8,
                ctx.wr.length as usize,
            )
        };
        let rank = self.peer_rank(ctx.wr.peer)?;
        let world = self.world();
        let process = world.process_at_rank(rank);
        process.send_with_tag(payload, COMMAND_TAG);
        self.completions.push(Completion {
            kind: CompletionKind::SendEager,
            peer: ctx.wr.peer,
            slot: None,
            op_id: Some(ctx.op_id),
            src_op_id: None,
            bytes: ctx.wr.length,
            status: crate::error::StatusCode::Ok,
        });
        Ok(())
    }

    fn submit_rma(&self, ctx: SubmitContext<'_>) -> Result<()> {
        let remote = ctx
            .remote
            .ok_or_else(|| Error::InvalidArgument("put/get requires a remote descriptor".into()))?;
        if remote.provider_blob().len() < 16 {
            return Err(Error::InvalidArgument("malformed mpi remote descriptor".into()));
        }
        let window_id = u64::from_le_bytes(remote.provider_blob()[0..8].try_into().unwrap()) as usize;
        let target_rank = u64::from_le_bytes(remote.provider_blob()[8..16].try_into().unwrap()) as i32;
        let entry = self
            .windows
            .get(&window_id)
            .ok_or(Error::InvalidHandle("unknown local mpi window"))?;
        let origin = unsafe {
            std::slice::from_raw_parts(
                (ctx.local.ptr() + ctx.wr.local_offset as usize) as *const u8,
                ctx.wr.length as usize,
            )
        };
        let displacement = (remote.offset() as u64 + ctx.wr.remote_offset) as mpi::Count;
        match ctx.wr.op {
            OpKind::Put => entry.win.put(origin, target_rank, displacement),
            OpKind::Get => {
                let origin_mut = unsafe {
                    std::slice::from_raw_parts_mut(
                        (ctx.local.ptr() + ctx.wr.local_offset as usize) as *mut u8,
                        ctx.wr.length as usize,
                    )
                };
                entry.win.get(origin_mut, target_rank, displacement);
            }
            _ => unreachable!("submit_rma only called for put/get"),
        }
        entry.win.flush(target_rank);

        self.completions.push(Completion {
            kind: if matches!(ctx.wr.op, OpKind::Put) {
                CompletionKind::RdmaWrite
            } else {
                CompletionKind::RdmaRead
            },
            peer: ctx.wr.peer,
            slot: None,
            op_id: Some(ctx.op_id),
            src_op_id: None,
            bytes: ctx.wr.length,
            status: crate::error::StatusCode::Ok,
        });
        Ok(())
    }

    fn submit_atomic(&self, ctx: SubmitContext<'_>) -> Result<()> {
        // rsmpi's safe window API does not currently expose
        // `MPI_Fetch_and_op`/`MPI_Compare_and_swap`; both are implemented
        // here as a lock/get-modify-put/unlock critical section against
        // the target window, which is correct but not lock-free.
        let remote = ctx
            .remote
            .ok_or_else(|| Error::InvalidArgument("atomic op requires a remote descriptor".into()))?;
        let window_id = u64::from_le_bytes(remote.provider_blob()[0..8].try_into().unwrap()) as usize;
        let target_rank = u64::from_le_bytes(remote.provider_blob()[8..16].try_into().unwrap()) as i32;
        let entry = self
            .windows
            .get(&window_id)
            .ok_or(Error::InvalidHandle("unknown local mpi window"))?;
        let displacement = (remote.offset() as u64 + ctx.wr.remote_offset) as mpi::Count;

        entry.win.lock_exclusive(target_rank);
        let mut current = [0u8; 8];
        entry.win.get(&mut current[..], target_rank, displacement);
        entry.win.flush(target_rank);
        let old = u64::from_le_bytes(current);
        let new = match ctx.wr.op {
            OpKind::Fadd => old.wrapping_add(ctx.wr.operand1),
            OpKind::Cswap if old == ctx.wr.operand1 => ctx.wr.operand2,
            OpKind::Cswap => old,
            _ => unreachable!("submit_atomic only called for fadd/cswap"),
        };
        entry.win.put(&new.to_le_bytes()[..], target_rank, displacement);
        entry.win.flush(target_rank);
        entry.win.unlock(target_rank);

        // Safety: the local buffer is registered for at least 8 bytes at
        // this offset.
        unsafe {
            std::ptr::write_unaligned((ctx.local.ptr() + ctx.wr.local_offset as usize) as *mut u64, old);
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
