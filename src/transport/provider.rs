// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The capability trait every provider adapter implements (§9 Design
//! Notes: "re-architect as a capability trait ... implementations are
//! tagged variants; the facade holds one").

use crate::connection::{Connection, PeerParams};
use crate::core::buffer::{Buffer, BufferFlags, RemoteBufferDescriptor};
use crate::core::pid::Pid;
use crate::engine::progress::CompletionSource;
use crate::engine::wr::WorkRequest;
use crate::error::Result;
use std::sync::Arc;

/// A registered-memory handle the provider hands back to the facade:
/// an opaque, packable local descriptor plus whatever the provider
/// needs to tear the registration down.
pub struct Registration {
    pub provider_handle: Vec<u8>,
}

/// Everything [`Provider::submit`] needs about one outstanding operation.
/// `remote` is populated for `put`/`get`/`fadd`/`cswap`, where the target
/// window comes from a descriptor the application obtained out of band
/// (typically from an earlier `send`); `send` itself carries no remote
/// descriptor; the command buffer slot is the destination.
pub struct SubmitContext<'a> {
    pub op_id: u64,
    pub src_op_id: u32,
    pub wr: &'a WorkRequest,
    pub local: &'a Buffer,
    pub remote: Option<&'a RemoteBufferDescriptor>,
}

/// Everything a provider adapter must supply to back the transport
/// facade's public operations. Implementations are tagged variants held
/// by [`crate::transport::Transport`] (`ProviderImpl`), not trait objects,
/// so the facade's hot path never pays for dynamic dispatch on work
/// submission; only the completion source is dynamically dispatched,
/// since the progress loop already treats it as a trait object.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Brings up provider-level resources (device context, protection
    /// domain, and so on). Idempotent.
    fn start(&self) -> Result<()>;

    /// Releases provider-level resources. In-flight operations are not
    /// this call's concern; the facade drains them first.
    fn stop(&self) -> Result<()>;

    /// Creates the provider-specific resources for a new connection to
    /// `peer` (queue pairs, or simply records the MPI rank) and returns
    /// the local parameters to advertise to the peer during rendezvous.
    fn prepare_connection(&self, peer: Pid) -> Result<(Connection, PeerParams)>;

    /// Completes a connection using the peer parameters learned from the
    /// other side's rendezvous response (or, on the accept side, from
    /// its request): advances verbs QPs RESET→INIT→RTR→RTS, or simply
    /// marks an MPI/loopback connection ready.
    fn complete_connection(&self, conn: &Connection, remote: &PeerParams) -> Result<()>;

    fn disconnect(&self, conn: &Connection) -> Result<()>;

    fn register_memory(&self, ptr: usize, len: usize, flags: BufferFlags) -> Result<Registration>;

    fn unregister_memory(&self, provider_handle: &[u8]) -> Result<()>;

    /// Submits a work request for one of the five operation kinds. The
    /// provider owns framing (eager vs. rendezvous, for `send`) and is
    /// responsible for eventually reporting a [`crate::engine::progress::Completion`]
    /// through its [`CompletionSource`].
    fn submit(&self, ctx: SubmitContext<'_>) -> Result<()>;

    /// The channel the progress engine polls for this provider's completions.
    fn completion_source(&self) -> Arc<dyn CompletionSource>;

    /// Completes an unexpected receive previously surfaced through the
    /// unexpected EQ: delivers the payload named by `peer`/`slot` into
    /// `[dest_ptr, dest_ptr+dest_len)` (copy for an eager message, a
    /// one-sided read against the packed initiator handle for a
    /// rendezvous one), reposts the command-buffer slot, and returns the
    /// number of bytes actually delivered (capped at `dest_len`).
    fn complete_unexpected(&self, peer: Pid, slot: usize, dest_ptr: usize, dest_len: usize) -> Result<u64>;
}
