// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The provider-agnostic facade: the one type application code talks to.
//!
//! Binds the rendezvous control-plane listener, starts the progress
//! loop on a background thread, and turns the public connect/send/
//! put/get/atomic/EQ operations into [`WorkRequest`]s and registry/buffer
//! lookups the rest of the crate already knows how to handle.

use super::provider::{Provider, Registration, SubmitContext};
use crate::config::{self, RuntimeConfig};
use crate::connection::{Connection, ConnectionState, PeerParams};
use crate::core::buffer::{Buffer, BufferFlags, BufferId, RemoteBufferDescriptor};
use crate::core::peer::Peer;
use crate::core::pid::Pid;
use crate::core::registry::Registry;
use crate::core::url::Url;
use crate::engine::eq::{EqCallback, EventQueue};
use crate::engine::progress::{PendingUnexpected, ProgressEngine};
use crate::engine::wr::{Event, EventKind, OpKind, OpRecord, WorkId, WorkRequest};
use crate::error::{Error, Result, StatusCode};
use crate::rendezvous::protocol::connect_request_line;
use crate::rendezvous::{Request, RendezvousClient, RendezvousHandler, RendezvousServer};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::loopback::LoopbackProvider;
#[cfg(feature = "provider-mpi")]
use super::mpi::MpiProvider;
#[cfg(feature = "provider-verbs")]
use super::verbs::VerbsProvider;

/// Handle returned by [`Transport::eq_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EqHandle(u64);

/// Static snapshot of this transport instance's negotiated parameters.
#[derive(Debug, Clone)]
pub struct TransportAttrs {
    pub provider: &'static str,
    pub mtu: usize,
    pub command_buffer_depth: usize,
    /// `None` until `start()` has bound the rendezvous listener.
    pub local_pid: Option<Pid>,
}

/// Tagged union over the provider adapters, so the facade's hot path
/// never pays for dynamic dispatch on work submission (§9 Design Notes).
enum ProviderImpl {
    Loopback(LoopbackProvider),
    #[cfg(feature = "provider-verbs")]
    Verbs(VerbsProvider),
    #[cfg(feature = "provider-mpi")]
    Mpi(MpiProvider),
}

macro_rules! dispatch_provider {
    ($self:expr, |$p:ident| $body:expr) => {
        match $self {
            ProviderImpl::Loopback($p) => $body,
            #[cfg(feature = "provider-verbs")]
            ProviderImpl::Verbs($p) => $body,
            #[cfg(feature = "provider-mpi")]
            ProviderImpl::Mpi($p) => $body,
        }
    };
}

impl ProviderImpl {
    fn build(config: &RuntimeConfig) -> Result<ProviderImpl> {
        match config.provider() {
            None => Ok(ProviderImpl::Loopback(LoopbackProvider::new(
                config.mtu(),
                config.command_buffer_depth(),
            ))),
            Some(config::ProviderKind::Verbs) => {
                #[cfg(feature = "provider-verbs")]
                {
                    Ok(ProviderImpl::Verbs(VerbsProvider::open_first_device()?))
                }
                #[cfg(not(feature = "provider-verbs"))]
                {
                    Err(Error::ProviderError(
                        "transport.name=verbs but this build has no provider-verbs feature".into(),
                    ))
                }
            }
            Some(config::ProviderKind::Mpi) => {
                #[cfg(feature = "provider-mpi")]
                {
                    Ok(ProviderImpl::Mpi(MpiProvider::init()?))
                }
                #[cfg(not(feature = "provider-mpi"))]
                {
                    Err(Error::ProviderError(
                        "transport.name=mpi but this build has no provider-mpi feature".into(),
                    ))
                }
            }
            Some(config::ProviderKind::Libfabric) => Err(Error::ProviderError(
                "libfabric-style provider is not implemented".into(),
            )),
        }
    }

    /// Only the loopback provider needs to know its own PID ahead of
    /// `start()`, to publish itself into the process-wide directory.
    fn post_bind(&self, pid: Pid) {
        if let ProviderImpl::Loopback(p) = self {
            p.bind(pid);
        }
    }
}

impl Provider for ProviderImpl {
    fn name(&self) -> &'static str {
        dispatch_provider!(self, |p| p.name())
    }

    fn start(&self) -> Result<()> {
        dispatch_provider!(self, |p| p.start())
    }

    fn stop(&self) -> Result<()> {
        dispatch_provider!(self, |p| p.stop())
    }

    fn prepare_connection(&self, peer: Pid) -> Result<(Connection, PeerParams)> {
        dispatch_provider!(self, |p| p.prepare_connection(peer))
    }

    fn complete_connection(&self, conn: &Connection, remote: &PeerParams) -> Result<()> {
        dispatch_provider!(self, |p| p.complete_connection(conn, remote))
    }

    fn disconnect(&self, conn: &Connection) -> Result<()> {
        dispatch_provider!(self, |p| p.disconnect(conn))
    }

    fn register_memory(&self, ptr: usize, len: usize, flags: BufferFlags) -> Result<Registration> {
        dispatch_provider!(self, |p| p.register_memory(ptr, len, flags))
    }

    fn unregister_memory(&self, provider_handle: &[u8]) -> Result<()> {
        dispatch_provider!(self, |p| p.unregister_memory(provider_handle))
    }

    fn submit(&self, ctx: SubmitContext<'_>) -> Result<()> {
        dispatch_provider!(self, |p| p.submit(ctx))
    }

    fn completion_source(&self) -> Arc<dyn crate::engine::progress::CompletionSource> {
        dispatch_provider!(self, |p| p.completion_source())
    }

    fn complete_unexpected(&self, peer: Pid, slot: usize, dest_ptr: usize, dest_len: usize) -> Result<u64> {
        dispatch_provider!(self, |p| p.complete_unexpected(peer, slot, dest_ptr, dest_len))
    }
}

/// Shared state behind the cheaply-cloneable [`Transport`] handle. Split
/// out so the rendezvous accept-side handler can hold its own `Arc`
/// without the facade itself needing interior `Arc`-ness at every call site.
struct Inner {
    config: RuntimeConfig,
    provider: ProviderImpl,
    registry: Arc<Registry>,
    progress: Arc<ProgressEngine>,
    buffers: Arc<DashMap<BufferId, Arc<Buffer>>>,
    buffers_by_ptr: DashMap<usize, BufferId>,
    /// Transport-owned allocations (`alloc`, as opposed to `register_memory`
    /// against application memory), tracked so `free` knows it is safe to
    /// reclaim the backing storage.
    owned_allocations: DashMap<BufferId, (usize, usize)>,
    eqs: DashMap<EqHandle, Arc<EventQueue>>,
    next_eq_id: AtomicU64,
    local_pid: RwLock<Option<Pid>>,
    rendezvous_server: RwLock<Option<RendezvousServer>>,
    progress_thread: Mutex<Option<thread::JoinHandle<()>>>,
    started: AtomicBool,
}

/// Entry point for the transport: connect/disconnect, memory registration,
/// send/put/get/atomics, and event-queue management (§4.11).
///
/// Cheap to clone; clones share the same underlying registry, buffers,
/// provider, and progress engine.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Builds (but does not start) a transport over whatever provider
    /// `config`'s `transport.name` selects, or the loopback provider if
    /// unset.
    pub fn new(config: RuntimeConfig) -> Result<Transport> {
        let provider = ProviderImpl::build(&config)?;
        let registry = Arc::new(Registry::new());
        let buffers = Arc::new(DashMap::new());
        let progress = Arc::new(ProgressEngine::new(
            registry.clone(),
            buffers.clone(),
            config.freelist_size(),
        ));
        Ok(Transport {
            inner: Arc::new(Inner {
                config,
                provider,
                registry,
                progress,
                buffers,
                buffers_by_ptr: DashMap::new(),
                owned_allocations: DashMap::new(),
                eqs: DashMap::new(),
                next_eq_id: AtomicU64::new(1),
                local_pid: RwLock::new(None),
                rendezvous_server: RwLock::new(None),
                progress_thread: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// `true` once `start()` has brought the provider up and bound the
    /// rendezvous listener.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Snapshot of this instance's negotiated attributes.
    #[must_use]
    pub fn attrs(&self) -> TransportAttrs {
        TransportAttrs {
            provider: self.inner.provider.name(),
            mtu: self.inner.config.mtu(),
            command_buffer_depth: self.inner.config.command_buffer_depth(),
            local_pid: *self.inner.local_pid.read(),
        }
    }

    /// Brings the provider up, binds the rendezvous control-plane
    /// listener, and starts the progress loop on a dedicated thread.
    /// Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.inner.provider.start() {
            self.inner.started.store(false, Ordering::Release);
            return Err(e);
        }

        let handler: Arc<dyn RendezvousHandler> = Arc::new(ConnectHandler {
            inner: self.inner.clone(),
        });
        let server = match RendezvousServer::bind(&self.inner.config.bind_host(), self.inner.config.bind_port(), handler) {
            Ok(server) => server,
            Err(e) => {
                self.inner.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let local_addr = server.local_addr();
        let local_ip = match local_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
        };
        let local_pid = Pid::pack(local_ip, local_addr.port());
        *self.inner.local_pid.write() = Some(local_pid);
        self.inner.provider.post_bind(local_pid);
        *self.inner.rendezvous_server.write() = Some(server);

        let progress = self.inner.progress.clone();
        let source = self.inner.provider.completion_source();
        let handle = thread::Builder::new()
            .name("nnti-progress".into())
            .spawn(move || progress.run(source.as_ref()))
            .map_err(|e| Error::ProviderError(format!("failed to spawn progress thread: {e}")))?;
        *self.inner.progress_thread.lock() = Some(handle);
        Ok(())
    }

    /// Stops the progress loop, closes the rendezvous listener, and tears
    /// down provider resources. Idempotent; in-flight operations are
    /// dropped, not drained.
    pub fn stop(&self) -> Result<()> {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.progress.request_stop();
        if let Some(handle) = self.inner.progress_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(server) = self.inner.rendezvous_server.write().take() {
            server.shutdown();
        }
        self.inner.provider.stop()
    }

    /// Unblocks every thread parked in `eq_wait`, without consuming any
    /// already-pending event.
    pub fn interrupt(&self) {
        self.inner.progress.interrupt();
        for entry in self.inner.eqs.iter() {
            entry.value().notify();
        }
    }

    // ---------------------------------------------------------------
    // Connection lifecycle (§4.11, §4.12)
    // ---------------------------------------------------------------

    /// Connects to the peer named by `url` (`scheme://host:port`),
    /// negotiating provider parameters over the rendezvous control plane.
    /// Idempotent: a second `connect` to an already-connected peer returns
    /// the existing connection without re-negotiating.
    pub fn connect(&self, url: &str, timeout_ms: u64) -> Result<Arc<Peer>> {
        let parsed = Url::parse(url)?;
        let pid = parsed.to_pid()?;
        let peer = Arc::new(Peer::from_url(&parsed)?);

        if let Some(conn) = self.inner.registry.get_by_pid(pid) {
            peer.bind_connection(conn.id());
            return Ok(peer);
        }

        let port = parsed.port.ok_or_else(|| Error::MalformedUrl(url.to_string()))?;
        let addr = resolve_socket_addr(&parsed.host, port)?;

        let (conn, local_params) = self.inner.provider.prepare_connection(pid)?;
        conn.set_local_params(local_params.clone());
        let conn = Arc::new(conn);
        if !self.inner.registry.insert(conn.clone()) {
            // Lost the race against a concurrent connect (or an inbound
            // accept for the same peer); the winner's connection is
            // equally valid to bind against.
            let existing = self
                .inner
                .registry
                .get_by_pid(pid)
                .expect("just observed the slot as occupied");
            peer.bind_connection(existing.id());
            return Ok(peer);
        }

        let local_pid = self.inner.local_pid.read().ok_or(Error::InvalidHandle("transport not started"))?;
        let (_, local_port) = local_pid.unpack();
        let mut query: Vec<(&str, String)> = vec![
            ("host", self.inner.config.bind_host()),
            ("port", local_port.to_string()),
        ];
        for (k, v) in &local_params.provider_fields {
            query.push((k.as_str(), v.clone()));
        }
        let line = connect_request_line(self.inner.provider.name(), &query);

        let client = self.rendezvous_client_for(timeout_ms);
        let pairs = match client.request(addr, &line) {
            Ok(pairs) => pairs,
            Err(e) => {
                conn.mark_error();
                self.inner.registry.remove(&conn);
                return Err(e);
            }
        };

        let remote_params = peer_params_from_pairs(pairs, &parsed.host, port);
        conn.set_peer_params(remote_params.clone());
        if let Err(e) = self.inner.provider.complete_connection(&conn, &remote_params) {
            conn.mark_error();
            self.inner.registry.remove(&conn);
            return Err(e);
        }
        conn.mark_ready();
        peer.bind_connection(conn.id());
        Ok(peer)
    }

    fn rendezvous_client_for(&self, timeout_ms: u64) -> RendezvousClient {
        let backoff_ms = self.inner.config.rendezvous_backoff_ms();
        let budget = if timeout_ms == 0 {
            self.inner.config.rendezvous_retry_budget()
        } else {
            (timeout_ms / backoff_ms.max(1)).max(1) as u32
        };
        RendezvousClient::new(budget, Duration::from_millis(backoff_ms))
    }

    /// Tears down the connection to `pid`, failing every in-flight
    /// operation addressed to it with [`StatusCode::NotConnected`].
    pub fn disconnect(&self, pid: Pid) -> Result<()> {
        let conn = self
            .inner
            .registry
            .get_by_pid(pid)
            .ok_or_else(|| Error::PeerNotFound(pid.to_string()))?;
        self.inner.progress.fail_ops_for_peer(pid, StatusCode::NotConnected);
        let result = self.inner.provider.disconnect(&conn);
        conn.mark_closed();
        self.inner.registry.remove(&conn);
        result
    }

    // ---------------------------------------------------------------
    // Datatype helpers (§4.4)
    // ---------------------------------------------------------------

    #[must_use]
    pub fn dt_peer_to_pid(&self, peer: &Peer) -> Pid {
        peer.pid()
    }

    /// Reconstructs a [`Peer`] handle for an already-connected PID (e.g.
    /// one learned from an inbound accept rather than a local `connect`).
    pub fn dt_pid_to_peer(&self, pid: Pid) -> Result<Arc<Peer>> {
        let conn = self
            .inner
            .registry
            .get_by_pid(pid)
            .ok_or_else(|| Error::PeerNotFound(pid.to_string()))?;
        let peer = Peer::inbound(pid, Vec::new());
        peer.bind_connection(conn.id());
        Ok(Arc::new(peer))
    }

    pub fn dt_unpack_peer(&self, raw: &[u8]) -> Result<Arc<Peer>> {
        Peer::unpack(raw)
    }

    pub fn dt_unpack_buffer(&self, raw: &[u8]) -> Result<RemoteBufferDescriptor> {
        RemoteBufferDescriptor::unpack(raw)
    }

    // ---------------------------------------------------------------
    // Memory management (§4.3)
    // ---------------------------------------------------------------

    /// Registers application-owned memory `[ptr, ptr+len)`. If `eq` is
    /// given, `cb` (if any) becomes that event queue's synchronous
    /// callback, consulted at step 3 of the completion-destination chain.
    pub fn register_memory(
        &self,
        ptr: usize,
        len: usize,
        flags: BufferFlags,
        eq: Option<EqHandle>,
        cb: Option<EqCallback>,
    ) -> Result<BufferId> {
        self.register_memory_inner(ptr, len, flags, eq, cb, false)
    }

    /// Allocates `len` transport-owned bytes and registers them. Returns
    /// the buffer handle and the address application code should use for
    /// local reads/writes into it.
    pub fn alloc(
        &self,
        len: usize,
        flags: BufferFlags,
        eq: Option<EqHandle>,
        cb: Option<EqCallback>,
    ) -> Result<(usize, BufferId)> {
        if len == 0 {
            return Err(Error::InvalidArgument("cannot allocate a zero-length buffer".into()));
        }
        let storage = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(storage) as *mut u8 as usize;
        let id = match self.register_memory_inner(ptr, len, flags, eq, cb, true) {
            Ok(id) => id,
            Err(e) => {
                // Safety: `ptr` was just produced by `Box::into_raw` above
                // and has not been handed to anything else yet.
                unsafe {
                    drop(Box::from_raw(std::slice::from_raw_parts_mut(ptr as *mut u8, len)));
                }
                return Err(e);
            }
        };
        self.inner.owned_allocations.insert(id, (ptr, len));
        Ok((ptr, id))
    }

    fn register_memory_inner(
        &self,
        ptr: usize,
        len: usize,
        flags: BufferFlags,
        eq: Option<EqHandle>,
        cb: Option<EqCallback>,
        owned: bool,
    ) -> Result<BufferId> {
        if len == 0 {
            return Err(Error::InvalidArgument("cannot register a zero-length buffer".into()));
        }
        let eq_arc = eq.map(|h| self.get_eq(h)).transpose()?;
        if let Some(cb) = cb {
            match &eq_arc {
                Some(q) => q.set_callback(cb),
                None => {
                    return Err(Error::InvalidArgument(
                        "a buffer callback requires an event queue to attach to".into(),
                    ))
                }
            }
        }
        let registration = self.inner.provider.register_memory(ptr, len, flags)?;
        let buffer = Arc::new(Buffer::new(ptr, len, flags, eq_arc, registration.provider_handle, owned));
        let id = buffer.id();
        self.inner.buffers_by_ptr.insert(ptr, id);
        self.inner.buffers.insert(id, buffer);
        Ok(id)
    }

    /// Deregisters `handle` with the provider. Fails if any tracked
    /// operation still references it.
    pub fn unregister_memory(&self, handle: BufferId) -> Result<()> {
        if self.inner.progress.has_ops_referencing_buffer(handle) {
            return Err(Error::InvalidArgument(
                "buffer has outstanding operations".into(),
            ));
        }
        let (_, buffer) = self
            .inner
            .buffers
            .remove(&handle)
            .ok_or(Error::InvalidHandle("buffer"))?;
        self.inner.buffers_by_ptr.remove(&buffer.ptr());
        self.inner.provider.unregister_memory(buffer.provider_handle())?;
        Ok(())
    }

    /// Deregisters and reclaims a transport-owned buffer created by
    /// `alloc`. Returns [`Error::InvalidArgument`] for an
    /// application-owned buffer; use `unregister_memory` for those.
    pub fn free(&self, handle: BufferId) -> Result<()> {
        let (ptr, len) = self
            .inner
            .owned_allocations
            .get(&handle)
            .map(|e| *e.value())
            .ok_or_else(|| Error::InvalidArgument("free() called on a buffer not returned by alloc()".into()))?;
        self.unregister_memory(handle)?;
        self.inner.owned_allocations.remove(&handle);
        // Safety: `ptr`/`len` are exactly what `alloc` passed to
        // `Box::into_raw` for this handle, and this is the only path that
        // reclaims them.
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(ptr as *mut u8, len)));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Event queues (§4.6, §4.7)
    // ---------------------------------------------------------------

    #[must_use]
    pub fn eq_create(&self, size: usize, cb: Option<EqCallback>) -> EqHandle {
        let eq = Arc::new(EventQueue::new(size));
        if let Some(cb) = cb {
            eq.set_callback(cb);
        }
        let id = EqHandle(self.inner.next_eq_id.fetch_add(1, Ordering::Relaxed));
        self.inner.eqs.insert(id, eq);
        id
    }

    pub fn eq_destroy(&self, eq: EqHandle) -> Result<()> {
        self.inner
            .eqs
            .remove(&eq)
            .map(|_| ())
            .ok_or(Error::InvalidHandle("event queue"))
    }

    /// Routes unclaimed receives (no posted buffer matches) to `eq`.
    pub fn set_unexpected_eq(&self, eq: EqHandle) -> Result<()> {
        let q = self.get_eq(eq)?;
        self.inner.progress.set_unexpected_eq(q);
        Ok(())
    }

    fn get_eq(&self, eq: EqHandle) -> Result<Arc<EventQueue>> {
        self.inner
            .eqs
            .get(&eq)
            .map(|e| e.value().clone())
            .ok_or(Error::InvalidHandle("event queue"))
    }

    /// Blocks up to `timeout` for an event on any of `eqs`, returning the
    /// first to fire along with which queue it came from.
    pub fn eq_wait(&self, eqs: &[EqHandle], timeout: Duration) -> Result<(EqHandle, Event)> {
        if eqs.is_empty() {
            return Err(Error::InvalidArgument("eq_wait requires at least one event queue".into()));
        }
        let queues: Vec<(EqHandle, Arc<EventQueue>)> =
            eqs.iter().map(|h| Ok((*h, self.get_eq(*h)?))).collect::<Result<_>>()?;

        for (h, q) in &queues {
            if let Some(event) = q.pop() {
                return Ok((*h, event));
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimedOut);
            }
            let slice = remaining.min(Duration::from_millis(20));
            let woken = queues[0].1.wait(slice);
            for (h, q) in &queues {
                if let Some(event) = q.pop() {
                    return Ok((*h, event));
                }
            }
            if woken {
                return Err(Error::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
        }
    }

    /// Blocks up to `timeout` for the specific operation named by `wid`.
    pub fn wait(&self, wid: WorkId, timeout: Duration) -> Result<StatusCode> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.inner.progress.recent_result(wid.0) {
                return Ok(event.result);
            }
            if !self.inner.progress.is_in_flight(wid.0) {
                return Err(Error::InvalidHandle("work id"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::TimedOut);
            }
            thread::sleep(remaining.min(Duration::from_micros(200)));
        }
    }

    /// Best-effort cancel: always succeeds, but a work request the
    /// provider already posted cannot truly be revoked (§5).
    pub fn cancel(&self, wid: WorkId) -> Result<()> {
        self.inner.progress.forget(wid.0);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Unexpected-receive completion (§4.10)
    // ---------------------------------------------------------------

    /// Completes delivery of the oldest still-pending unexpected receive
    /// into `[buffer+offset, ..)`.
    pub fn next_unexpected(&self, buffer: BufferId, offset: u64) -> Result<Event> {
        let (id, pending) = self
            .inner
            .progress
            .take_oldest_pending_unexpected()
            .ok_or_else(|| Error::InvalidArgument("no pending unexpected receive".into()))?;
        self.complete_pending(id, pending, buffer, offset)
    }

    /// Completes delivery of the specific unexpected receive named by
    /// `event.context` (as returned through an unexpected EQ).
    pub fn get_unexpected(&self, event: &Event, buffer: BufferId, offset: u64) -> Result<Event> {
        let pending = self
            .inner
            .progress
            .take_pending_unexpected(event.context)
            .ok_or_else(|| Error::InvalidArgument("unexpected receive already completed or unknown".into()))?;
        self.complete_pending(event.context, pending, buffer, offset)
    }

    fn complete_pending(&self, id: u64, pending: PendingUnexpected, buffer: BufferId, offset: u64) -> Result<Event> {
        let buf = self
            .inner
            .buffers
            .get(&buffer)
            .map(|e| e.value().clone())
            .ok_or(Error::InvalidHandle("buffer"))?;
        if offset as usize > buf.len() {
            return Err(Error::InvalidArgument("offset exceeds buffer length".into()));
        }
        let dest_ptr = buf.ptr() + offset as usize;
        let dest_len = buf.len() - offset as usize;
        let delivered = self.inner.provider.complete_unexpected(pending.peer, pending.slot, dest_ptr, dest_len)?;
        Ok(Event {
            result: StatusCode::Ok,
            kind: EventKind::Recv,
            peer: pending.peer,
            length: delivered,
            start: offset,
            offset,
            context: id,
        })
    }

    /// Marks `event` as handled by the application. Events here are
    /// plain `Copy` values with no backing allocation, so this exists for
    /// API symmetry rather than to release a resource.
    pub fn event_complete(&self, _event: Event) -> Result<()> {
        Ok(())
    }

    // ---------------------------------------------------------------
    // Data operations (§4.5)
    // ---------------------------------------------------------------

    pub fn send(&self, mut wr: WorkRequest) -> Result<WorkId> {
        wr.op = OpKind::Send;
        self.submit(wr)
    }

    pub fn put(&self, mut wr: WorkRequest) -> Result<WorkId> {
        wr.op = OpKind::Put;
        self.submit(wr)
    }

    pub fn get(&self, mut wr: WorkRequest) -> Result<WorkId> {
        wr.op = OpKind::Get;
        self.submit(wr)
    }

    pub fn atomic_fop(&self, mut wr: WorkRequest) -> Result<WorkId> {
        wr.op = OpKind::Fadd;
        self.submit(wr)
    }

    pub fn atomic_cswap(&self, mut wr: WorkRequest) -> Result<WorkId> {
        wr.op = OpKind::Cswap;
        self.submit(wr)
    }

    fn submit(&self, wr: WorkRequest) -> Result<WorkId> {
        let buffer = self
            .inner
            .buffers
            .get(&wr.local_buffer)
            .map(|e| e.value().clone())
            .ok_or(Error::InvalidHandle("local buffer"))?;
        if wr.local_offset + wr.length > buffer.len() as u64 {
            return Err(Error::InvalidArgument(
                "work request local window exceeds buffer length".into(),
            ));
        }
        if matches!(wr.op, OpKind::Put | OpKind::Get | OpKind::Fadd | OpKind::Cswap) && wr.remote.is_none() {
            return Err(Error::InvalidArgument(
                "put/get/atomic_fop/atomic_cswap require a remote buffer descriptor".into(),
            ));
        }

        let conn = self
            .inner
            .registry
            .get_by_pid(wr.peer)
            .ok_or_else(|| Error::PeerNotFound(wr.peer.to_string()))?;
        if conn.state() != ConnectionState::Ready {
            return Err(Error::ConnectionFailed {
                peer: wr.peer.to_string(),
                reason: "connection is not ready".into(),
            });
        }

        let op_id = self.inner.progress.next_op_id();
        let src_op_id = op_id as u32;
        let record = Arc::new(OpRecord::new(op_id, wr.clone(), src_op_id));
        self.inner.progress.track(record);

        let ctx = SubmitContext {
            op_id,
            src_op_id,
            wr: &wr,
            local: &buffer,
            remote: wr.remote.as_ref(),
        };
        if let Err(e) = self.inner.provider.submit(ctx) {
            self.inner.progress.forget(op_id);
            return Err(e);
        }
        Ok(WorkId(op_id))
    }
}

fn resolve_socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::MalformedUrl(format!("unresolvable host: {host}")))?
        .next()
        .ok_or_else(|| Error::MalformedUrl(format!("unresolvable host: {host}")))
}

fn peer_params_from_pairs(pairs: Vec<(String, String)>, fallback_host: &str, fallback_port: u16) -> PeerParams {
    let hostname = pairs
        .iter()
        .find(|(k, _)| k == "hostname")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| fallback_host.to_string());
    let addr = pairs
        .iter()
        .find(|(k, _)| k == "addr")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| fallback_host.to_string());
    let port = pairs
        .iter()
        .find(|(k, _)| k == "port")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(fallback_port);
    let provider_fields = pairs
        .into_iter()
        .filter(|(k, _)| k != "hostname" && k != "addr" && k != "port")
        .collect();
    PeerParams {
        hostname,
        addr,
        port,
        provider_fields,
    }
}

/// Backs the rendezvous control-plane listener's `connect`/`disconnect`/
/// `stats`/`peers` surface (§4.12), accepting inbound requests against
/// the same registry and provider `connect()` drives on the initiating side.
struct ConnectHandler {
    inner: Arc<Inner>,
}

impl RendezvousHandler for ConnectHandler {
    fn handle(&self, req: &Request) -> Result<Vec<(String, String)>> {
        match req.action.as_str() {
            "connect" => self.handle_connect(req),
            "disconnect" => self.handle_disconnect(req),
            "stats" => Ok(self.handle_stats()),
            "peers" => Ok(self.handle_peers()),
            other => Err(Error::InvalidArgument(format!("unrecognized rendezvous action: {other}"))),
        }
    }
}

impl ConnectHandler {
    fn request_pid(req: &Request) -> Result<(Pid, String, u16)> {
        let host = req
            .get("host")
            .ok_or_else(|| Error::InvalidArgument("rendezvous request missing host".into()))?;
        let port: u16 = req
            .get("port")
            .ok_or_else(|| Error::InvalidArgument("rendezvous request missing port".into()))?
            .parse()
            .map_err(|_| Error::InvalidArgument("rendezvous request port is not a number".into()))?;
        let addr: Ipv4Addr = host
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("rendezvous request host is not an ipv4 literal: {host}")))?;
        Ok((Pid::pack(addr, port), host.to_string(), port))
    }

    fn handle_connect(&self, req: &Request) -> Result<Vec<(String, String)>> {
        let (pid, host, port) = Self::request_pid(req)?;

        if let Some(conn) = self.inner.registry.get_by_pid(pid) {
            // Idempotent: a retransmitted connect request must not spawn
            // a second connection or re-run provider negotiation.
            return Ok(response_fields(&conn.local_params()));
        }

        let (conn, local_params) = self.inner.provider.prepare_connection(pid)?;
        conn.set_local_params(local_params.clone());
        let remote_params = PeerParams {
            hostname: host.clone(),
            addr: host,
            port,
            provider_fields: req
                .params
                .iter()
                .filter(|(k, _)| k != "host" && k != "port")
                .cloned()
                .collect(),
        };
        conn.set_peer_params(remote_params.clone());
        self.inner.provider.complete_connection(&conn, &remote_params)?;
        conn.mark_ready();
        self.inner.registry.insert(Arc::new(conn));
        Ok(response_fields(&local_params))
    }

    fn handle_disconnect(&self, req: &Request) -> Result<Vec<(String, String)>> {
        let (pid, _, _) = Self::request_pid(req)?;
        if let Some(conn) = self.inner.registry.get_by_pid(pid) {
            self.inner.progress.fail_ops_for_peer(pid, StatusCode::NotConnected);
            let _ = self.inner.provider.disconnect(&conn);
            conn.mark_closed();
            self.inner.registry.remove(&conn);
        }
        Ok(Vec::new())
    }

    fn handle_stats(&self) -> Vec<(String, String)> {
        let html = format!(
            "<html><body><ul><li>connections={}</li><li>buffers={}</li><li>dropped_events={}</li></ul></body></html>",
            self.inner.registry.len(),
            self.inner.buffers.len(),
            self.inner.progress.dropped_events(),
        );
        vec![("html".to_string(), html)]
    }

    fn handle_peers(&self) -> Vec<(String, String)> {
        let items: String = self
            .inner
            .registry
            .snapshot()
            .iter()
            .map(|c| format!("<li>{} ({:?})</li>", c.pid(), c.state()))
            .collect();
        vec![("html".to_string(), format!("<html><body><ul>{items}</ul></body></html>"))]
    }
}

fn response_fields(params: &PeerParams) -> Vec<(String, String)> {
    let mut out = vec![
        ("hostname".to_string(), params.hostname.clone()),
        ("addr".to_string(), params.addr.clone()),
        ("port".to_string(), params.port.to_string()),
    ];
    out.extend(params.provider_fields.clone());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use crate::engine::wr::WrFlags;

    fn loopback_transport() -> Transport {
        let config = RuntimeConfig::new();
        config.set(keys::BIND_HOST, "127.0.0.1");
        let transport = Transport::new(config).unwrap();
        transport.start().unwrap();
        transport
    }

    fn base_wr(peer: Pid, local_buffer: BufferId, length: u64) -> WorkRequest {
        WorkRequest {
            op: OpKind::Send,
            flags: WrFlags::empty(),
            peer,
            local_buffer,
            local_offset: 0,
            length,
            remote_offset: 0,
            remote: None,
            operand1: 0,
            operand2: 0,
            cb: None,
            alt_eq: None,
            context: 0,
        }
    }

    #[test]
    fn new_transport_defaults_to_loopback_provider() {
        let transport = Transport::new(RuntimeConfig::new()).unwrap();
        assert_eq!(transport.attrs().provider, "loopback");
        assert!(!transport.initialized());
    }

    #[test]
    fn start_stop_is_idempotent_and_assigns_a_local_pid() {
        let transport = loopback_transport();
        assert!(transport.initialized());
        assert!(transport.attrs().local_pid.is_some());
        transport.start().unwrap();
        transport.stop().unwrap();
        transport.stop().unwrap();
        assert!(!transport.initialized());
    }

    #[test]
    fn connect_round_trips_over_the_rendezvous_listener() {
        let a = loopback_transport();
        let b = loopback_transport();
        let b_pid = b.attrs().local_pid.unwrap();
        let (b_addr, b_port) = b_pid.unpack();

        let peer = a.connect(&format!("loopback://{b_addr}:{b_port}"), 2000).unwrap();
        assert_eq!(peer.pid(), b_pid);

        // Reconnecting to the same peer is idempotent.
        let peer2 = a.connect(&format!("loopback://{b_addr}:{b_port}"), 2000).unwrap();
        assert_eq!(peer2.pid(), b_pid);

        a.stop().unwrap();
        b.stop().unwrap();
    }

    #[test]
    fn eager_send_round_trips_through_the_public_api() {
        let a = loopback_transport();
        let b = loopback_transport();
        let b_pid = b.attrs().local_pid.unwrap();
        let (b_addr, b_port) = b_pid.unpack();
        a.connect(&format!("loopback://{b_addr}:{b_port}"), 2000).unwrap();

        let mut src = *b"hello, nnti!!!!!";
        let src_ptr = src.as_mut_ptr() as usize;
        let src_id = a
            .register_memory(src_ptr, src.len(), BufferFlags::LOCAL_READ, None, None)
            .unwrap();

        let unexpected_eq = b.eq_create(8, None);
        b.set_unexpected_eq(unexpected_eq).unwrap();

        let mut dst = [0u8; 16];
        let dst_ptr = dst.as_mut_ptr() as usize;
        let dst_id = b
            .register_memory(dst_ptr, dst.len(), BufferFlags::LOCAL_WRITE, None, None)
            .unwrap();

        let wid = a.send(base_wr(b_pid, src_id, src.len() as u64)).unwrap();
        let status = a.wait(wid, Duration::from_secs(2)).unwrap();
        assert_eq!(status, StatusCode::Ok);

        let (_, event) = b.eq_wait(&[unexpected_eq], Duration::from_secs(2)).unwrap();
        assert_eq!(event.kind, EventKind::Recv);
        let completed = b.get_unexpected(&event, dst_id, 0).unwrap();
        assert_eq!(completed.length, src.len() as u64);
        assert_eq!(&dst, &src);

        a.stop().unwrap();
        b.stop().unwrap();
    }

    #[test]
    fn put_writes_directly_into_the_remote_window() {
        let a = loopback_transport();
        let b = loopback_transport();
        let b_pid = b.attrs().local_pid.unwrap();
        let (b_addr, b_port) = b_pid.unpack();
        a.connect(&format!("loopback://{b_addr}:{b_port}"), 2000).unwrap();

        let mut src = [9u8; 8];
        let src_ptr = src.as_mut_ptr() as usize;
        let src_id = a
            .register_memory(src_ptr, src.len(), BufferFlags::LOCAL_READ, None, None)
            .unwrap();

        let mut dst = [0u8; 8];
        let dst_ptr = dst.as_mut_ptr() as usize;
        let dst_id = b
            .register_memory(dst_ptr, dst.len(), BufferFlags::REMOTE_WRITE, None, None)
            .unwrap();
        let rbd = {
            let buffer = b.inner.buffers.get(&dst_id).unwrap();
            buffer.make_remote_descriptor(0, 8).unwrap()
        };

        let mut wr = base_wr(b_pid, src_id, 8);
        wr.remote = Some(rbd);
        let wid = a.put(wr).unwrap();
        let status = a.wait(wid, Duration::from_secs(2)).unwrap();
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(dst, [9u8; 8]);

        a.stop().unwrap();
        b.stop().unwrap();
    }

    #[test]
    fn atomic_fetch_add_returns_previous_value() {
        let a = loopback_transport();
        let b = loopback_transport();
        let b_pid = b.attrs().local_pid.unwrap();
        let (b_addr, b_port) = b_pid.unpack();
        a.connect(&format!("loopback://{b_addr}:{b_port}"), 2000).unwrap();

        let mut counter = 100u64.to_le_bytes();
        let counter_ptr = counter.as_mut_ptr() as usize;
        let counter_id = b
            .register_memory(counter_ptr, 8, BufferFlags::REMOTE_ATOMIC, None, None)
            .unwrap();
        let rbd = {
            let buffer = b.inner.buffers.get(&counter_id).unwrap();
            buffer.make_remote_descriptor(0, 8).unwrap()
        };

        let mut local = 0u64.to_le_bytes();
        let local_ptr = local.as_mut_ptr() as usize;
        let local_id = a
            .register_memory(local_ptr, 8, BufferFlags::LOCAL_WRITE, None, None)
            .unwrap();

        let mut wr = base_wr(b_pid, local_id, 8);
        wr.remote = Some(rbd);
        wr.operand1 = 5;
        let wid = a.atomic_fop(wr).unwrap();
        a.wait(wid, Duration::from_secs(2)).unwrap();
        assert_eq!(u64::from_le_bytes(local), 100);
        assert_eq!(u64::from_le_bytes(counter), 105);

        a.stop().unwrap();
        b.stop().unwrap();
    }

    #[test]
    fn send_to_unconnected_peer_fails() {
        let a = loopback_transport();
        let mut src = [0u8; 4];
        let src_ptr = src.as_mut_ptr() as usize;
        let src_id = a
            .register_memory(src_ptr, src.len(), BufferFlags::LOCAL_READ, None, None)
            .unwrap();
        let ghost = Pid::pack(Ipv4Addr::new(10, 9, 9, 9), 9999);
        assert!(a.send(base_wr(ghost, src_id, 4)).is_err());
        a.stop().unwrap();
    }

    #[test]
    fn free_rejects_a_buffer_that_was_not_allocated_by_alloc() {
        let a = loopback_transport();
        let mut src = [0u8; 4];
        let src_ptr = src.as_mut_ptr() as usize;
        let id = a
            .register_memory(src_ptr, src.len(), BufferFlags::LOCAL_READ, None, None)
            .unwrap();
        assert!(a.free(id).is_err());
        a.unregister_memory(id).unwrap();
        a.stop().unwrap();
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let a = loopback_transport();
        let (ptr, id) = a.alloc(64, BufferFlags::LOCAL_READ | BufferFlags::LOCAL_WRITE, None, None).unwrap();
        assert_ne!(ptr, 0);
        a.free(id).unwrap();
        a.stop().unwrap();
    }

    #[test]
    fn interrupt_unblocks_eq_wait_without_an_event() {
        let a = loopback_transport();
        let eq = a.eq_create(4, None);
        let transport = a.clone();
        let handle = thread::spawn(move || transport.eq_wait(&[eq], Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        a.interrupt();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Interrupted)));
        a.stop().unwrap();
    }
}
