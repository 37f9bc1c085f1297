// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection lifecycle: provider resources (queue pairs or MPI rank)
//! plus the peer parameters learned during rendezvous.

use crate::core::pid::Pid;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    New = 0,
    Ready = 1,
    Error = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::New,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Error,
            _ => ConnectionState::Closed,
        }
    }
}

/// Peer parameters learned during the rendezvous exchange (§ rendezvous glue).
#[derive(Debug, Clone, Default)]
pub struct PeerParams {
    pub hostname: String,
    pub addr: String,
    pub port: u16,
    /// Provider-specific identifiers: for verbs, `lid`/`gid`/`qpn` triples
    /// encoded as `key=value` strings; for MPI, the peer rank.
    pub provider_fields: Vec<(String, String)>,
}

impl PeerParams {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.provider_fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Verbs queue-pair state-machine stage (RESET→INIT→RTR→RTS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
}

/// A single verbs queue pair's software-tracked state. The numeric QP
/// number and min-RNR timer are provider handles; NNTI only tracks the
/// state-machine stage here, the provider crate owns the real QP object.
#[derive(Debug, Clone)]
pub struct VerbsQueuePair {
    pub role: QueuePairRole,
    pub state: QpState,
    pub qpn: u32,
    pub min_rnr_timer: u8,
}

/// The three queue pairs a verbs connection maintains (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairRole {
    Command,
    Rdma,
    LongGet,
}

impl QueuePairRole {
    /// RDMA QPs tolerate a longer min-RNR timer than the command QP,
    /// because data transfers may legitimately wait on posted receives.
    #[must_use]
    pub fn default_min_rnr_timer(self) -> u8 {
        match self {
            QueuePairRole::Command => 12,
            QueuePairRole::Rdma | QueuePairRole::LongGet => 24,
        }
    }
}

/// Provider-specific connection resources.
pub enum ConnectionResources {
    Verbs {
        command_qp: VerbsQueuePair,
        rdma_qp: VerbsQueuePair,
        long_get_qp: VerbsQueuePair,
    },
    Mpi {
        rank: i32,
    },
    Loopback,
}

impl ConnectionResources {
    #[must_use]
    pub fn new_verbs() -> ConnectionResources {
        let make = |role: QueuePairRole| VerbsQueuePair {
            role,
            state: QpState::Reset,
            qpn: 0,
            min_rnr_timer: role.default_min_rnr_timer(),
        };
        ConnectionResources::Verbs {
            command_qp: make(QueuePairRole::Command),
            rdma_qp: make(QueuePairRole::Rdma),
            long_get_qp: make(QueuePairRole::LongGet),
        }
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A connection to a single remote peer, owned by the process-wide
/// [`crate::core::registry::Registry`].
pub struct Connection {
    id: u64,
    pid: Pid,
    state: AtomicU8,
    peer_params: RwLock<PeerParams>,
    local_params: RwLock<PeerParams>,
    resources: RwLock<ConnectionResources>,
    fingerprint: RwLock<String>,
}

impl Connection {
    #[must_use]
    pub fn new(pid: Pid, resources: ConnectionResources) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            pid,
            state: AtomicU8::new(ConnectionState::New as u8),
            peer_params: RwLock::new(PeerParams::default()),
            local_params: RwLock::new(PeerParams::default()),
            resources: RwLock::new(resources),
            fingerprint: RwLock::new(String::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Promotes the connection to `ready` once rendezvous parameters have
    /// been exchanged and (for verbs) all three QPs reached RTS.
    pub fn mark_ready(&self) {
        self.state
            .store(ConnectionState::Ready as u8, Ordering::Release);
    }

    /// Moves the connection to `error`. Per the peer-scoped error policy,
    /// callers must then drain in-flight ops with `EIO` and remove the
    /// connection from the registry.
    pub fn mark_error(&self) {
        self.state
            .store(ConnectionState::Error as u8, Ordering::Release);
    }

    /// Moves the connection to `closed` after provider resources have
    /// been drained and released.
    pub fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    pub fn set_peer_params(&self, params: PeerParams) {
        *self.peer_params.write() = params;
    }

    pub fn peer_params(&self) -> PeerParams {
        self.peer_params.read().clone()
    }

    /// The local half of the rendezvous exchange (what this process
    /// advertised to the peer), kept for `complete_connection` retries
    /// and for diagnostics via the stats control-plane hook.
    pub fn set_local_params(&self, params: PeerParams) {
        *self.local_params.write() = params;
    }

    #[must_use]
    pub fn local_params(&self) -> PeerParams {
        self.local_params.read().clone()
    }

    pub fn set_fingerprint(&self, fp: String) {
        *self.fingerprint.write() = fp;
    }

    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.fingerprint.read().clone()
    }

    /// Advances a verbs QP through RESET→INIT→RTR→RTS. No-op for non-verbs
    /// resources.
    pub fn advance_qp(&self, role: QueuePairRole, next: QpState) {
        let mut resources = self.resources.write();
        if let ConnectionResources::Verbs {
            command_qp,
            rdma_qp,
            long_get_qp,
        } = &mut *resources
        {
            let qp = match role {
                QueuePairRole::Command => command_qp,
                QueuePairRole::Rdma => rdma_qp,
                QueuePairRole::LongGet => long_get_qp,
            };
            qp.state = next;
        }
    }

    /// `true` once every verbs QP (or the MPI rank) is ready to carry
    /// traffic.
    #[must_use]
    pub fn all_qps_ready(&self) -> bool {
        match &*self.resources.read() {
            ConnectionResources::Verbs {
                command_qp,
                rdma_qp,
                long_get_qp,
            } => {
                [command_qp, rdma_qp, long_get_qp]
                    .iter()
                    .all(|qp| qp.state == QpState::ReadyToSend)
            }
            ConnectionResources::Mpi { .. } | ConnectionResources::Loopback => true,
        }
    }

    #[must_use]
    pub fn mpi_rank(&self) -> Option<i32> {
        match &*self.resources.read() {
            ConnectionResources::Mpi { rank } => Some(*rank),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_pid() -> Pid {
        Pid::pack(Ipv4Addr::new(10, 0, 0, 1), 9000)
    }

    #[test]
    fn new_connection_starts_in_new_state() {
        let conn = Connection::new(test_pid(), ConnectionResources::Loopback);
        assert_eq!(conn.state(), ConnectionState::New);
    }

    #[test]
    fn lifecycle_transitions() {
        let conn = Connection::new(test_pid(), ConnectionResources::Loopback);
        conn.mark_ready();
        assert_eq!(conn.state(), ConnectionState::Ready);
        conn.mark_error();
        assert_eq!(conn.state(), ConnectionState::Error);
        conn.mark_closed();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn verbs_qps_require_all_rts_before_ready() {
        let conn = Connection::new(test_pid(), ConnectionResources::new_verbs());
        assert!(!conn.all_qps_ready());
        for role in [
            QueuePairRole::Command,
            QueuePairRole::Rdma,
            QueuePairRole::LongGet,
        ] {
            conn.advance_qp(role, QpState::Init);
            conn.advance_qp(role, QpState::ReadyToReceive);
            conn.advance_qp(role, QpState::ReadyToSend);
        }
        assert!(conn.all_qps_ready());
    }

    #[test]
    fn rdma_qp_gets_longer_min_rnr_timer_than_command_qp() {
        match ConnectionResources::new_verbs() {
            ConnectionResources::Verbs {
                command_qp,
                rdma_qp,
                ..
            } => {
                assert!(rdma_qp.min_rnr_timer > command_qp.min_rnr_timer);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn mpi_connections_are_always_ready() {
        let conn = Connection::new(test_pid(), ConnectionResources::Mpi { rank: 3 });
        assert!(conn.all_qps_ready());
        assert_eq!(conn.mpi_rank(), Some(3));
    }
}
