// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer: a polymorphic handle naming a remote process, plus its
//! provider-specific packable descriptor.

use crate::core::pid::Pid;
use crate::core::url::Url;
use parking_lot::RwLock;
use std::sync::Arc;

/// How a [`Peer`] came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOrigin {
    /// Created from an outbound `connect(url)` call.
    Outbound,
    /// Created from an inbound accept (rendezvous server side).
    Inbound,
    /// Reconstructed from a wire-encoded peer blob.
    Unpacked,
}

/// A remote process handle.
///
/// Holds a back-pointer to its connection's internal id once the
/// connection is established; `None` while the peer is still being set up.
pub struct Peer {
    pid: Pid,
    origin: PeerOrigin,
    /// Cached provider-specific packable descriptor (opaque to the core;
    /// interpreted by the provider adapter during `connect`).
    packed_descriptor: RwLock<Vec<u8>>,
    connection_id: RwLock<Option<u64>>,
}

impl Peer {
    #[must_use]
    pub fn from_url(url: &Url) -> Result<Peer, crate::error::Error> {
        let pid = url.to_pid()?;
        Ok(Peer {
            pid,
            origin: PeerOrigin::Outbound,
            packed_descriptor: RwLock::new(Vec::new()),
            connection_id: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn inbound(pid: Pid, packed_descriptor: Vec<u8>) -> Peer {
        Peer {
            pid,
            origin: PeerOrigin::Inbound,
            packed_descriptor: RwLock::new(packed_descriptor),
            connection_id: RwLock::new(None),
        }
    }

    /// Reconstructs a peer from a wire-encoded blob: an 8-byte PID
    /// followed by the provider-specific packed descriptor.
    pub fn unpack(raw: &[u8]) -> Result<Arc<Peer>, crate::error::Error> {
        if raw.len() < 8 {
            return Err(crate::error::Error::InvalidArgument(
                "peer blob shorter than 8 bytes".into(),
            ));
        }
        let pid = Pid::from_raw(u64::from_le_bytes(raw[0..8].try_into().unwrap()));
        Ok(Arc::new(Peer {
            pid,
            origin: PeerOrigin::Unpacked,
            packed_descriptor: RwLock::new(raw[8..].to_vec()),
            connection_id: RwLock::new(None),
        }))
    }

    /// Encodes this peer for wire transmission: PID followed by its
    /// packed provider descriptor.
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        let mut out = self.pid.raw().to_le_bytes().to_vec();
        out.extend_from_slice(&self.packed_descriptor.read());
        out
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn origin(&self) -> PeerOrigin {
        self.origin
    }

    #[must_use]
    pub fn packed_descriptor(&self) -> Vec<u8> {
        self.packed_descriptor.read().clone()
    }

    pub fn set_packed_descriptor(&self, blob: Vec<u8>) {
        *self.packed_descriptor.write() = blob;
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<u64> {
        *self.connection_id.read()
    }

    pub fn bind_connection(&self, id: u64) {
        *self.connection_id.write() = Some(id);
    }

    pub fn unbind_connection(&self) {
        *self.connection_id.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_pack_unpack_round_trips() {
        let url = Url::parse("verbs://10.0.0.5:9000").unwrap();
        let peer = Peer::from_url(&url).unwrap();
        peer.set_packed_descriptor(vec![1, 2, 3, 4]);
        let packed = peer.pack();
        let unpacked = Peer::unpack(&packed).unwrap();
        assert_eq!(peer.pid(), unpacked.pid());
        assert_eq!(peer.packed_descriptor(), unpacked.packed_descriptor());
    }

    #[test]
    fn connection_binding_round_trips() {
        let url = Url::parse("mpi://10.0.0.5:9000").unwrap();
        let peer = Peer::from_url(&url).unwrap();
        assert_eq!(peer.connection_id(), None);
        peer.bind_connection(7);
        assert_eq!(peer.connection_id(), Some(7));
        peer.unbind_connection();
        assert_eq!(peer.connection_id(), None);
    }
}
