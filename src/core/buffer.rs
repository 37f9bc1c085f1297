// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registered memory buffers and remote buffer descriptors (RBDs).

use crate::config::MAX_NET_BUFFER_REMOTE_SIZE;
use crate::engine::eq::EventQueue;
use crate::error::{Error, Result};
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags! {
    /// Registration/access flags for a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        const LOCAL_READ    = 1 << 0;
        const LOCAL_WRITE   = 1 << 1;
        const REMOTE_READ   = 1 << 2;
        const REMOTE_WRITE  = 1 << 3;
        const REMOTE_ATOMIC = 1 << 4;
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide unique, stable id correlating incoming transfers with
/// their destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    fn next() -> BufferId {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An application-registered memory region.
pub struct Buffer {
    id: BufferId,
    ptr: usize,
    len: usize,
    flags: BufferFlags,
    eq: Option<Arc<EventQueue>>,
    /// Provider-opaque local memory handle (lkey/rkey pair, or for MPI
    /// providers simply an echo of `ptr`/`len`).
    provider_handle: Vec<u8>,
    owned: bool,
}

impl Buffer {
    pub(crate) fn new(
        ptr: usize,
        len: usize,
        flags: BufferFlags,
        eq: Option<Arc<EventQueue>>,
        provider_handle: Vec<u8>,
        owned: bool,
    ) -> Buffer {
        Buffer {
            id: BufferId::next(),
            ptr,
            len,
            flags,
            eq,
            provider_handle,
            owned,
        }
    }

    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[must_use]
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    #[must_use]
    pub fn eq(&self) -> Option<&Arc<EventQueue>> {
        self.eq.as_ref()
    }

    #[must_use]
    pub fn provider_handle(&self) -> &[u8] {
        &self.provider_handle
    }

    /// `true` if the transport, not the application, owns the backing
    /// memory (i.e. this buffer came from `alloc` rather than `register_memory`).
    #[must_use]
    pub fn is_transport_owned(&self) -> bool {
        self.owned
    }

    /// Produces a self-contained remote buffer descriptor naming the
    /// window `[offset, offset+length)` of this buffer.
    pub fn make_remote_descriptor(&self, offset: u32, length: u32) -> Result<RemoteBufferDescriptor> {
        let end = u64::from(offset) + u64::from(length);
        if length == 0 || end > self.len as u64 {
            return Err(Error::InvalidArgument(format!(
                "window [{offset}, {offset}+{length}) exceeds buffer of length {}",
                self.len
            )));
        }
        RemoteBufferDescriptor::new(offset, length, &self.provider_handle)
    }
}

/// A fixed-size, opaque byte blob naming a memory window in another
/// process. Field order: `{offset: u32, length: u32, provider_blob: ..}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBufferDescriptor {
    bytes: [u8; MAX_NET_BUFFER_REMOTE_SIZE],
    blob_len: usize,
}

const RBD_HEADER_LEN: usize = 8;

impl RemoteBufferDescriptor {
    fn new(offset: u32, length: u32, provider_blob: &[u8]) -> Result<RemoteBufferDescriptor> {
        if provider_blob.len() + RBD_HEADER_LEN > MAX_NET_BUFFER_REMOTE_SIZE {
            return Err(Error::DescriptorTooLarge {
                size: provider_blob.len() + RBD_HEADER_LEN,
                max: MAX_NET_BUFFER_REMOTE_SIZE,
            });
        }
        let mut bytes = [0u8; MAX_NET_BUFFER_REMOTE_SIZE];
        bytes[0..4].copy_from_slice(&offset.to_le_bytes());
        bytes[4..8].copy_from_slice(&length.to_le_bytes());
        bytes[RBD_HEADER_LEN..RBD_HEADER_LEN + provider_blob.len()].copy_from_slice(provider_blob);
        Ok(RemoteBufferDescriptor {
            bytes,
            blob_len: provider_blob.len(),
        })
    }

    /// Decodes a descriptor received from the wire.
    pub fn unpack(raw: &[u8]) -> Result<RemoteBufferDescriptor> {
        if raw.len() < RBD_HEADER_LEN || raw.len() > MAX_NET_BUFFER_REMOTE_SIZE {
            return Err(Error::InvalidArgument("malformed remote descriptor".into()));
        }
        let mut bytes = [0u8; MAX_NET_BUFFER_REMOTE_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(RemoteBufferDescriptor {
            bytes,
            blob_len: raw.len() - RBD_HEADER_LEN,
        })
    }

    /// Encodes this descriptor for wire transmission.
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        self.bytes[..RBD_HEADER_LEN + self.blob_len].to_vec()
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        u32::from_le_bytes(self.bytes[0..4].try_into().unwrap())
    }

    #[must_use]
    pub fn length(&self) -> u32 {
        u32::from_le_bytes(self.bytes[4..8].try_into().unwrap())
    }

    #[must_use]
    pub fn provider_blob(&self) -> &[u8] {
        &self.bytes[RBD_HEADER_LEN..RBD_HEADER_LEN + self.blob_len]
    }

    fn set_offset(&mut self, offset: u32) {
        self.bytes[0..4].copy_from_slice(&offset.to_le_bytes());
    }

    fn set_length(&mut self, length: u32) {
        self.bytes[4..8].copy_from_slice(&length.to_le_bytes());
    }

    /// Slides the window's start forward by `n`, shrinking its length to
    /// match, without moving the window's end. Fails (without mutating)
    /// if it would slide past the original end.
    pub fn increase_offset(&mut self, n: u32) -> Result<()> {
        let end = self.offset() as u64 + self.length() as u64;
        let new_offset = self.offset() as u64 + n as u64;
        if new_offset > end {
            return Err(Error::InvalidArgument(
                "increase_offset would slide past window end".into(),
            ));
        }
        self.set_offset(new_offset as u32);
        self.set_length((end - new_offset) as u32);
        Ok(())
    }

    /// Shrinks the window's length by `n` from the end, keeping the
    /// start fixed. Fails (without mutating) on underflow.
    pub fn decrease_length(&mut self, n: u32) -> Result<()> {
        let length = self.length();
        if n > length {
            return Err(Error::InvalidArgument(
                "decrease_length exceeds current length".into(),
            ));
        }
        self.set_length(length - n);
        Ok(())
    }

    /// Shrinks the window so its length is exactly `n`, keeping the
    /// start fixed. Fails if `n` exceeds the current length.
    pub fn trim_to_length(&mut self, n: u32) -> Result<()> {
        if n > self.length() {
            return Err(Error::InvalidArgument(
                "trim_to_length exceeds current length".into(),
            ));
        }
        self.set_length(n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(offset: u32, length: u32) -> RemoteBufferDescriptor {
        RemoteBufferDescriptor::new(offset, length, &[0xAB; 8]).unwrap()
    }

    #[test]
    fn pack_unpack_round_trips() {
        let rbd = descriptor(16, 128);
        let packed = rbd.pack();
        let unpacked = RemoteBufferDescriptor::unpack(&packed).unwrap();
        assert_eq!(rbd, unpacked);
    }

    #[test]
    fn rejects_oversized_provider_blob() {
        let big = vec![0u8; MAX_NET_BUFFER_REMOTE_SIZE];
        assert!(RemoteBufferDescriptor::new(0, 8, &big).is_err());
    }

    #[test]
    fn increase_offset_preserves_window_end() {
        let mut rbd = descriptor(0, 100);
        rbd.increase_offset(20).unwrap();
        assert_eq!(rbd.offset(), 20);
        assert_eq!(rbd.length(), 80);
        assert_eq!(rbd.offset() + rbd.length(), 100);
    }

    #[test]
    fn increase_offset_past_end_fails_without_mutating() {
        let mut rbd = descriptor(0, 50);
        let before = rbd.clone();
        assert!(rbd.increase_offset(51).is_err());
        assert_eq!(rbd, before);
    }

    #[test]
    fn decrease_length_then_increase_offset_preserves_upper_bound() {
        let mut rbd = descriptor(10, 90);
        rbd.increase_offset(10).unwrap();
        rbd.decrease_length(0).unwrap();
        assert!(rbd.offset() + rbd.length() <= 100);
    }

    #[test]
    fn trim_to_length_rejects_growth() {
        let mut rbd = descriptor(0, 40);
        assert!(rbd.trim_to_length(41).is_err());
        rbd.trim_to_length(10).unwrap();
        assert_eq!(rbd.length(), 10);
    }

    #[test]
    fn buffer_make_remote_descriptor_enforces_window_invariant() {
        let buffer = Buffer::new(0x1000, 64, BufferFlags::REMOTE_READ, None, vec![1, 2, 3], false);
        assert!(buffer.make_remote_descriptor(0, 0).is_err());
        assert!(buffer.make_remote_descriptor(60, 8).is_err());
        let rbd = buffer.make_remote_descriptor(0, 64).unwrap();
        assert_eq!(rbd.length(), 64);
    }
}
