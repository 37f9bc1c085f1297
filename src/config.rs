// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NNTI global configuration - single source of truth for protocol
//! constants and runtime-tunable keys.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time protocol constants (wire sizes,
//!   the ACK sentinel, default MTU).
//! - **Level 2 (Dynamic)**: [`RuntimeConfig`] for keys set at start-up
//!   from environment, file, or explicit map (§6 of the transport spec).
//!
//! # Performance
//!
//! - Lock-free: `DashMap` for the key/value store (no `RwLock` contention).
//! - Atomic swap: `ArcSwap` for the active provider name.
//! - Zero-copy: `Arc<str>` for keys/values.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

// =======================================================================
// Wire-format constants (§3, §6)
// =======================================================================

/// ACK sentinel value for `target_base_addr`. Never a real virtual address.
pub const ACK_SENTINEL: u64 = 0x0ACC;

/// Upper bound on the packed provider-specific initiator handle, in bytes.
pub const MAX_PACKED_INITIATOR_HDL: usize = 180;

/// Compile-time upper bound on a packed remote buffer descriptor, in bytes.
/// Provider adapters must fail registration if their descriptor needs more.
pub const MAX_NET_BUFFER_REMOTE_SIZE: usize = 68;

/// Fixed portion of the command-message wire header, in bytes (§3).
pub const COMMAND_HEADER_SIZE: usize = 8 + 8 + 8 + 8 + 8 + 4 + 1;

/// Default provider MTU in bytes (`mtu` config key).
pub const DEFAULT_MTU: usize = 2048;

/// Default command-buffer slot count (`command_buffer.depth` config key).
pub const DEFAULT_COMMAND_BUFFER_DEPTH: usize = 64;

/// Default freelist size (`freelist.size` config key).
pub const DEFAULT_FREELIST_SIZE: usize = 128;

/// Default rendezvous retry budget (`rendezvous.retry_budget` config key).
pub const DEFAULT_RENDEZVOUS_RETRY_BUDGET: u32 = 5;

/// Default rendezvous retry back-off, in milliseconds (`rendezvous.backoff_ms`).
pub const DEFAULT_RENDEZVOUS_BACKOFF_MS: u64 = 1000;

/// Process-identifier sentinel meaning "unspecified".
pub const PID_UNSPECIFIED: u64 = 0;

/// Process-identifier sentinel meaning "localhost, port deferred".
pub const PID_LOCALHOST_DEFERRED: u64 = 1;

// =======================================================================
// Recognized configuration keys (§6)
// =======================================================================

/// String constants for recognized configuration keys.
pub mod keys {
    pub const TRANSPORT_NAME: &str = "transport.name";
    pub const FREELIST_SIZE: &str = "freelist.size";
    pub const LOG_FILENAME: &str = "log.filename";
    pub const LOG_SEVERITY: &str = "log.severity";
    pub const COMMAND_BUFFER_DEPTH: &str = "command_buffer.depth";
    pub const MTU: &str = "mtu";
    pub const RENDEZVOUS_RETRY_BUDGET: &str = "rendezvous.retry_budget";
    pub const RENDEZVOUS_BACKOFF_MS: &str = "rendezvous.backoff_ms";
    /// Local address the rendezvous listener binds (not in the original
    /// key set; this implementation needs a concrete bind address since
    /// the listener is also how a process learns its own advertised PID).
    pub const BIND_HOST: &str = "bind.host";
    /// Local port the rendezvous listener binds; 0 picks an ephemeral port.
    pub const BIND_PORT: &str = "bind.port";
}

/// Recognized `transport.name` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Verbs,
    Mpi,
    Libfabric,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "verbs" => Some(Self::Verbs),
            "mpi" => Some(Self::Mpi),
            "libfabric" | "libfabric-style" => Some(Self::Libfabric),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verbs => "verbs",
            Self::Mpi => "mpi",
            Self::Libfabric => "libfabric",
        }
    }
}

// =======================================================================
// Runtime configuration (dynamic, lock-free)
// =======================================================================

/// Shared runtime configuration (thread-safe, lock-free).
///
/// - `DashMap`: concurrent key/value store without a global lock.
/// - `ArcSwap`: atomic swap of the active provider selection.
/// - `Arc<str>`: zero-copy keys/values.
///
/// # Usage
///
/// ```ignore
/// let config = RuntimeConfig::new();
/// config.set(keys::FREELIST_SIZE, "256");
/// let size = config.get_usize(keys::FREELIST_SIZE, DEFAULT_FREELIST_SIZE);
/// ```
#[derive(Clone)]
pub struct RuntimeConfig {
    provider: Arc<ArcSwap<Option<ProviderKind>>>,
    store: Arc<DashMap<Arc<str>, Arc<str>>>,
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            provider: Arc::new(ArcSwap::new(Arc::new(None))),
            store: Arc::new(DashMap::new()),
        }
    }

    /// Build a config from an iterator of key/value pairs (e.g. parsed
    /// from a file or collected from the process environment).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Arc<str>>,
        V: Into<Arc<str>>,
    {
        let config = Self::new();
        for (k, v) in pairs {
            config.set(k.into(), v.into());
        }
        config
    }

    /// Set a raw key/value pair. Recognizes `transport.name` specially
    /// and keeps the atomic provider selection in sync.
    pub fn set(&self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) {
        let key = key.into();
        let value = value.into();
        if key.as_ref() == keys::TRANSPORT_NAME {
            let parsed = ProviderKind::parse(&value);
            self.provider.store(Arc::new(parsed));
        }
        self.store.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.store.get(key).map(|v| v.value().clone())
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// The currently selected provider, if `transport.name` was recognized.
    pub fn provider(&self) -> Option<ProviderKind> {
        *self.provider.load_full()
    }

    pub fn freelist_size(&self) -> usize {
        self.get_usize(keys::FREELIST_SIZE, DEFAULT_FREELIST_SIZE)
    }

    pub fn mtu(&self) -> usize {
        self.get_usize(keys::MTU, DEFAULT_MTU)
    }

    pub fn command_buffer_depth(&self) -> usize {
        self.get_usize(keys::COMMAND_BUFFER_DEPTH, DEFAULT_COMMAND_BUFFER_DEPTH)
    }

    pub fn rendezvous_retry_budget(&self) -> u32 {
        self.get_u32(
            keys::RENDEZVOUS_RETRY_BUDGET,
            DEFAULT_RENDEZVOUS_RETRY_BUDGET,
        )
    }

    pub fn rendezvous_backoff_ms(&self) -> u64 {
        self.get_u64(keys::RENDEZVOUS_BACKOFF_MS, DEFAULT_RENDEZVOUS_BACKOFF_MS)
    }

    pub fn bind_host(&self) -> String {
        self.get(keys::BIND_HOST)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn bind_port(&self) -> u16 {
        self.get_u32(keys::BIND_PORT, 0) as u16
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let config = RuntimeConfig::new();
        assert_eq!(config.freelist_size(), DEFAULT_FREELIST_SIZE);
        assert_eq!(config.mtu(), DEFAULT_MTU);
        assert_eq!(config.provider(), None);
    }

    #[test]
    fn recognizes_transport_name() {
        let config = RuntimeConfig::new();
        config.set(keys::TRANSPORT_NAME, "mpi");
        assert_eq!(config.provider(), Some(ProviderKind::Mpi));
    }

    #[test]
    fn unknown_transport_name_leaves_provider_none() {
        let config = RuntimeConfig::new();
        config.set(keys::TRANSPORT_NAME, "not-a-real-provider");
        assert_eq!(config.provider(), None);
    }

    #[test]
    fn overrides_defaults() {
        let config = RuntimeConfig::new();
        config.set(keys::FREELIST_SIZE, "256");
        config.set(keys::MTU, "4096");
        assert_eq!(config.freelist_size(), 256);
        assert_eq!(config.mtu(), 4096);
    }

    #[test]
    fn from_pairs_builds_config() {
        let config = RuntimeConfig::from_pairs([
            (keys::TRANSPORT_NAME, "verbs"),
            (keys::FREELIST_SIZE, "64"),
        ]);
        assert_eq!(config.provider(), Some(ProviderKind::Verbs));
        assert_eq!(config.freelist_size(), 64);
    }
}
