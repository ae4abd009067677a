//! The shared registry: a versioned key-value store with compare-and-swap,
//! TTL leases and prefix watches. All cross-machine coordination goes through
//! it.
//!
//! # Components
//!
//! - [`Registry`]: the storage capability consumed by every other component
//! - [`MemoryRegistry`]: in-process implementation, also served over HTTP
//! - [`RemoteRegistry`](remote::RemoteRegistry): HTTP client for a served registry
//! - [`RegistryClient`]: typed access to jobs, assignments, machines, unit
//!   states and the leader lease, with a deadline on every operation
//! - [`Watcher`]: lazy, restartable stream of changes under a prefix

pub mod client;
pub mod keys;
pub mod memory;
pub mod remote;
pub mod server;
pub mod watch;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub use client::{Assignment, RegistryClient};
pub use keys::KeyLayout;
pub use memory::MemoryRegistry;
pub use watch::{spawn_trigger, Watcher};

/// A stored value and the registry index at which it was last modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub version: u64,
}

/// Condition a write must satisfy to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "lowercase")]
pub enum Precondition {
    /// Unconditional.
    Any,
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Version(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Set,
    Delete,
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub index: u64,
    pub key: String,
    pub kind: EventKind,
    pub value: Option<String>,
}

/// A key held with a time-to-live. The holder must renew before the TTL runs
/// out; once it expires the key disappears and watchers see an `Expire` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub value: String,
    pub version: u64,
    pub ttl: Duration,
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError>;

    /// Every key under `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError>;

    /// Write `value`, returning the new version. Fails with
    /// [`RegistryError::Conflict`] when the precondition does not hold.
    async fn set(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
    ) -> Result<u64, RegistryError>;

    /// Delete `key`. Deleting a missing key with [`Precondition::Any`] is a
    /// no-op; with a version precondition it is a conflict.
    async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), RegistryError>;

    /// Wait for the first event under `prefix` with an index greater than
    /// `after`. Returns `None` if nothing happened within `timeout`.
    async fn wait(
        &self,
        prefix: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, RegistryError>;

    /// Index of the most recent modification.
    async fn current_index(&self) -> Result<u64, RegistryError>;

    /// Create `key` with a TTL. `None` if the key is already held.
    async fn acquire_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, RegistryError>;

    /// Extend a held lease. `None` if it expired or was taken over.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration)
        -> Result<Option<Lease>, RegistryError>;

    /// Give up a lease. A lease that is no longer held is left alone.
    async fn release_lease(&self, lease: &Lease) -> Result<(), RegistryError>;
}
