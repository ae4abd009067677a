use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::error::RegistryError;
use crate::registry::{EventKind, KeyValue, Lease, Precondition, Registry, WatchEvent};

const DEFAULT_HISTORY: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Store {
    index: u64,
    entries: BTreeMap<String, Entry>,
    history: VecDeque<WatchEvent>,
}

impl Store {
    fn record(&mut self, key: &str, kind: EventKind, value: Option<String>, limit: usize) -> u64 {
        self.index += 1;
        self.history.push_back(WatchEvent {
            index: self.index,
            key: key.to_string(),
            kind,
            value,
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
        self.index
    }

    /// Drop leased keys whose TTL ran out. Returns true if anything expired.
    fn expire(&mut self, now: Instant, limit: usize) -> bool {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|t| t <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.record(key, EventKind::Expire, None, limit);
            tracing::debug!(key = %key, "Lease expired");
        }
        !expired.is_empty()
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.expires_at).min()
    }

    fn check(&self, key: &str, precondition: Precondition) -> Result<(), RegistryError> {
        let current = self.entries.get(key).map(|e| e.version);
        let ok = match precondition {
            Precondition::Any => true,
            Precondition::Absent => current.is_none(),
            Precondition::Version(v) => current == Some(v),
        };
        if ok {
            Ok(())
        } else {
            Err(RegistryError::Conflict {
                key: key.to_string(),
            })
        }
    }
}

/// In-process registry.
///
/// Versions are the global modification index, as in etcd: every write,
/// delete and lease expiry bumps it, and a key's version is the index of its
/// last change. Lease renewals extend the TTL without changing the version so
/// heartbeats do not wake watchers. Expiry is evaluated lazily on each
/// operation and by waiting watchers.
pub struct MemoryRegistry {
    store: Mutex<Store>,
    index_tx: watch::Sender<u64>,
    history_limit: usize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Retain only the last `limit` events for watchers.
    pub fn with_history(limit: usize) -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            store: Mutex::new(Store::default()),
            index_tx,
            history_limit: limit.max(1),
        }
    }

    fn publish(&self, index: u64) {
        self.index_tx.send_replace(index);
    }

    async fn locked(&self) -> tokio::sync::MutexGuard<'_, Store> {
        let mut store = self.store.lock().await;
        if store.expire(Instant::now(), self.history_limit) {
            self.publish(store.index);
        }
        store
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError> {
        let store = self.locked().await;
        Ok(store.entries.get(key).map(|e| KeyValue {
            key: key.to_string(),
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let store = self.locked().await;
        Ok(store
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                version: e.version,
            })
            .collect())
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
    ) -> Result<u64, RegistryError> {
        let mut store = self.locked().await;
        store.check(key, precondition)?;
        let version = store.record(key, EventKind::Set, Some(value.to_string()), self.history_limit);
        store.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
                expires_at: None,
            },
        );
        self.publish(version);
        Ok(version)
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), RegistryError> {
        let mut store = self.locked().await;
        store.check(key, precondition)?;
        if store.entries.remove(key).is_some() {
            let index = store.record(key, EventKind::Delete, None, self.history_limit);
            self.publish(index);
        }
        Ok(())
    }

    async fn wait(
        &self,
        prefix: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<WatchEvent>, RegistryError> {
        let deadline = Instant::now() + timeout;
        let mut index_rx = self.index_tx.subscribe();

        loop {
            // Mark the current index seen before inspecting the store so a
            // write landing after the check still wakes us.
            index_rx.borrow_and_update();
            let next_expiry = {
                let store = self.locked().await;

                if after > store.index {
                    return Err(RegistryError::CursorCompacted {
                        requested: after,
                        oldest: store.index,
                    });
                }
                if let Some(oldest) = store.history.front() {
                    if after + 1 < oldest.index {
                        return Err(RegistryError::CursorCompacted {
                            requested: after,
                            oldest: oldest.index,
                        });
                    }
                }

                if let Some(event) = store
                    .history
                    .iter()
                    .find(|e| e.index > after && e.key.starts_with(prefix))
                {
                    return Ok(Some(event.clone()));
                }

                store.next_expiry()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                changed = index_rx.changed() => {
                    if changed.is_err() {
                        return Err(RegistryError::Unavailable("registry dropped".to_string()));
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn current_index(&self) -> Result<u64, RegistryError> {
        Ok(self.locked().await.index)
    }

    async fn acquire_lease(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, RegistryError> {
        let mut store = self.locked().await;
        if store.entries.contains_key(key) {
            return Ok(None);
        }
        let version = store.record(key, EventKind::Set, Some(value.to_string()), self.history_limit);
        store.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        self.publish(version);
        Ok(Some(Lease {
            key: key.to_string(),
            value: value.to_string(),
            version,
            ttl,
        }))
    }

    async fn renew_lease(
        &self,
        lease: &Lease,
        ttl: Duration,
    ) -> Result<Option<Lease>, RegistryError> {
        let mut store = self.locked().await;
        match store.entries.get_mut(&lease.key) {
            Some(entry) if entry.version == lease.version => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(Some(Lease {
                    ttl,
                    ..lease.clone()
                }))
            }
            _ => Ok(None),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), RegistryError> {
        match self
            .delete(&lease.key, Precondition::Version(lease.version))
            .await
        {
            Err(RegistryError::Conflict { .. }) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_versions() {
        let reg = MemoryRegistry::new();
        let v1 = reg.set("/a", "1", Precondition::Any).await.unwrap();
        let v2 = reg.set("/b", "2", Precondition::Any).await.unwrap();
        assert!(v2 > v1);

        let kv = reg.get("/a").await.unwrap().unwrap();
        assert_eq!(kv.value, "1");
        assert_eq!(kv.version, v1);
        assert!(reg.get("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compare_and_swap() {
        let reg = MemoryRegistry::new();
        let v1 = reg.set("/k", "a", Precondition::Absent).await.unwrap();
        assert!(reg.set("/k", "b", Precondition::Absent).await.unwrap_err().is_conflict());

        let v2 = reg.set("/k", "b", Precondition::Version(v1)).await.unwrap();
        assert!(reg
            .set("/k", "c", Precondition::Version(v1))
            .await
            .unwrap_err()
            .is_conflict());

        assert!(reg.delete("/k", Precondition::Version(v1)).await.is_err());
        reg.delete("/k", Precondition::Version(v2)).await.unwrap();
        assert!(reg.get("/k").await.unwrap().is_none());
        reg.delete("/k", Precondition::Any).await.unwrap();
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let reg = MemoryRegistry::new();
        reg.set("/job/b", "", Precondition::Any).await.unwrap();
        reg.set("/job/a", "", Precondition::Any).await.unwrap();
        reg.set("/jobs", "", Precondition::Any).await.unwrap();
        reg.set("/machines/x", "", Precondition::Any).await.unwrap();

        let keys: Vec<String> = reg
            .list("/job/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/job/a", "/job/b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_renewal() {
        let reg = MemoryRegistry::new();
        let ttl = Duration::from_secs(10);
        let lease = reg.acquire_lease("/leader", "m1", ttl).await.unwrap().unwrap();
        assert!(reg.acquire_lease("/leader", "m2", ttl).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let lease = reg.renew_lease(&lease, ttl).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(reg.get("/leader").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(reg.get("/leader").await.unwrap().is_none());
        assert!(reg.renew_lease(&lease, ttl).await.unwrap().is_none());
        assert!(reg.acquire_lease("/leader", "m2", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_of_lost_lease_is_harmless() {
        let reg = MemoryRegistry::new();
        let ttl = Duration::from_secs(10);
        let lease = reg.acquire_lease("/leader", "m1", ttl).await.unwrap().unwrap();
        reg.delete("/leader", Precondition::Any).await.unwrap();
        let other = reg.acquire_lease("/leader", "m2", ttl).await.unwrap().unwrap();

        reg.release_lease(&lease).await.unwrap();
        assert_eq!(reg.get("/leader").await.unwrap().unwrap().value, "m2");
        reg.release_lease(&other).await.unwrap();
        assert!(reg.get("/leader").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wait_returns_next_matching_event() {
        let reg = MemoryRegistry::new();
        let start = reg.current_index().await.unwrap();
        reg.set("/other/x", "1", Precondition::Any).await.unwrap();
        reg.set("/job/x", "2", Precondition::Any).await.unwrap();

        let event = reg
            .wait("/job/", start, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "/job/x");
        assert_eq!(event.kind, EventKind::Set);

        let none = reg
            .wait("/job/", event.index, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_lease_expiry() {
        let reg = MemoryRegistry::new();
        reg.acquire_lease("/machines/m1", "{}", Duration::from_secs(5))
            .await
            .unwrap();
        let after = reg.current_index().await.unwrap();

        let event = reg
            .wait("/machines/", after, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Expire);
        assert_eq!(event.key, "/machines/m1");
    }

    #[tokio::test]
    async fn stale_cursor_is_compacted() {
        let reg = MemoryRegistry::with_history(2);
        for i in 0..5 {
            reg.set("/k", &i.to_string(), Precondition::Any).await.unwrap();
        }
        let err = reg.wait("/", 0, Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, RegistryError::CursorCompacted { requested: 0, .. }));

        let err = reg.wait("/", 99, Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, RegistryError::CursorCompacted { .. }));
    }
}
