use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, UnitError};
use crate::registry::RegistryClient;
use crate::timer::{sleep_until, Backoff};
use crate::unit::{UnitManager, UnitState, UnitStatus};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct Tracked {
    subscribed: BTreeSet<String>,
    /// Last state successfully written to the registry, per unit.
    published: BTreeMap<String, UnitState>,
    /// Unsubscribed units whose record still has to be deleted.
    removals: BTreeSet<String>,
}

/// Publishes the observed state of this machine's units to the registry.
///
/// Notifications from the unit manager are debounced and only changed states
/// are written. A periodic resync republishes everything, which also covers
/// notifications lost to a lagging feed. Records are deleted when a unit is
/// unsubscribed and when the generator shuts down.
pub struct UnitStateGenerator {
    machine_id: String,
    manager: Arc<dyn UnitManager>,
    client: RegistryClient,
    tracked: Mutex<Tracked>,
    /// Serializes flushes so removals and publications never interleave.
    flush_lock: Mutex<()>,
    wake: Notify,
    debounce: Duration,
    resync: Duration,
}

impl UnitStateGenerator {
    pub fn new(machine_id: &str, manager: Arc<dyn UnitManager>, client: RegistryClient) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            manager,
            client,
            tracked: Mutex::new(Tracked::default()),
            flush_lock: Mutex::new(()),
            wake: Notify::new(),
            debounce: DEFAULT_DEBOUNCE,
            resync: DEFAULT_RESYNC,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub async fn subscribe(&self, name: &str) {
        let mut tracked = self.tracked.lock().await;
        tracked.removals.remove(name);
        if tracked.subscribed.insert(name.to_string()) {
            tracing::debug!(unit = %name, "Unit state subscribed");
        }
        drop(tracked);
        self.wake.notify_one();
    }

    pub async fn unsubscribe(&self, name: &str) {
        let mut tracked = self.tracked.lock().await;
        if tracked.subscribed.remove(name) {
            tracing::debug!(unit = %name, "Unit state unsubscribed");
        }
        if tracked.published.contains_key(name) {
            tracked.removals.insert(name.to_string());
        }
        drop(tracked);
        self.wake.notify_one();
    }

    pub async fn is_subscribed(&self, name: &str) -> bool {
        self.tracked.lock().await.subscribed.contains(name)
    }

    /// States as last written to the registry.
    pub async fn published(&self) -> BTreeMap<String, UnitState> {
        self.tracked.lock().await.published.clone()
    }

    /// Current state of every subscribed unit, read from the unit manager.
    pub async fn generate(&self) -> Result<Vec<UnitState>, UnitError> {
        let names: Vec<String> = self
            .tracked
            .lock()
            .await
            .subscribed
            .iter()
            .cloned()
            .collect();

        let mut states = Vec::with_capacity(names.len());
        for name in names {
            let state = match self.manager.state(&name).await? {
                Some(unit) => UnitState {
                    name,
                    machine_id: self.machine_id.clone(),
                    status: unit.status,
                    hash: Some(unit.hash),
                },
                None => UnitState {
                    name,
                    machine_id: self.machine_id.clone(),
                    status: UnitStatus::Inactive,
                    hash: None,
                },
            };
            states.push(state);
        }
        Ok(states)
    }

    /// Delete records of unsubscribed units, then publish every state that
    /// differs from what was last written (all of them when `force`).
    /// Returns the number of registry writes.
    pub async fn flush(&self, force: bool) -> Result<usize, RegistryError> {
        let _guard = self.flush_lock.lock().await;
        let mut writes = 0;

        let removals: Vec<String> = self.tracked.lock().await.removals.iter().cloned().collect();
        for name in removals {
            self.client.remove_unit_state(&name, &self.machine_id).await?;
            let mut tracked = self.tracked.lock().await;
            tracked.removals.remove(&name);
            tracked.published.remove(&name);
            writes += 1;
        }

        let states = match self.generate().await {
            Ok(states) => states,
            Err(e) => {
                tracing::warn!(machine_id = %self.machine_id, error = %e, "Failed to read unit states");
                return Ok(writes);
            }
        };

        for state in states {
            let changed = {
                let tracked = self.tracked.lock().await;
                if !tracked.subscribed.contains(&state.name) {
                    continue;
                }
                tracked.published.get(&state.name) != Some(&state)
            };
            if !changed && !force {
                continue;
            }

            self.client.publish_unit_state(&state).await?;
            tracing::debug!(unit = %state.name, status = %state.status, "Published unit state");
            writes += 1;

            // Unsubscribed while the write was in flight: the record just
            // written is stale and must go on the next flush.
            let mut tracked = self.tracked.lock().await;
            if !tracked.subscribed.contains(&state.name) {
                tracked.removals.insert(state.name.clone());
                self.wake.notify_one();
            }
            tracked.published.insert(state.name.clone(), state);
        }

        Ok(writes)
    }

    /// Delete every record this generator wrote.
    pub async fn remove_all(&self) -> Result<(), RegistryError> {
        let _guard = self.flush_lock.lock().await;
        let names: Vec<String> = {
            let tracked = self.tracked.lock().await;
            tracked
                .published
                .keys()
                .chain(tracked.removals.iter())
                .cloned()
                .collect()
        };
        for name in names {
            self.client.remove_unit_state(&name, &self.machine_id).await?;
            let mut tracked = self.tracked.lock().await;
            tracked.published.remove(&name);
            tracked.removals.remove(&name);
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.manager.subscribe();
        let mut events_open = true;
        let mut resync = tokio::time::interval(self.resync);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = Backoff::default();
        let mut flush_at: Option<Instant> = None;
        let mut force = false;

        tracing::info!(machine_id = %self.machine_id, "Unit state generator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv(), if events_open => match event {
                    Ok(event) => {
                        if self.is_subscribed(&event.name).await {
                            flush_at.get_or_insert(Instant::now() + self.debounce);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Unit event feed lagged, scheduling resync");
                        force = true;
                        flush_at.get_or_insert(Instant::now() + self.debounce);
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Unit event feed closed, relying on periodic resync");
                        events_open = false;
                    }
                },
                _ = self.wake.notified() => {
                    flush_at.get_or_insert(Instant::now() + self.debounce);
                }
                _ = resync.tick() => {
                    force = true;
                    flush_at = Some(Instant::now());
                }
                _ = sleep_until(flush_at) => {
                    flush_at = None;
                    match self.flush(force).await {
                        Ok(_) => {
                            force = false;
                            backoff.reset();
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Failed to publish unit states");
                            flush_at = Some(Instant::now() + delay);
                        }
                    }
                }
            }
        }

        if let Err(e) = self.remove_all().await {
            tracing::warn!(error = %e, "Failed to remove unit states on shutdown");
        }
        tracing::info!(machine_id = %self.machine_id, "Unit state generator stopped");
    }
}
