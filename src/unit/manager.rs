use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::error::UnitError;
use crate::unit::{UnitFile, UnitHash, UnitStatus};

/// Capacity of the state-change feed. Slow subscribers that fall further
/// behind see `Lagged` and must resync from `units()`.
pub const EVENT_CAPACITY: usize = 256;

/// Asynchronous notification that a unit changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEvent {
    pub name: String,
    pub status: UnitStatus,
}

/// What a unit manager knows about one of its units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedUnit {
    pub status: UnitStatus,
    pub hash: UnitHash,
}

/// Local capability to run units on this machine.
#[async_trait]
pub trait UnitManager: Send + Sync {
    async fn load(&self, name: &str, unit: &UnitFile) -> Result<(), UnitError>;
    async fn unload(&self, name: &str) -> Result<(), UnitError>;
    async fn start(&self, name: &str) -> Result<(), UnitError>;
    async fn stop(&self, name: &str) -> Result<(), UnitError>;

    /// `None` when the unit is not loaded.
    async fn state(&self, name: &str) -> Result<Option<ManagedUnit>, UnitError>;

    /// Names of every loaded unit.
    async fn units(&self) -> Result<Vec<String>, UnitError>;

    fn subscribe(&self) -> broadcast::Receiver<UnitEvent>;
}

/// In-memory unit manager. Transitions complete synchronously, and single
/// operations can be made to fail to exercise retry paths.
pub struct FakeUnitManager {
    units: Mutex<BTreeMap<String, ManagedUnit>>,
    failing: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<UnitEvent>,
}

impl Default for FakeUnitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUnitManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            units: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Make every operation on `name` fail with `reason` until cleared.
    pub async fn fail_unit(&self, name: &str, reason: &str) {
        self.failing
            .lock()
            .await
            .insert(name.to_string(), reason.to_string());
    }

    pub async fn clear_failure(&self, name: &str) {
        self.failing.lock().await.remove(name);
    }

    async fn check(&self, name: &str) -> Result<(), UnitError> {
        match self.failing.lock().await.get(name) {
            Some(reason) => Err(UnitError::Manager {
                name: name.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn notify(&self, name: &str, status: UnitStatus) {
        // No subscribers is fine.
        let _ = self.events.send(UnitEvent {
            name: name.to_string(),
            status,
        });
    }

    async fn transition(&self, name: &str, status: UnitStatus) -> Result<(), UnitError> {
        self.check(name).await?;
        let mut units = self.units.lock().await;
        let unit = units
            .get_mut(name)
            .ok_or_else(|| UnitError::NotLoaded(name.to_string()))?;
        if unit.status != status {
            unit.status = status;
            drop(units);
            self.notify(name, status);
        }
        Ok(())
    }
}

#[async_trait]
impl UnitManager for FakeUnitManager {
    async fn load(&self, name: &str, unit: &UnitFile) -> Result<(), UnitError> {
        self.check(name).await?;
        let hash = unit.hash();
        let mut units = self.units.lock().await;
        match units.get_mut(name) {
            Some(existing) if existing.hash == hash => return Ok(()),
            Some(existing) => existing.hash = hash,
            None => {
                units.insert(
                    name.to_string(),
                    ManagedUnit {
                        status: UnitStatus::Loaded,
                        hash,
                    },
                );
            }
        }
        drop(units);
        self.notify(name, UnitStatus::Loaded);
        Ok(())
    }

    async fn unload(&self, name: &str) -> Result<(), UnitError> {
        self.check(name).await?;
        if self.units.lock().await.remove(name).is_some() {
            self.notify(name, UnitStatus::Inactive);
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), UnitError> {
        self.transition(name, UnitStatus::Launched).await
    }

    async fn stop(&self, name: &str) -> Result<(), UnitError> {
        self.transition(name, UnitStatus::Loaded).await
    }

    async fn state(&self, name: &str) -> Result<Option<ManagedUnit>, UnitError> {
        Ok(self.units.lock().await.get(name).cloned())
    }

    async fn units(&self) -> Result<Vec<String>, UnitError> {
        Ok(self.units.lock().await.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(exec: &str) -> UnitFile {
        UnitFile::parse(&format!("[Service]\nExecStart={}\n", exec)).unwrap()
    }

    #[tokio::test]
    async fn load_start_stop_unload() {
        let um = FakeUnitManager::new();
        let mut rx = um.subscribe();

        um.load("foo.service", &unit("/bin/true")).await.unwrap();
        um.start("foo.service").await.unwrap();
        assert_eq!(
            um.state("foo.service").await.unwrap().unwrap().status,
            UnitStatus::Launched
        );
        um.stop("foo.service").await.unwrap();
        um.unload("foo.service").await.unwrap();
        assert!(um.state("foo.service").await.unwrap().is_none());

        let statuses: Vec<UnitStatus> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                UnitStatus::Loaded,
                UnitStatus::Launched,
                UnitStatus::Loaded,
                UnitStatus::Inactive
            ]
        );
    }

    #[tokio::test]
    async fn start_requires_load() {
        let um = FakeUnitManager::new();
        assert_eq!(
            um.start("foo.service").await,
            Err(UnitError::NotLoaded("foo.service".into()))
        );
    }

    #[tokio::test]
    async fn injected_failure_is_reported_until_cleared() {
        let um = FakeUnitManager::new();
        um.fail_unit("foo.service", "boom").await;
        assert!(um.load("foo.service", &unit("/bin/true")).await.is_err());
        um.clear_failure("foo.service").await;
        assert!(um.load("foo.service", &unit("/bin/true")).await.is_ok());
    }
}
