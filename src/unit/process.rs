use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::error::UnitError;
use crate::unit::manager::{ManagedUnit, UnitEvent, UnitManager, EVENT_CAPACITY};
use crate::unit::{UnitFile, UnitHash, UnitStatus};

struct ProcessUnit {
    unit: UnitFile,
    hash: UnitHash,
    status: UnitStatus,
    /// Bumped on every start/stop so a monitor for an old child cannot
    /// overwrite the state of a newer one.
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    units: Mutex<BTreeMap<String, ProcessUnit>>,
    events: broadcast::Sender<UnitEvent>,
}

impl Inner {
    fn notify(&self, name: &str, status: UnitStatus) {
        let _ = self.events.send(UnitEvent {
            name: name.to_string(),
            status,
        });
    }
}

/// Runs each unit's `[Service] ExecStart=` command as a child of this process
/// via `sh -c`.
///
/// There is no restart policy and no log capture: a unit whose process exits
/// drops back to `loaded` and the agent's next reconciliation pass starts it
/// again if its target is still `launched`.
#[derive(Clone)]
pub struct ProcessUnitManager {
    inner: Arc<Inner>,
}

impl Default for ProcessUnitManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessUnitManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                units: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    async fn kill(&self, name: &str) -> Result<bool, UnitError> {
        let mut units = self.inner.units.lock().await;
        let unit = units
            .get_mut(name)
            .ok_or_else(|| UnitError::NotLoaded(name.to_string()))?;
        let was_running = unit.kill_tx.is_some();
        if let Some(kill_tx) = unit.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        unit.generation += 1;
        unit.status = UnitStatus::Loaded;
        Ok(was_running)
    }

    fn monitor(
        inner: Arc<Inner>,
        name: String,
        generation: u64,
        mut child: tokio::process::Child,
        kill_rx: oneshot::Receiver<()>,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => tracing::info!(unit = %name, exit_code = ?status.code(), "Unit process exited"),
                        Err(e) => tracing::warn!(unit = %name, error = %e, "Failed waiting on unit process"),
                    }
                    let mut units = inner.units.lock().await;
                    if let Some(unit) = units.get_mut(&name) {
                        if unit.generation == generation {
                            unit.status = UnitStatus::Loaded;
                            unit.kill_tx = None;
                            drop(units);
                            inner.notify(&name, UnitStatus::Loaded);
                        }
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(unit = %name, error = %e, "Failed to kill unit process");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl UnitManager for ProcessUnitManager {
    async fn load(&self, name: &str, unit: &UnitFile) -> Result<(), UnitError> {
        let hash = unit.hash();
        let mut units = self.inner.units.lock().await;
        match units.get_mut(name) {
            Some(existing) if existing.hash == hash => return Ok(()),
            Some(existing) => {
                existing.unit = unit.clone();
                existing.hash = hash;
            }
            None => {
                units.insert(
                    name.to_string(),
                    ProcessUnit {
                        unit: unit.clone(),
                        hash,
                        status: UnitStatus::Loaded,
                        generation: 0,
                        kill_tx: None,
                    },
                );
            }
        }
        drop(units);
        self.inner.notify(name, UnitStatus::Loaded);
        Ok(())
    }

    async fn unload(&self, name: &str) -> Result<(), UnitError> {
        match self.kill(name).await {
            Ok(_) => {}
            Err(UnitError::NotLoaded(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.inner.units.lock().await.remove(name);
        self.inner.notify(name, UnitStatus::Inactive);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), UnitError> {
        let mut units = self.inner.units.lock().await;
        let unit = units
            .get_mut(name)
            .ok_or_else(|| UnitError::NotLoaded(name.to_string()))?;
        if unit.kill_tx.is_some() {
            return Ok(());
        }

        let command = unit
            .unit
            .value("Service", "ExecStart")
            .ok_or_else(|| UnitError::Manager {
                name: name.to_string(),
                reason: "no ExecStart= in [Service]".to_string(),
            })?
            .to_string();

        tracing::info!(unit = %name, command = %command, "Starting unit process");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| UnitError::Manager {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        unit.generation += 1;
        unit.status = UnitStatus::Launched;
        unit.kill_tx = Some(kill_tx);
        let generation = unit.generation;
        drop(units);

        Self::monitor(self.inner.clone(), name.to_string(), generation, child, kill_rx);
        self.inner.notify(name, UnitStatus::Launched);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), UnitError> {
        if self.kill(name).await? {
            tracing::info!(unit = %name, "Stopped unit process");
            self.inner.notify(name, UnitStatus::Loaded);
        }
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<Option<ManagedUnit>, UnitError> {
        Ok(self
            .inner
            .units
            .lock()
            .await
            .get(name)
            .map(|u| ManagedUnit {
                status: u.status,
                hash: u.hash.clone(),
            }))
    }

    async fn units(&self) -> Result<Vec<String>, UnitError> {
        Ok(self.inner.units.lock().await.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unit(exec: &str) -> UnitFile {
        UnitFile::parse(&format!("[Service]\nExecStart={}\n", exec)).unwrap()
    }

    async fn status(um: &ProcessUnitManager, name: &str) -> Option<UnitStatus> {
        um.state(name).await.unwrap().map(|u| u.status)
    }

    #[tokio::test]
    async fn runs_and_stops_long_lived_process() {
        let um = ProcessUnitManager::new();
        um.load("sleep.service", &unit("sleep 30")).await.unwrap();
        um.start("sleep.service").await.unwrap();
        assert_eq!(status(&um, "sleep.service").await, Some(UnitStatus::Launched));

        um.stop("sleep.service").await.unwrap();
        assert_eq!(status(&um, "sleep.service").await, Some(UnitStatus::Loaded));

        um.unload("sleep.service").await.unwrap();
        assert_eq!(status(&um, "sleep.service").await, None);
    }

    #[tokio::test]
    async fn exited_process_drops_back_to_loaded() {
        let um = ProcessUnitManager::new();
        um.load("true.service", &unit("true")).await.unwrap();
        um.start("true.service").await.unwrap();

        let mut settled = false;
        for _ in 0..50 {
            if status(&um, "true.service").await == Some(UnitStatus::Loaded) {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(settled, "exited unit should return to loaded");
    }

    #[tokio::test]
    async fn start_without_exec_start_fails() {
        let um = ProcessUnitManager::new();
        um.load("empty.service", &UnitFile::default()).await.unwrap();
        assert!(matches!(
            um.start("empty.service").await,
            Err(UnitError::Manager { .. })
        ));
    }

    #[tokio::test]
    async fn unload_unknown_unit_is_ok() {
        let um = ProcessUnitManager::new();
        assert!(um.unload("missing.service").await.is_ok());
    }
}
