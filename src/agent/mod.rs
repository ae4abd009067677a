//! Per-machine agent.
//!
//! The agent keeps the local unit manager's set of loaded and running units
//! identical to the set of jobs the engine assigned to this machine:
//!
//! - [`Agent`]: local unit operations on top of a [`UnitManager`]
//! - [`plan`]: pure diff of desired against actual, as ordered task chains
//! - [`AgentReconciler`]: the reconciliation loop driven by registry changes
//!   and a periodic timer
//! - [`Heartbeat`]: the machine's presence lease, with a purge of all local
//!   units when it cannot be renewed

pub mod heartbeat;
pub mod reconcile;
pub mod task;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::UnitError;
use crate::job::{Job, JobState};
use crate::unit::{UnitManager, UnitStateGenerator, UnitStatus};

pub use heartbeat::Heartbeat;
pub use reconcile::AgentReconciler;
pub use task::{plan, LocalUnit, Task, TaskChain, TaskKind};

pub struct Agent {
    machine_id: String,
    manager: Arc<dyn UnitManager>,
    generator: Arc<UnitStateGenerator>,
    /// Set while the machine's presence lease is lost. No units are started
    /// while fenced.
    fenced: AtomicBool,
}

impl Agent {
    pub fn new(
        machine_id: &str,
        manager: Arc<dyn UnitManager>,
        generator: Arc<UnitStateGenerator>,
    ) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            manager,
            generator,
            fenced: AtomicBool::new(false),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn generator(&self) -> &Arc<UnitStateGenerator> {
        &self.generator
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    pub fn set_fenced(&self, fenced: bool) {
        if self.fenced.swap(fenced, Ordering::SeqCst) != fenced {
            if fenced {
                tracing::warn!(machine_id = %self.machine_id, "Agent fenced, local units will not be loaded or started");
            } else {
                tracing::info!(machine_id = %self.machine_id, "Agent unfenced");
            }
        }
    }

    /// Load a job's unit. Loading the same contents again is a no-op;
    /// different contents under a loaded name is a conflict.
    pub async fn load_unit(&self, job: &Job) -> Result<(), UnitError> {
        self.require_unfenced(&job.name)?;
        let hash = job.hash();
        if let Some(existing) = self.manager.state(&job.name).await? {
            if existing.hash != hash {
                return Err(UnitError::ContentConflict {
                    name: job.name.clone(),
                });
            }
        } else {
            self.manager.load(&job.name, &job.unit).await?;
            tracing::info!(unit = %job.name, hash = %hash.short(), "Unit loaded");
        }

        self.generator.subscribe(&job.name).await;
        Ok(())
    }

    /// Unload a unit. Never fails: unknown names are ignored and unit manager
    /// errors are only logged.
    pub async fn unload_unit(&self, name: &str) {
        match self.manager.unload(name).await {
            Ok(()) => tracing::info!(unit = %name, "Unit unloaded"),
            Err(e) => tracing::warn!(unit = %name, error = %e, "Failed to unload unit"),
        }
        self.generator.unsubscribe(name).await;
    }

    pub async fn start_unit(&self, name: &str) -> Result<(), UnitError> {
        self.require_loaded(name).await?;
        self.require_unfenced(name)?;
        self.manager.start(name).await?;
        tracing::info!(unit = %name, "Unit started");
        Ok(())
    }

    pub async fn stop_unit(&self, name: &str) -> Result<(), UnitError> {
        self.require_loaded(name).await?;
        self.manager.stop(name).await?;
        tracing::info!(unit = %name, "Unit stopped");
        Ok(())
    }

    fn require_unfenced(&self, name: &str) -> Result<(), UnitError> {
        if self.is_fenced() {
            return Err(UnitError::Manager {
                name: name.to_string(),
                reason: "machine presence lost".to_string(),
            });
        }
        Ok(())
    }

    async fn require_loaded(&self, name: &str) -> Result<(), UnitError> {
        match self.manager.state(name).await? {
            Some(_) => Ok(()),
            None => Err(UnitError::NotLoaded(name.to_string())),
        }
    }

    /// Loaded and launched units as the unit manager currently reports them.
    pub async fn units(&self) -> Result<BTreeMap<String, JobState>, UnitError> {
        Ok(self
            .local_units()
            .await?
            .into_iter()
            .map(|(name, unit)| (name, unit.state))
            .collect())
    }

    /// Like [`units`](Self::units), with each unit's loaded content hash.
    pub async fn local_units(&self) -> Result<BTreeMap<String, LocalUnit>, UnitError> {
        let mut units = BTreeMap::new();
        for name in self.manager.units().await? {
            let Some(unit) = self.manager.state(&name).await? else {
                continue;
            };
            if unit.status == UnitStatus::Inactive {
                continue;
            }
            units.insert(
                name,
                LocalUnit {
                    state: unit.status.job_state(),
                    hash: Some(unit.hash),
                },
            );
        }
        Ok(units)
    }

    /// Stop and unload every local unit.
    pub async fn purge(&self) {
        let names = match self.manager.units().await {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(machine_id = %self.machine_id, error = %e, "Failed to list units for purge");
                return;
            }
        };

        tracing::info!(machine_id = %self.machine_id, units = names.len(), "Purging local units");
        for name in names {
            if let Ok(Some(unit)) = self.manager.state(&name).await {
                if unit.status.job_state() == JobState::Launched {
                    if let Err(e) = self.manager.stop(&name).await {
                        tracing::warn!(unit = %name, error = %e, "Failed to stop unit during purge");
                    }
                }
            }
            self.unload_unit(&name).await;
        }
    }

    /// Run one task of a chain.
    pub async fn apply(&self, task: &Task, chain: &TaskChain) -> Result<(), UnitError> {
        tracing::debug!(unit = %chain.unit, task = %task.kind, reason = task.reason, "Applying task");
        match task.kind {
            TaskKind::LoadUnit => match &chain.job {
                Some(job) => self.load_unit(job).await,
                None => Err(UnitError::Manager {
                    name: chain.unit.clone(),
                    reason: "no job to load".to_string(),
                }),
            },
            TaskKind::UnloadUnit => {
                self.unload_unit(&chain.unit).await;
                Ok(())
            }
            TaskKind::StartUnit => self.start_unit(&chain.unit).await,
            TaskKind::StopUnit => self.stop_unit(&chain.unit).await,
        }
    }
}
