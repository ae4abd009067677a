use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FleetError, RegistryError, Result};
use crate::job::{Job, JobObject, JobState, ObservedJobState};
use crate::machine::MachineState;
use crate::registry::keys::JobKey;
use crate::registry::{KeyLayout, Lease, Precondition, Registry};
use crate::unit::UnitState;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Binding of a job to a machine, with the registry version the engine must
/// compare against to change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job: String,
    pub machine_id: String,
    pub version: u64,
}

/// Jobs and assignments read from a single listing, so both views come from
/// the same registry index.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    pub jobs: BTreeMap<String, Job>,
    /// Includes assignments whose job object no longer exists.
    pub assignments: BTreeMap<String, Assignment>,
}

/// Typed access to the registry key space. Every call is bounded by the
/// operation timeout; a timeout is reported as [`RegistryError::Timeout`] and
/// never as an unknown outcome.
#[derive(Clone)]
pub struct RegistryClient {
    registry: Arc<dyn Registry>,
    keys: KeyLayout,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            keys: KeyLayout::default(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_keys(mut self, keys: KeyLayout) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> Arc<dyn Registry> {
        self.registry.clone()
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn deadline<T, F>(&self, fut: F) -> std::result::Result<T, RegistryError>
    where
        F: Future<Output = std::result::Result<T, RegistryError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| RegistryError::Timeout(self.timeout))?
    }

    // ---------------------------------------------------------------------
    // Jobs (written by clients)
    // ---------------------------------------------------------------------

    /// Store a new job and its target state. Fails if the name is taken.
    pub async fn create_job(&self, job: &Job) -> Result<()> {
        let object = serde_json::to_string(&job.object()).map_err(RegistryError::from)?;
        match self
            .deadline(self.registry.set(
                &self.keys.job_object(&job.name),
                &object,
                Precondition::Absent,
            ))
            .await
        {
            Ok(_) => {}
            Err(RegistryError::Conflict { .. }) => {
                return Err(FleetError::InvalidJob(format!(
                    "job {} already exists",
                    job.name
                )))
            }
            Err(e) => return Err(e.into()),
        }

        self.deadline(self.registry.set(
            &self.keys.job_target_state(&job.name),
            &job.target_state.to_string(),
            Precondition::Any,
        ))
        .await?;

        tracing::info!(job = %job.name, target_state = %job.target_state, "Job created");
        Ok(())
    }

    pub async fn set_target_state(&self, name: &str, state: JobState) -> Result<()> {
        if self
            .deadline(self.registry.get(&self.keys.job_object(name)))
            .await?
            .is_none()
        {
            return Err(FleetError::JobNotFound(name.to_string()));
        }

        self.deadline(self.registry.set(
            &self.keys.job_target_state(name),
            &state.to_string(),
            Precondition::Any,
        ))
        .await?;
        tracing::info!(job = %name, target_state = %state, "Job target state changed");
        Ok(())
    }

    /// Remove a job together with its target state and assignment.
    pub async fn destroy_job(&self, name: &str) -> Result<()> {
        if self
            .deadline(self.registry.get(&self.keys.job_object(name)))
            .await?
            .is_none()
        {
            return Err(FleetError::JobNotFound(name.to_string()));
        }

        for key in [
            self.keys.job_target(name),
            self.keys.job_target_state(name),
            self.keys.job_object(name),
        ] {
            self.deadline(self.registry.delete(&key, Precondition::Any))
                .await?;
        }
        tracing::info!(job = %name, "Job destroyed");
        Ok(())
    }

    pub async fn job(&self, name: &str) -> std::result::Result<Option<Job>, RegistryError> {
        Ok(self.job_snapshot().await?.jobs.remove(name))
    }

    pub async fn jobs(&self) -> std::result::Result<Vec<Job>, RegistryError> {
        Ok(self.job_snapshot().await?.jobs.into_values().collect())
    }

    /// Read every job record with one listing.
    pub async fn job_snapshot(&self) -> std::result::Result<JobSnapshot, RegistryError> {
        let entries = self
            .deadline(self.registry.list(&self.keys.jobs()))
            .await?;

        let mut objects: BTreeMap<String, JobObject> = BTreeMap::new();
        let mut targets: BTreeMap<String, JobState> = BTreeMap::new();
        let mut assignments: BTreeMap<String, Assignment> = BTreeMap::new();

        for kv in entries {
            let Some((name, kind)) = self.keys.parse_job_key(&kv.key) else {
                continue;
            };
            match kind {
                JobKey::Object => match serde_json::from_str(&kv.value) {
                    Ok(object) => {
                        objects.insert(name, object);
                    }
                    Err(e) => {
                        tracing::warn!(key = %kv.key, error = %e, "Ignoring unreadable job record");
                    }
                },
                JobKey::TargetState => match kv.value.parse::<JobState>() {
                    Ok(state) => {
                        targets.insert(name, state);
                    }
                    Err(e) => {
                        tracing::warn!(job = %name, error = %e, "Ignoring unreadable target state");
                    }
                },
                JobKey::Target => {
                    assignments.insert(
                        name.clone(),
                        Assignment {
                            job: name,
                            machine_id: kv.value,
                            version: kv.version,
                        },
                    );
                }
            }
        }

        let jobs = objects
            .into_iter()
            .map(|(name, object)| {
                let target_state = targets.get(&name).copied().unwrap_or(JobState::Inactive);
                let target_machine = assignments.get(&name).map(|a| a.machine_id.clone());
                (name, Job::from_object(object, target_state, target_machine))
            })
            .collect();

        Ok(JobSnapshot { jobs, assignments })
    }

    /// Jobs assigned to `machine_id`.
    pub async fn scheduled_jobs(
        &self,
        machine_id: &str,
    ) -> std::result::Result<Vec<Job>, RegistryError> {
        Ok(self
            .jobs()
            .await?
            .into_iter()
            .filter(|j| j.target_machine.as_deref() == Some(machine_id))
            .collect())
    }

    // ---------------------------------------------------------------------
    // Assignments (written by the leader engine)
    // ---------------------------------------------------------------------

    /// Assign an unscheduled job. Conflicts if any assignment already exists.
    pub async fn schedule_job(
        &self,
        name: &str,
        machine_id: &str,
    ) -> std::result::Result<Assignment, RegistryError> {
        let version = self
            .deadline(self.registry.set(
                &self.keys.job_target(name),
                machine_id,
                Precondition::Absent,
            ))
            .await?;
        Ok(Assignment {
            job: name.to_string(),
            machine_id: machine_id.to_string(),
            version,
        })
    }

    /// Remove an assignment, provided it is still the one that was read.
    pub async fn unschedule_job(
        &self,
        assignment: &Assignment,
    ) -> std::result::Result<(), RegistryError> {
        self.deadline(self.registry.delete(
            &self.keys.job_target(&assignment.job),
            Precondition::Version(assignment.version),
        ))
        .await
    }

    /// Remove whatever assignment a job has. Operator escape hatch; the
    /// engine itself always uses [`unschedule_job`](Self::unschedule_job).
    pub async fn clear_assignment(&self, name: &str) -> std::result::Result<(), RegistryError> {
        self.deadline(
            self.registry
                .delete(&self.keys.job_target(name), Precondition::Any),
        )
        .await
    }

    pub async fn assignments(
        &self,
    ) -> std::result::Result<BTreeMap<String, Assignment>, RegistryError> {
        Ok(self.job_snapshot().await?.assignments)
    }

    // ---------------------------------------------------------------------
    // Machines (each machine writes its own presence lease)
    // ---------------------------------------------------------------------

    pub async fn register_machine(
        &self,
        machine: &MachineState,
        ttl: Duration,
    ) -> std::result::Result<Option<Lease>, RegistryError> {
        let value = serde_json::to_string(machine)?;
        self.deadline(
            self.registry
                .acquire_lease(&self.keys.machine(&machine.id), &value, ttl),
        )
        .await
    }

    /// Machines currently holding a presence lease.
    pub async fn machines(&self) -> std::result::Result<Vec<MachineState>, RegistryError> {
        let entries = self
            .deadline(self.registry.list(&self.keys.machines()))
            .await?;
        let mut machines = Vec::with_capacity(entries.len());
        for kv in entries {
            if !kv.key.ends_with("/object") {
                continue;
            }
            match serde_json::from_str(&kv.value) {
                Ok(machine) => machines.push(machine),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Ignoring unreadable machine record");
                }
            }
        }
        Ok(machines)
    }

    // ---------------------------------------------------------------------
    // Leases
    // ---------------------------------------------------------------------

    pub async fn renew_lease(
        &self,
        lease: &Lease,
        ttl: Duration,
    ) -> std::result::Result<Option<Lease>, RegistryError> {
        self.deadline(self.registry.renew_lease(lease, ttl)).await
    }

    pub async fn release_lease(&self, lease: &Lease) -> std::result::Result<(), RegistryError> {
        self.deadline(self.registry.release_lease(lease)).await
    }

    pub async fn acquire_leadership(
        &self,
        machine_id: &str,
        ttl: Duration,
    ) -> std::result::Result<Option<Lease>, RegistryError> {
        self.deadline(
            self.registry
                .acquire_lease(&self.keys.leader(), machine_id, ttl),
        )
        .await
    }

    /// Machine ID of the current leader, if any.
    pub async fn leader(&self) -> std::result::Result<Option<String>, RegistryError> {
        Ok(self
            .deadline(self.registry.get(&self.keys.leader()))
            .await?
            .map(|kv| kv.value))
    }

    // ---------------------------------------------------------------------
    // Unit states (each machine writes its own)
    // ---------------------------------------------------------------------

    pub async fn publish_unit_state(
        &self,
        state: &UnitState,
    ) -> std::result::Result<(), RegistryError> {
        let value = serde_json::to_string(state)?;
        self.deadline(self.registry.set(
            &self.keys.unit_state(&state.name, &state.machine_id),
            &value,
            Precondition::Any,
        ))
        .await?;
        Ok(())
    }

    pub async fn remove_unit_state(
        &self,
        name: &str,
        machine_id: &str,
    ) -> std::result::Result<(), RegistryError> {
        self.deadline(self.registry.delete(
            &self.keys.unit_state(name, machine_id),
            Precondition::Any,
        ))
        .await
    }

    /// Every published unit state, ordered by unit name then machine ID.
    pub async fn unit_states(&self) -> std::result::Result<Vec<UnitState>, RegistryError> {
        let entries = self
            .deadline(self.registry.list(&self.keys.states()))
            .await?;
        let mut states = Vec::with_capacity(entries.len());
        for kv in entries {
            match serde_json::from_str(&kv.value) {
                Ok(state) => states.push(state),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Ignoring unreadable unit state");
                }
            }
        }
        Ok(states)
    }

    /// Derive each job's observed state from its assignment, the state its
    /// machine published and that machine's presence record.
    pub async fn job_states(
        &self,
    ) -> std::result::Result<BTreeMap<String, ObservedJobState>, RegistryError> {
        let snapshot = self.job_snapshot().await?;
        let machines: BTreeMap<String, MachineState> = self
            .machines()
            .await?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        let states = self.unit_states().await?;

        Ok(snapshot
            .jobs
            .keys()
            .map(|name| {
                let machine_id = snapshot.assignments.get(name).map(|a| a.machine_id.clone());
                let state = machine_id.as_ref().and_then(|m| {
                    states
                        .iter()
                        .find(|s| &s.name == name && &s.machine_id == m)
                        .map(|s| s.status)
                });
                let hostname = machine_id
                    .as_ref()
                    .and_then(|m| machines.get(m))
                    .and_then(|m| m.hostname.clone());
                (
                    name.clone(),
                    ObservedJobState {
                        state,
                        machine_id,
                        hostname,
                    },
                )
            })
            .collect())
    }
}
