//! Leader-elected scheduling engine.
//!
//! Every machine runs an [`Engine`] but only the holder of the leader lease
//! acts. The leader repairs drift between jobs and assignments and places
//! unscheduled jobs; every other engine stays passive and writes nothing.
//!
//! # Scheduling cycle
//!
//! A cycle is triggered by changes under the job and machine key spaces, by a
//! periodic sweep and by acquiring leadership. Each cycle, in order:
//!
//! 1. deletes assignments of jobs that no longer exist
//! 2. deletes assignments of jobs whose target state is inactive
//! 3. deletes assignments pointing at dead machines
//! 4. places every unscheduled active job, in name order
//!
//! Every assignment write is a compare-and-swap on the assignment key. A lost
//! race discards the decision and the next cycle re-evaluates.

pub mod cycle;
pub mod leader;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RegistryError;
use crate::registry::{spawn_trigger, RegistryClient};
use crate::timer::{jittered, sleep_until, Backoff};

pub use cycle::{CycleStats, JobCondition};
pub use leader::{LeaderElection, DEFAULT_LEASE_TTL};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Evaluating,
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnginePhase::Idle => write!(f, "idle"),
            EnginePhase::Evaluating => write!(f, "evaluating"),
        }
    }
}

pub struct Engine {
    machine_id: String,
    client: RegistryClient,
    election: LeaderElection,
    sweep_interval: Duration,
    conditions: Mutex<BTreeMap<String, JobCondition>>,
    phase: watch::Sender<EnginePhase>,
}

impl Engine {
    pub fn new(machine_id: &str, client: RegistryClient) -> Self {
        Self::with_lease_ttl(machine_id, client, DEFAULT_LEASE_TTL)
    }

    pub fn with_lease_ttl(machine_id: &str, client: RegistryClient, ttl: Duration) -> Self {
        let (phase, _) = watch::channel(EnginePhase::Idle);
        Self {
            machine_id: machine_id.to_string(),
            election: LeaderElection::new(machine_id, client.clone(), ttl),
            client,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            conditions: Mutex::new(BTreeMap::new()),
            phase,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.election.subscribe()
    }

    pub fn phase(&self) -> EnginePhase {
        *self.phase.borrow()
    }

    /// Jobs the last cycle could not place, with the reason.
    pub async fn conditions(&self) -> BTreeMap<String, JobCondition> {
        self.conditions.lock().await.clone()
    }

    /// Renew or try to acquire leadership once.
    pub async fn maintain_leadership(&self) -> Result<bool, RegistryError> {
        let was_leader = self.is_leader();
        let result = self.election.maintain().await;
        if was_leader && !self.is_leader() {
            // Conditions were computed against a view this engine no longer
            // owns.
            self.conditions.lock().await.clear();
        }
        result
    }

    /// Run one scheduling cycle. `None` if this engine is not the leader, in
    /// which case nothing was read or written.
    pub async fn run_cycle(&self) -> Result<Option<CycleStats>, RegistryError> {
        if !self.is_leader() {
            return Ok(None);
        }

        let mut conditions = self.conditions.lock().await;
        self.phase.send_replace(EnginePhase::Evaluating);
        let result = cycle::run(&self.client, &mut conditions, || self.is_leader()).await;
        self.phase.send_replace(EnginePhase::Idle);

        let stats = result?;
        if stats.changed() || stats.errors > 0 {
            tracing::info!(
                scheduled = stats.scheduled,
                unscheduled = stats.unscheduled,
                unschedulable = stats.unschedulable,
                conflicts = stats.conflicts,
                errors = stats.errors,
                "Scheduling cycle complete"
            );
        } else {
            tracing::debug!(unschedulable = stats.unschedulable, "Scheduling cycle found nothing to do");
        }
        Ok(Some(stats))
    }

    /// Campaign for leadership and, while leader, run scheduling cycles until
    /// cancelled. The lease is released on the way out.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        spawn_trigger(
            self.client.registry(),
            vec![self.client.keys().jobs(), self.client.keys().machines()],
            tx.clone(),
            cancel.clone(),
        );

        let leadership = {
            let engine = self.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            tokio::spawn(async move { engine.campaign(tx, cancel).await })
        };

        let mut sweep = tokio::time::interval(jittered(self.sweep_interval, 0.1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = Backoff::default();
        let mut retry_at: Option<Instant> = None;

        tracing::info!(machine_id = %self.machine_id, "Engine started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = rx.recv() => {}
                _ = sweep.tick() => {}
                _ = sleep_until(retry_at) => retry_at = None,
            }

            match self.run_cycle().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempts = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Scheduling cycle failed"
                    );
                    retry_at = Some(Instant::now() + delay);
                }
            }
        }

        if let Err(e) = leadership.await {
            tracing::error!(error = %e, "Leadership task panicked");
        }
        self.election.resign().await;
        tracing::info!(machine_id = %self.machine_id, "Engine stopped");
    }

    async fn campaign(&self, trigger: mpsc::Sender<()>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.election.ttl() / 3);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let was_leader = self.is_leader();
            match self.maintain_leadership().await {
                Ok(true) if !was_leader => {
                    let _ = trigger.try_send(());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(machine_id = %self.machine_id, error = %e, "Leadership maintenance failed");
                }
            }
        }
    }
}
