use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{plan, Agent};
use crate::error::Result;
use crate::registry::{spawn_trigger, RegistryClient};
use crate::timer::{jittered, Backoff};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub chains: usize,
    pub tasks_applied: usize,
    pub failed_chains: usize,
}

/// Drives an [`Agent`] toward the jobs assigned to its machine.
pub struct AgentReconciler {
    agent: Arc<Agent>,
    client: RegistryClient,
    interval: Duration,
}

impl AgentReconciler {
    pub fn new(agent: Arc<Agent>, client: RegistryClient) -> Self {
        Self {
            agent,
            client,
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// One full pass: read desired and actual state, plan, apply.
    ///
    /// A registry failure aborts the pass before anything is changed. A unit
    /// failure skips the rest of that unit's chain only.
    pub async fn reconcile(&self) -> Result<PassStats> {
        let machine_id = self.agent.machine_id();
        let desired: BTreeMap<String, _> = self
            .client
            .scheduled_jobs(machine_id)
            .await?
            .into_iter()
            .map(|job| (job.name.clone(), job))
            .collect();
        let actual = self.agent.local_units().await?;

        let chains = plan(&desired, &actual);
        let mut stats = PassStats {
            chains: chains.len(),
            ..Default::default()
        };

        for chain in &chains {
            if self.agent.is_fenced() {
                tracing::warn!(machine_id = %machine_id, "Presence lost mid-pass, abandoning remaining tasks");
                break;
            }
            for task in &chain.tasks {
                if let Err(e) = self.agent.apply(task, chain).await {
                    tracing::warn!(
                        unit = %chain.unit,
                        task = %task.kind,
                        error = %e,
                        "Task failed, skipping the rest of this unit until the next pass"
                    );
                    stats.failed_chains += 1;
                    break;
                }
                stats.tasks_applied += 1;
            }
        }

        tracing::debug!(
            machine_id = %machine_id,
            desired = desired.len(),
            chains = stats.chains,
            applied = stats.tasks_applied,
            failed = stats.failed_chains,
            "Reconciliation pass complete"
        );
        Ok(stats)
    }

    /// Reconcile on every change under the job key space and on a periodic
    /// timer until cancelled. Triggers arriving during a pass collapse into a
    /// single follow-up pass.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        spawn_trigger(
            self.client.registry(),
            vec![self.client.keys().jobs()],
            tx.clone(),
            cancel.clone(),
        );

        let mut interval = tokio::time::interval(jittered(self.interval, 0.1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = Backoff::default();

        tracing::info!(machine_id = %self.agent.machine_id(), "Agent reconciler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = rx.recv() => {}
                _ = interval.tick() => {}
            }

            if self.agent.is_fenced() {
                tracing::debug!("Skipping reconciliation while fenced");
                continue;
            }

            match self.reconcile().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempts = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Reconciliation pass aborted"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // Retry right away rather than waiting for the next tick.
                    let _ = tx.try_send(());
                }
            }
        }

        tracing::info!(machine_id = %self.agent.machine_id(), "Agent reconciler stopped");
    }
}
