use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::machine::MachineState;
use crate::registry::{Lease, RegistryClient};

pub const DEFAULT_MACHINE_TTL: Duration = Duration::from_secs(30);

/// Keeps this machine's presence lease alive.
///
/// The lease is renewed every `ttl / 3`. If it cannot be renewed for longer
/// than one TTL the engine will already consider the machine dead and may
/// have moved its jobs elsewhere, so every local unit is purged and the agent
/// is fenced until the machine registers again.
pub struct Heartbeat {
    agent: Arc<Agent>,
    client: RegistryClient,
    machine: MachineState,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(agent: Arc<Agent>, client: RegistryClient, machine: MachineState) -> Self {
        Self {
            agent,
            client,
            machine,
            ttl: DEFAULT_MACHINE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.ttl / 3);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut lease: Option<Lease> = None;
        let mut last_renewed = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (next, renewed) = match lease.take() {
                None => {
                    let registered = self.register().await;
                    let ok = registered.is_some();
                    (registered, ok)
                }
                Some(held) => match self.client.renew_lease(&held, self.ttl).await {
                    Ok(Some(renewed)) => (Some(renewed), true),
                    Ok(None) => {
                        tracing::warn!(machine_id = %self.machine.id, "Presence lease lost");
                        self.fence().await;
                        (None, false)
                    }
                    Err(e) => {
                        tracing::warn!(machine_id = %self.machine.id, error = %e, "Failed to renew presence lease");
                        (Some(held), false)
                    }
                },
            };
            lease = next;

            if renewed {
                last_renewed = Instant::now();
                self.agent.set_fenced(false);
            } else if last_renewed.elapsed() > self.ttl {
                self.fence().await;
            }
        }

        if let Some(held) = lease {
            if let Err(e) = self.client.release_lease(&held).await {
                tracing::warn!(machine_id = %self.machine.id, error = %e, "Failed to release presence lease");
            }
        }
    }

    async fn register(&self) -> Option<Lease> {
        match self.client.register_machine(&self.machine, self.ttl).await {
            Ok(Some(lease)) => {
                tracing::info!(machine_id = %self.machine.id, ttl_secs = self.ttl.as_secs(), "Machine registered");
                Some(lease)
            }
            Ok(None) => {
                tracing::warn!(machine_id = %self.machine.id, "Presence key still held, waiting for it to expire");
                None
            }
            Err(e) => {
                tracing::warn!(machine_id = %self.machine.id, error = %e, "Failed to register machine");
                None
            }
        }
    }

    async fn fence(&self) {
        if self.agent.is_fenced() {
            return;
        }
        self.agent.set_fenced(true);
        self.agent.purge().await;
    }
}
