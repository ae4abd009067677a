use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::error::RegistryError;
use crate::registry::{Lease, RegistryClient};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// Leadership held through the `engine/leader` lease.
///
/// Only the holder of the lease may write assignments. The lease is renewed
/// with a deadline shorter than its TTL; any renewal that fails or runs out
/// of time makes this engine step down at once rather than risk acting on a
/// lease another machine may already hold.
pub struct LeaderElection {
    machine_id: String,
    client: RegistryClient,
    ttl: Duration,
    lease: Mutex<Option<Lease>>,
    leader: watch::Sender<bool>,
}

impl LeaderElection {
    pub fn new(machine_id: &str, client: RegistryClient, ttl: Duration) -> Self {
        let (leader, _) = watch::channel(false);
        Self {
            machine_id: machine_id.to_string(),
            client,
            ttl,
            lease: Mutex::new(None),
            leader,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_leader(&self) -> bool {
        *self.leader.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader.subscribe()
    }

    fn renew_timeout(&self) -> Duration {
        self.ttl / 2
    }

    /// Renew the lease if held, otherwise try to take it. Returns whether
    /// this engine is leader afterwards.
    pub async fn maintain(&self) -> Result<bool, RegistryError> {
        let mut lease = self.lease.lock().await;

        match lease.take() {
            Some(held) => {
                let renewal = tokio::time::timeout(
                    self.renew_timeout(),
                    self.client.renew_lease(&held, self.ttl),
                )
                .await;
                match renewal {
                    Ok(Ok(Some(renewed))) => {
                        *lease = Some(renewed);
                        Ok(true)
                    }
                    Ok(Ok(None)) => {
                        self.step_down("lease lost");
                        Ok(false)
                    }
                    Ok(Err(e)) => {
                        self.step_down("lease renewal failed");
                        Err(e)
                    }
                    Err(_) => {
                        self.step_down("lease renewal timed out");
                        Err(RegistryError::Timeout(self.renew_timeout()))
                    }
                }
            }
            None => match self.client.acquire_leadership(&self.machine_id, self.ttl).await? {
                Some(acquired) => {
                    tracing::info!(
                        machine_id = %self.machine_id,
                        version = acquired.version,
                        ttl_secs = self.ttl.as_secs(),
                        "Became engine leader"
                    );
                    *lease = Some(acquired);
                    self.leader.send_replace(true);
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    fn step_down(&self, reason: &str) {
        if self.leader.send_replace(false) {
            tracing::warn!(machine_id = %self.machine_id, reason, "Stepped down as engine leader");
        }
    }

    /// Give up leadership and release the lease so another engine can take
    /// over without waiting for expiry.
    pub async fn resign(&self) {
        let held = self.lease.lock().await.take();
        self.step_down("resigned");
        if let Some(held) = held {
            if let Err(e) = self.client.release_lease(&held).await {
                tracing::warn!(machine_id = %self.machine_id, error = %e, "Failed to release leader lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn only_one_leader_until_expiry() {
        let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));
        let ttl = Duration::from_secs(3);
        let a = LeaderElection::new("a", client.clone(), ttl);
        let b = LeaderElection::new("b", client.clone(), ttl);

        assert!(a.maintain().await.unwrap());
        assert!(!b.maintain().await.unwrap());
        assert!(a.maintain().await.unwrap());
        assert_eq!(client.leader().await.unwrap().as_deref(), Some("a"));

        // a stops renewing.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(b.maintain().await.unwrap());
        assert!(!a.maintain().await.unwrap());
        assert!(!a.is_leader());
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn resign_releases_lease() {
        let client = RegistryClient::new(Arc::new(MemoryRegistry::new()));
        let a = LeaderElection::new("a", client.clone(), DEFAULT_LEASE_TTL);
        assert!(a.maintain().await.unwrap());

        a.resign().await;
        assert!(!a.is_leader());
        assert!(client.leader().await.unwrap().is_none());
    }
}
