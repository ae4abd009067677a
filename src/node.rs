use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentReconciler, Heartbeat};
use crate::api::run_api;
use crate::config::NodeConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::machine::{resolve_machine_id, MachineState};
use crate::registry::{KeyLayout, Registry, RegistryClient};
use crate::shutdown::drain;
use crate::unit::{UnitManager, UnitStateGenerator};

/// Time each group of tasks gets to stop before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One machine of the cluster: presence heartbeat, agent, unit state
/// generator, an engine candidate and the optional read API.
pub struct Node {
    config: NodeConfig,
    machine: MachineState,
    client: RegistryClient,
    generator: Arc<UnitStateGenerator>,
    agent: Arc<Agent>,
    reconciler: Arc<AgentReconciler>,
    engine: Option<Arc<Engine>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        registry: Arc<dyn Registry>,
        manager: Arc<dyn UnitManager>,
    ) -> Self {
        let machine_id = resolve_machine_id(config.machine.machine_id.clone());
        let client = RegistryClient::new(registry)
            .with_keys(KeyLayout::new(&config.registry.key_prefix))
            .with_timeout(config.registry.request_timeout);

        let mut machine = MachineState::new(&machine_id);
        machine.metadata = config.machine.metadata.clone();
        machine.public_ip = config.machine.public_ip.clone();
        machine.hostname = std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty());

        let generator = Arc::new(
            UnitStateGenerator::new(&machine_id, manager.clone(), client.clone())
                .with_debounce(config.agent.state_debounce)
                .with_resync(config.agent.state_resync),
        );
        let agent = Arc::new(Agent::new(&machine_id, manager, generator.clone()));
        let reconciler = Arc::new(
            AgentReconciler::new(agent.clone(), client.clone())
                .with_interval(config.agent.reconcile_interval),
        );
        let engine = config.engine.enabled.then(|| {
            Arc::new(
                Engine::with_lease_ttl(&machine_id, client.clone(), config.engine.lease_ttl)
                    .with_sweep_interval(config.engine.sweep_interval),
            )
        });

        Self {
            config,
            machine,
            client,
            generator,
            agent,
            reconciler,
            engine,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine.id
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn engine(&self) -> Option<&Arc<Engine>> {
        self.engine.as_ref()
    }

    /// Run every component until `cancel` fires, then shut down in order:
    /// stop the loops that act on the cluster, purge local units, and finally
    /// stop the generator, which deletes this machine's unit states.
    ///
    /// # Errors
    ///
    /// Returns an error if the API listener cannot be bound. Failures inside
    /// the running components are logged and retried, never returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let api_listener = match self.config.api_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        tracing::info!(
            machine_id = %self.machine.id,
            engine = self.engine.is_some(),
            "Starting node"
        );

        let workers = CancellationToken::new();
        let publisher = CancellationToken::new();

        let generator_task = tokio::spawn(self.generator.clone().run(publisher.clone()));

        let mut tasks = Vec::new();

        let heartbeat = Heartbeat::new(self.agent.clone(), self.client.clone(), self.machine.clone())
            .with_ttl(self.config.agent.machine_ttl);
        let heartbeat_cancel = workers.clone();
        tasks.push((
            "heartbeat",
            tokio::spawn(async move { heartbeat.run(heartbeat_cancel).await }),
        ));

        tasks.push((
            "reconciler",
            tokio::spawn(self.reconciler.clone().run(workers.clone())),
        ));

        if let Some(engine) = &self.engine {
            tasks.push(("engine", tokio::spawn(engine.clone().run(workers.clone()))));
        }

        if let Some(listener) = api_listener {
            let client = self.client.clone();
            let api_cancel = workers.clone();
            tasks.push((
                "api",
                tokio::spawn(async move {
                    if let Err(e) = run_api(listener, client, api_cancel).await {
                        tracing::error!(error = %e, "API server failed");
                    }
                }),
            ));
        }

        cancel.cancelled().await;
        tracing::info!(machine_id = %self.machine.id, "Shutting down node");

        workers.cancel();
        drain(tasks, SHUTDOWN_GRACE).await;

        self.agent.purge().await;

        publisher.cancel();
        drain(vec![("generator", generator_task)], SHUTDOWN_GRACE).await;

        tracing::info!(machine_id = %self.machine.id, "Node stopped");
        Ok(())
    }
}
