use std::net::SocketAddr;
use std::time::Duration;

use crate::machine::Metadata;
use crate::registry::keys::DEFAULT_PREFIX;

/// Identity this machine publishes in its presence record.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    /// Stable machine ID. Resolved from `/etc/machine-id` when unset.
    pub machine_id: Option<String>,
    pub public_ip: Option<String>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Presence lease TTL. Renewed every third of it.
    pub machine_ttl: Duration,
    /// Safety-net reconciliation interval on top of watch triggers.
    pub reconcile_interval: Duration,
    /// Window over which unit state changes are collapsed before publishing.
    pub state_debounce: Duration,
    /// Interval at which every unit state is republished.
    pub state_resync: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            machine_ttl: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(5),
            state_debounce: Duration::from_millis(100),
            state_resync: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether this machine campaigns for engine leadership at all.
    pub enabled: bool,
    pub lease_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL of the registry server.
    pub endpoint: String,
    pub key_prefix: String,
    /// Deadline for every registry operation.
    pub request_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:4001".to_string(),
            key_prefix: DEFAULT_PREFIX.to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub machine: MachineConfig,
    pub agent: AgentConfig,
    pub engine: EngineConfig,
    pub registry: RegistryConfig,
    /// Serve the read API here when set.
    pub api_addr: Option<SocketAddr>,
}

impl NodeConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            registry: RegistryConfig {
                endpoint: endpoint.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_machine_id(mut self, id: &str) -> Self {
        self.machine.machine_id = Some(id.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.machine.metadata = metadata;
        self
    }

    pub fn with_api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    pub fn without_engine(mut self) -> Self {
        self.engine.enabled = false;
        self
    }
}
