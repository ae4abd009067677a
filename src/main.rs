use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use fleet_lite::cli::{self, MachineRow, UnitFileRow, UnitRow};
use fleet_lite::config::NodeConfig;
use fleet_lite::job::JobState;
use fleet_lite::machine::parse_metadata;
use fleet_lite::node::Node;
use fleet_lite::registry::keys::DEFAULT_PREFIX;
use fleet_lite::registry::remote::RemoteRegistry;
use fleet_lite::registry::{server, KeyLayout, MemoryRegistry, RegistryClient};
use fleet_lite::shutdown::cancel_on_signal;
use fleet_lite::unit::{FakeUnitManager, ProcessUnitManager, UnitManager};

#[derive(Parser, Debug)]
#[command(name = "fleet-lite")]
#[command(version)]
#[command(about = "A cluster-wide unit scheduler with per-machine reconciliation")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve an in-memory registry over HTTP
    Registry(RegistryArgs),

    /// Run a machine: presence, agent, state publisher and engine candidate
    Agent(AgentArgs),

    /// Submit unit files without scheduling them
    Submit {
        #[command(flatten)]
        client: ClientArgs,
        /// Paths to unit files
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// Schedule units and load them on their machine
    Load {
        #[command(flatten)]
        client: ClientArgs,
        /// Unit names, or paths to submit first
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// Schedule units and start them
    Start {
        #[command(flatten)]
        client: ClientArgs,
        /// Unit names, or paths to submit first
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// Stop running units, keeping them loaded
    Stop {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// Unschedule units, keeping them submitted
    Unload {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// Remove units from the cluster entirely
    Destroy {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(required = true)]
        units: Vec<String>,
    },

    /// List the observed state of every unit on every machine
    ListUnits {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// List submitted units with their desired and observed state
    ListUnitFiles {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// List machines holding a presence lease
    ListMachines {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Registry Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RegistryArgs {
    /// Address to serve the registry on
    #[arg(long, default_value = "0.0.0.0:4001")]
    listen: SocketAddr,

    /// Number of events retained for watchers
    #[arg(long, default_value = "1000")]
    history: usize,
}

// =============================================================================
// Agent Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Registry base URL
    #[arg(long, env = "FLEET_ENDPOINT", default_value = "http://127.0.0.1:4001")]
    endpoint: String,

    /// Key prefix under which all cluster state lives
    #[arg(long, env = "FLEET_KEY_PREFIX", default_value = DEFAULT_PREFIX)]
    key_prefix: String,

    /// Machine ID (defaults to /etc/machine-id)
    #[arg(long, env = "FLEET_MACHINE_ID")]
    machine_id: Option<String>,

    /// Public IP published in the presence record
    #[arg(long, env = "FLEET_PUBLIC_IP")]
    public_ip: Option<String>,

    /// Machine metadata as key=value pairs, comma-separated
    #[arg(long, env = "FLEET_METADATA", default_value = "")]
    metadata: String,

    /// Serve the read API on this address
    #[arg(long, env = "FLEET_API_ADDR")]
    api_addr: Option<SocketAddr>,

    /// Never campaign for engine leadership
    #[arg(long)]
    no_engine: bool,

    /// Presence lease TTL in seconds
    #[arg(long, default_value = "30")]
    machine_ttl: u64,

    /// Engine leader lease TTL in seconds
    #[arg(long, default_value = "10")]
    engine_ttl: u64,

    /// Registry request timeout in milliseconds
    #[arg(long, default_value = "5000")]
    request_timeout_ms: u64,

    /// How units are executed
    #[arg(long, default_value = "process")]
    unit_manager: UnitManagerKind,
}

#[derive(Debug, Clone, ValueEnum)]
enum UnitManagerKind {
    /// Run ExecStart= as a child process
    Process,
    /// Track unit states in memory without running anything
    Fake,
}

// =============================================================================
// Client Arguments (shared by unit and machine commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Registry base URL
    #[arg(long, short = 'e', env = "FLEET_ENDPOINT", default_value = "http://127.0.0.1:4001")]
    endpoint: String,

    /// Key prefix under which all cluster state lives
    #[arg(long, env = "FLEET_KEY_PREFIX", default_value = DEFAULT_PREFIX)]
    key_prefix: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn connect(args: &ClientArgs) -> Result<RegistryClient, Box<dyn std::error::Error>> {
    let registry = RemoteRegistry::new(&args.endpoint)?;
    Ok(RegistryClient::new(Arc::new(registry)).with_keys(KeyLayout::new(&args.key_prefix)))
}

fn print_rows<T: Serialize>(
    format: &OutputFormat,
    headers: &[&str],
    rows: &[T],
    cells: impl Fn(&T) -> Vec<String>,
    empty: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Table if rows.is_empty() => println!("{}", empty),
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = rows.iter().map(cells).collect();
            print!("{}", cli::render_table(headers, &rows));
        }
    }
    Ok(())
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_registry(args: RegistryArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let cancel = cancel_on_signal("registry");
    let listener = TcpListener::bind(args.listen).await?;
    let registry = Arc::new(MemoryRegistry::with_history(args.history));
    server::serve(listener, registry, cancel).await?;
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let mut config = NodeConfig::new(&args.endpoint).with_metadata(parse_metadata(&args.metadata)?);
    config.machine.machine_id = args.machine_id;
    config.machine.public_ip = args.public_ip;
    config.registry.key_prefix = args.key_prefix;
    config.registry.request_timeout = Duration::from_millis(args.request_timeout_ms);
    config.agent.machine_ttl = Duration::from_secs(args.machine_ttl);
    config.engine.lease_ttl = Duration::from_secs(args.engine_ttl);
    if let Some(addr) = args.api_addr {
        config = config.with_api_addr(addr);
    }
    if args.no_engine {
        config = config.without_engine();
    }

    let registry = Arc::new(RemoteRegistry::new(&config.registry.endpoint)?);
    let manager: Arc<dyn UnitManager> = match args.unit_manager {
        UnitManagerKind::Process => Arc::new(ProcessUnitManager::new()),
        UnitManagerKind::Fake => Arc::new(FakeUnitManager::new()),
    };

    let cancel = cancel_on_signal("agent");
    let node = Node::new(config, registry, manager);
    node.run(cancel).await?;
    Ok(())
}

// =============================================================================
// Client Implementation
// =============================================================================

async fn run_client(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Submit { client, units } => {
            let submitted = cli::submit(&connect(&client)?, &units, JobState::Inactive).await?;
            match client.output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&submitted)?),
                OutputFormat::Table => {
                    for name in submitted {
                        println!("Unit {} submitted", name);
                    }
                }
            }
        }
        Commands::Load { client, units } => {
            cli::set_state(&connect(&client)?, &units, JobState::Loaded).await?;
        }
        Commands::Start { client, units } => {
            cli::set_state(&connect(&client)?, &units, JobState::Launched).await?;
        }
        Commands::Stop { client, units } => {
            cli::set_state(&connect(&client)?, &units, JobState::Loaded).await?;
        }
        Commands::Unload { client, units } => {
            cli::set_state(&connect(&client)?, &units, JobState::Inactive).await?;
        }
        Commands::Destroy { client, units } => {
            cli::destroy(&connect(&client)?, &units).await?;
            for name in &units {
                eprintln!("Destroyed {}", cli::unit_name(name));
            }
        }
        Commands::ListUnits { client } => {
            let rows = cli::unit_rows(&connect(&client)?).await?;
            print_rows(&client.output, &UnitRow::HEADERS, &rows, UnitRow::cells, "No units found.")?;
        }
        Commands::ListUnitFiles { client } => {
            let rows = cli::unit_file_rows(&connect(&client)?).await?;
            print_rows(
                &client.output,
                &UnitFileRow::HEADERS,
                &rows,
                UnitFileRow::cells,
                "No unit files found.",
            )?;
        }
        Commands::ListMachines { client } => {
            let rows = cli::machine_rows(&connect(&client)?).await?;
            print_rows(
                &client.output,
                &MachineRow::HEADERS,
                &rows,
                MachineRow::cells,
                "No machines found.",
            )?;
        }
        Commands::Registry(_) | Commands::Agent(_) => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Registry(args) => run_registry(args).await,
        Commands::Agent(args) => run_agent(args).await,
        command => run_client(command).await,
    }
}
