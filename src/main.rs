use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use playground::app::Playground;
use playground::broker::BrokerServer;
use playground::config::{expand_tilde, Config};
use playground::runtime::ProbeStatus;
use playground::sandbox::CanonicalId;
use playground::{api, security};

#[derive(Parser)]
#[command(name = "playground", about = "Per-user sandbox orchestration", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, default_value = "~/.config/playground/config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and sandbox proxy
    Serve,

    /// Run the privileged broker daemon
    Broker {
        /// Socket to listen on (defaults to broker.socket_path)
        #[arg(short, long)]
        socket: Option<String>,
    },

    /// Provision the sandbox for a raw id
    Create {
        raw_id: String,

        /// Host directory handed to the provisioning helper
        #[arg(long)]
        host_path: Option<String>,
    },

    /// Run a command inside a sandbox
    Exec {
        id: String,

        /// Working directory relative to the sandbox root
        #[arg(long)]
        cwd: Option<String>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Remove a sandbox and everything stored for it
    Teardown { id: String },

    /// Print the address of a sandbox
    Address { id: String },

    /// Check whether the container runtime is usable
    Probe,

    /// Evaluate a command against the security filter
    Check { command: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    if let Commands::Check { command } = &cli.command {
        return check(command);
    }

    let app = Arc::new(Playground::new(config)?);
    match cli.command {
        Commands::Serve => api::start_server(app).await,
        Commands::Broker { socket } => run_broker(&app, socket).await,
        Commands::Create { raw_id, host_path } => {
            create(&app, &raw_id, host_path.as_deref()).await
        }
        Commands::Exec { id, cwd, command } => {
            exec(&app, &id, cwd.as_deref(), &command.join(" ")).await
        }
        Commands::Teardown { id } => teardown(&app, &id).await,
        Commands::Address { id } => address(&app, &id),
        Commands::Probe => probe(&app),
        Commands::Check { command } => check(&command),
    }
}

fn parse_id(raw: &str) -> Result<CanonicalId> {
    CanonicalId::parse(raw).with_context(|| format!("'{}' is not a canonical sandbox id", raw))
}

async fn run_broker(app: &Playground, socket: Option<String>) -> Result<()> {
    let path = expand_tilde(socket.as_deref().unwrap_or(&app.config.broker.socket_path));
    let mut server = BrokerServer::bind(path, app.config.broker.socket_mode, app.broker_context())?
        .with_read_timeout(Duration::from_millis(app.config.broker.request_timeout_ms));
    info!("Broker listening on {}", server.path().display());

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Broker shutting down");
            Ok(())
        }
    }
}

async fn create(app: &Playground, raw_id: &str, host_path: Option<&str>) -> Result<()> {
    let id = CanonicalId::new(raw_id);
    let provisioned = app.control.provision(&id, raw_id, host_path).await?;

    let address = {
        let resolver = app.resolver.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || resolver.resolve(&id)).await?
    };

    println!("Sandbox:  {}", id);
    println!("Unit:     {}", app.driver.unit_name(&id));
    println!("Route:    {:?}", provisioned.route);
    if let Some(address) = address {
        println!("Address:  {}", address);
    }
    if let Some(log) = provisioned.log {
        println!("Log:      {}", log);
    }
    Ok(())
}

async fn exec(app: &Playground, id: &str, cwd: Option<&str>, command: &str) -> Result<()> {
    let id = parse_id(id)?;
    let outcome = app.control.exec(&id, id.as_str(), command, cwd, None).await?;

    match outcome.output {
        Some(output) => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if output.truncated {
                eprintln!("[output truncated]");
            }
            if !output.exit.success() {
                anyhow::bail!("command ended with {:?}", output.exit);
            }
        }
        None => {
            println!("Accepted by broker");
            if let Some(log) = outcome.log {
                println!("Output will be appended to {}", log);
            }
        }
    }
    Ok(())
}

async fn teardown(app: &Arc<Playground>, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let registry = Arc::clone(&app.registry);
    let report = tokio::task::spawn_blocking(move || registry.teardown(&id)).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.success {
        anyhow::bail!("teardown finished with {} error(s)", report.errors.len());
    }
    Ok(())
}

fn address(app: &Playground, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    match app.resolver.resolve(&id) {
        Some(address) => {
            println!("{}", address);
            Ok(())
        }
        None => anyhow::bail!("no address known for {}", id),
    }
}

fn probe(app: &Playground) -> Result<()> {
    let report = app.driver.probe();
    println!("{}", report.message);
    if let Some(remediation) = &report.remediation {
        println!("Fix: {}", remediation);
    }
    if report.status != ProbeStatus::Ready {
        anyhow::bail!("runtime is not ready");
    }
    Ok(())
}

fn check(command: &str) -> Result<()> {
    let verdict = security::evaluate(command);
    if verdict.allowed {
        println!("allowed");
        return Ok(());
    }
    anyhow::bail!(
        "denied: {}",
        verdict.reason.as_deref().unwrap_or("command not permitted")
    )
}
