//! SimBridge - Episode transport for remote simulations
//!
//! Runs multi-role missions against simulation services, serves the proxy
//! bridge, and provides the echo fixture for checking a framing peer.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use simbridge::config::{self, Config};
use simbridge::coordinator::{Coordinator, RandomPolicy};
use simbridge::network::{echo, resolve_host, serve_echo};
use simbridge::protocol;
use simbridge::proxy::{DriverFactory, ProxyServer};
use simbridge::session::{MissionTemplate, Shutdown};

/// SimBridge - Drive simulation episodes over the network
#[derive(Parser)]
#[command(name = "simbridge")]
#[command(author = "SimBridge Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Drive remote simulation episodes from reinforcement-learning agents", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every role of a mission with a random policy
    Run {
        /// Mission file
        #[arg(short, long)]
        mission: PathBuf,

        /// Number of agent roles the mission declares
        #[arg(short, long, default_value_t = 1)]
        agents: usize,

        /// Head node address
        #[arg(long)]
        server: Option<String>,

        /// Head node command port
        #[arg(short, long)]
        port: Option<u16>,

        /// Address of the other roles' services
        #[arg(long)]
        server2: Option<String>,

        /// Base command port of the other roles' services
        #[arg(long)]
        port2: Option<u16>,

        /// Episodes per role
        #[arg(short, long)]
        episodes: Option<u64>,

        /// Episode count to start from
        #[arg(long)]
        episode: Option<u64>,

        /// Rebuild sessions every this many episodes (0 = never)
        #[arg(long)]
        resync: Option<u64>,

        /// Experiment unique id
        #[arg(long)]
        experiment_id: Option<String>,
    },

    /// Serve environments to remote clients
    Proxy {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the echo fixture server
    EchoServer {
        /// Port to listen on
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,
    },

    /// Send one message to an echo server
    Echo {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        /// Server port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,

        /// Message to send
        #[arg(short, long, default_value = "<Echo>Hello!</Echo>")]
        message: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    let (shutdown, signal) = Shutdown::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("Interrupted, shutting down (press Ctrl-C again to force)");
        shutdown.trigger();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted again, exiting");
            std::process::exit(130);
        }
    });

    match cli.command {
        Commands::Run {
            mission,
            agents,
            server,
            port,
            server2,
            port2,
            episodes,
            episode,
            resync,
            experiment_id,
        } => {
            if let Some(server) = server {
                config.server.address = server;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if server2.is_some() {
                config.server.secondary_address = server2;
            }
            if port2.is_some() {
                config.server.secondary_port = port2;
            }
            if let Some(episodes) = episodes {
                config.experiment.episodes = episodes;
            }
            if let Some(episode) = episode {
                config.experiment.start_episode = episode;
            }
            if let Some(resync) = resync {
                config.experiment.resync = resync;
            }
            if experiment_id.is_some() {
                config.experiment.unique_id = experiment_id;
            }
            config.validate()?;

            let text = std::fs::read_to_string(&mission)?;
            let mission = MissionTemplate::new(text, agents);
            let coordinator = Coordinator::new(config.coordinator_config(), Arc::new(mission))
                .with_shutdown(signal);
            run_mission(coordinator).await?;
        }
        Commands::Proxy { port } => {
            if let Some(port) = port {
                config.proxy.port = port;
            }
            run_proxy(config, signal).await?;
        }
        Commands::EchoServer { port } => {
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            serve_echo(listener, signal).await?;
        }
        Commands::Echo {
            server,
            port,
            message,
        } => {
            let addr = resolve_host(&server, port).await?;
            let reply = echo(addr, message.as_bytes(), config.session_timeouts().connect).await?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run every role and print a per-role report
async fn run_mission(coordinator: Coordinator) -> anyhow::Result<()> {
    let roles = coordinator.role_count();
    let reports = coordinator.run(|_| RandomPolicy::new()).await;

    println!("\n========================================");
    println!("  Mission Report");
    println!("========================================");
    let mut failed = 0;
    for report in &reports {
        match &report.outcome {
            Ok(summary) => println!(
                "  Role {}: {} episodes, {} steps, reward {:.2}",
                report.role, summary.episodes, summary.steps, summary.total_reward
            ),
            Err(e) => {
                failed += 1;
                println!("  Role {}: FAILED: {}", report.role, e);
            }
        }
    }
    println!("========================================");

    if failed > 0 {
        anyhow::bail!("{} of {} roles failed", failed, roles);
    }
    Ok(())
}

/// Serve the proxy bridge with one simulation session per client
async fn run_proxy(config: Config, signal: simbridge::session::ShutdownSignal) -> anyhow::Result<()> {
    let default_mission = match &config.proxy.mission {
        Some(path) => std::fs::read_to_string(path)?,
        None => String::new(),
    };

    let factory = DriverFactory::new(config.server_endpoint(), default_mission)
        .with_retry(config.retry_policy())
        .with_timeouts(config.session_timeouts())
        .with_resync(config.resync_policy())
        .with_shape(config.observation_shape())
        .with_shutdown(signal.clone());

    tracing::info!(
        "Proxying sessions on {} to {}",
        config.proxy.port,
        config.server_endpoint()
    );
    let listener = ProxyServer::bind(&config.proxy.bind_address, config.proxy.port).await?;
    ProxyServer::new(factory).serve(listener, signal).await?;
    Ok(())
}
