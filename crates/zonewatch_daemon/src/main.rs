use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use zonewatch_daemon::{Config, Node};

#[derive(Parser)]
#[command(name = "zonewatchd")]
#[command(about = "Zoned sensor network: section allocation and telemetry correlation")]
struct Cli {
    /// Config file (defaults to ~/.zonewatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service
    Run {
        /// API port, overrides the config file
        #[arg(long)]
        port: Option<u16>,
        /// In-flight delivery limit, overrides the config file
        #[arg(long)]
        max_in_flight: Option<usize>,
    },
    /// Print the validated zone table
    Zones,
    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

async fn run(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    max_in_flight: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = Config::load(config_path.as_deref()).context("loading configuration")?;
    if let Some(port) = port {
        config.api.port = port;
    }
    if let Some(max_in_flight) = max_in_flight {
        config.transport.max_in_flight = max_in_flight;
    }

    info!(
        zones = config.zones.len(),
        max_section = config.zones.max_section(),
        correlation = ?config.correlation,
        allocator = ?config.allocator,
        transport = ?config.transport,
        outbound_mode = ?config.outbound.mode,
        "Starting zonewatch with configuration"
    );

    let addr = config.api.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let node = Node::from_config(config).await?;
    node.run(listener, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn print_zones(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    println!("{} zones, sections 1-{}", config.zones.len(), config.zones.max_section());
    for zone in config.zones.zones() {
        println!(
            "  zone {:>3}  sections {:>3}-{:<3}  temperature {:.1}-{:.1}",
            zone.id,
            zone.sections.min,
            zone.sections.max,
            zone.temperature.min,
            zone.temperature.max
        );
    }
    Ok(())
}

fn init_config(config_path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(Config::default_path);
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    Config::default().save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize structured logging
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(cli.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match cli.command {
        Commands::Run {
            port,
            max_in_flight,
        } => run(cli.config, port, max_in_flight).await,
        Commands::Zones => print_zones(cli.config),
        Commands::InitConfig { force } => init_config(cli.config, force),
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "Fatal Error");
        std::process::exit(1);
    }
}
