use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use zonewatch_core::CorrelationConfig;
use zonewatch_sim::{run_experiment, run_fleet, DeviceProfile, ExperimentConfig, FleetConfig};

#[derive(Parser)]
#[command(name = "zonewatch-sim")]
#[command(about = "Simulated devices for zonewatch")]
struct Cli {
    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run devices against a live service until ctrl-c
    Fleet {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value_t = 10)]
        devices: usize,
        #[arg(long, default_value_t = 2500)]
        interval_ms: u64,
        /// Chance, in percent, of a device turning faulty per reading
        #[arg(long, default_value_t = 5.0)]
        fault_percent: f64,
    },
    /// Feed the engines offline and report detection per fault type
    Experiment {
        #[arg(long, default_value_t = 36)]
        devices: usize,
        #[arg(long, default_value_t = 200)]
        ticks: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 50)]
        window_capacity: usize,
        #[arg(long, default_value_t = 5.0)]
        fault_percent: f64,
        /// Write the per-fault table as CSV
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

async fn fleet(
    url: String,
    devices: usize,
    interval_ms: u64,
    fault_percent: f64,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("Stopping fleet");
        let _ = shutdown_tx.send(true);
    });

    let config = FleetConfig {
        url: url.trim_end_matches('/').to_string(),
        devices,
        interval: Duration::from_millis(interval_ms),
        profile: DeviceProfile {
            fault_percent,
            ..DeviceProfile::default()
        },
        ..FleetConfig::default()
    };
    run_fleet(config, shutdown_rx).await?;
    Ok(())
}

fn experiment(config: ExperimentConfig, out: Option<PathBuf>) -> anyhow::Result<()> {
    let report = run_experiment(&config)?;

    println!(
        "{:<12} {:>8} {:>8} {:>8} {:>8} {:>10}",
        "type", "sent", "caught", "missed", "false+", "detection"
    );
    for row in report.rows() {
        println!(
            "{:<12} {:>8} {:>8} {:>8} {:>8} {:>9.1}%",
            row.fault_type.as_str(),
            row.sent,
            row.caught,
            row.missed,
            row.false_positives,
            row.detection_rate * 100.0
        );
    }

    if let Some(path) = out {
        report
            .write_csv(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
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
        Commands::Fleet {
            url,
            devices,
            interval_ms,
            fault_percent,
        } => fleet(url, devices, interval_ms, fault_percent).await,
        Commands::Experiment {
            devices,
            ticks,
            seed,
            window_capacity,
            fault_percent,
            out,
        } => experiment(
            ExperimentConfig {
                devices,
                ticks,
                seed,
                correlation: CorrelationConfig {
                    window_capacity,
                    ..CorrelationConfig::default()
                },
                profile: DeviceProfile {
                    fault_percent,
                    ..DeviceProfile::default()
                },
            },
            out,
        ),
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "Fatal Error");
        std::process::exit(1);
    }
}
