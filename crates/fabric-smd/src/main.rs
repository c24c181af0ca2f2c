//! Fabric subnet manager daemon entry point.
//!
//! Loads the configuration, applies command line overrides, and runs the
//! sweep scheduler until interrupted or a fatal topology desync.

use anyhow::{bail, Context};
use clap::Parser;
use fabric_sm_types::Guid;
use fabric_smd::{load_topology, Overrides, SmDaemon, SmdConfig, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Fabric subnet manager
#[derive(Parser, Debug)]
#[command(name = "fabric-smd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Port GUID to bind to
    #[arg(short = 'g', long)]
    guid: Option<Guid>,

    /// Manager priority (0-15)
    #[arg(short = 'p', long)]
    priority: Option<u8>,

    /// Seconds between light sweeps, 0 disables them
    #[arg(short = 's', long)]
    sweep_interval: Option<u64>,

    /// Reassign every LID on each heavy master sweep
    #[arg(short = 'r', long)]
    reassign_lids: bool,

    /// Honor LIDs saved in the guid2lid file
    #[arg(long)]
    honor_guid2lid: bool,

    /// Where GUID to LID bindings are saved
    #[arg(long)]
    guid2lid_file: Option<PathBuf>,

    /// Serve probes from a JSON topology instead of hardware
    #[arg(long, value_name = "TOPOLOGY_JSON")]
    simulate: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Bring the subnet up, then exit
    #[arg(long)]
    once: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            guid: self.guid,
            priority: self.priority,
            sweep_interval_secs: self.sweep_interval,
            reassign_lids: self.reassign_lids,
            honor_guid2lid: self.honor_guid2lid,
            guid2lid_file: self.guid2lid_file.clone(),
            topology: self.simulate.clone(),
        }
    }
}

/// Structured logging; `RUST_LOG` takes precedence over `--log-level`.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = SmdConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply(&args.overrides());

    let Some(topology) = config.daemon.topology.clone() else {
        bail!("no probe transport configured: pass --simulate or set daemon.topology");
    };
    let fabric = Arc::new(load_topology(&topology)?);
    info!(topology = %topology.display(), "serving probes from simulated fabric");

    let mut daemon = SmDaemon::new(&config, fabric)?;

    if args.once {
        let reports = daemon.run_once().await?;
        let subnet = daemon.subnet();
        let subnet = subnet.lock().await;
        info!(
            cycles = reports.len(),
            state = %subnet.state(),
            ports = subnet.lid_bindings().len(),
            "one-shot run complete"
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    warn!("Received SIGINT, shutting down gracefully...");
                    cancel.cancel();
                }
                Err(err) => error!(error = %err, "Failed to listen for ctrl-c"),
            }
        })
    };

    let result = daemon.run(cancel).await;
    shutdown.abort();
    daemon.subnet().lock().await.shutdown();
    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("fabric-smd: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting fabric subnet manager");
    match run(args).await {
        Ok(()) => {
            info!("fabric subnet manager stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "fabric subnet manager failed");
            ExitCode::FAILURE
        }
    }
}
