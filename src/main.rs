//! onair: 24/7 composited live stream and its supervisor

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use onair::api::{self, ApiState};
use onair::engine::shutdown_signal;
use onair::supervisor::{StreamSupervisor, StreamTarget, SupervisorConfig};
use onair::Config;

#[derive(Parser)]
#[command(name = "onair", version, about = "Live stream compositor and supervisor")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the media graph (normally launched by `serve`)
    Stream,
    /// Run the supervisor and its control API
    Serve {
        /// Start streaming to the configured endpoint right away
        #[arg(long)]
        autostart: bool,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // The supervisor parses the stream subsystem's output; keep it plain.
    init_tracing(!matches!(cli.command, Commands::Stream));

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Stream => stream(config),
        Commands::Serve { autostart } => serve(config, cli.config, autostart),
    }
}

fn init_tracing(ansi: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("onair=info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_ansi(ansi)
        .with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    registry.with(tracing_tracy::TracyLayer::default()).init();
    #[cfg(not(feature = "profiling"))]
    registry.init();
}

#[cfg(feature = "gstreamer-pipeline")]
fn stream(config: Config) -> Result<()> {
    info!("onair stream subsystem launching");
    onair::engine::run_stream(config)
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn stream(_config: Config) -> Result<()> {
    Err(eyre!(
        "built without the gstreamer-pipeline feature; rebuild with --features gstreamer-pipeline"
    ))
}

fn serve(config: Config, config_path: Option<PathBuf>, autostart: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| eyre!("Failed to create runtime: {}", e))?;

    runtime.block_on(async move {
        info!("onair supervisor launching");
        let supervisor =
            StreamSupervisor::new(SupervisorConfig::from_config(&config, config_path.as_deref())?);

        if autostart {
            let output = &config.output;
            if output.primary.trim().is_empty() {
                warn!("Autostart requested but no primary endpoint configured");
            } else {
                let target = StreamTarget {
                    primary: output.primary.clone(),
                    backup: output.backup.clone(),
                    stream_key: output.stream_key.clone(),
                };
                supervisor.start(target).await?;
            }
        }

        let state = ApiState {
            supervisor: supervisor.clone(),
            defaults: config.output.clone(),
        };
        let result = api::serve(&config.api.bind, state, shutdown_signal()).await;

        supervisor.shutdown().await;
        info!("onair supervisor shutting down");
        result
    })
}
