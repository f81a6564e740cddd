//! modelgated — the modelgate release controller daemon.
//!
//! Single binary that assembles every subsystem:
//! - State store (redb)
//! - Version monitor (file or HTTP feed)
//! - Benchmark runner (HTTP model adapters)
//! - Release controller + traffic router
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! modelgated serve --config /etc/modelgate/modelgate.toml
//! modelgated check-config --config /etc/modelgate/modelgate.toml
//! modelgated report --data-dir /var/lib/modelgate --slot image-generation
//! ```

mod daemon;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use modelgate_core::ControllerConfig;

#[derive(Parser)]
#[command(name = "modelgated", about = "Quality-gated model release controller")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller, version monitor, and API server.
    Serve {
        /// Path to modelgate.toml.
        #[arg(long, default_value = "/etc/modelgate/modelgate.toml")]
        config: PathBuf,
    },

    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long, default_value = "/etc/modelgate/modelgate.toml")]
        config: PathBuf,
    },

    /// Print the markdown quality report for one slot from a data directory.
    Report {
        #[arg(long, default_value = "/var/lib/modelgate")]
        data_dir: PathBuf,

        #[arg(long)]
        slot: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve { config } => {
            let config = ControllerConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            daemon::run_serve(config).await
        }
        Command::CheckConfig { config } => check_config(&config),
        Command::Report { data_dir, slot } => report(&data_dir, &slot),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,modelgated=debug,modelgate=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn check_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = ControllerConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    println!("{}: ok", path.display());
    println!("  listen:   {}", config.controller.listen);
    println!("  data_dir: {}", config.controller.data_dir.display());
    for slot in &config.slots {
        println!(
            "  slot {} ({}): split={} ab={}s window={}s endpoint={}",
            slot.slot_id,
            slot.slot_type,
            slot.ab_test.traffic_split,
            slot.ab_test.duration_secs,
            slot.rollback.window_secs,
            slot.model_endpoint.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn report(data_dir: &std::path::Path, slot_id: &str) -> anyhow::Result<()> {
    let store = modelgate_state::StateStore::open(&daemon::db_path(data_dir))?;
    let slot = store
        .get_slot(slot_id)?
        .with_context(|| format!("slot {slot_id} not found in {}", data_dir.display()))?;
    let history = store.list_versions(slot_id)?;
    print!("{}", modelgate_metrics::render_report(&slot, &history));
    Ok(())
}
