//! AdBandit runner binary.
//!
//! Commands:
//! - `run` - continuous optimization engine against the configured store
//! - `simulate` - bounded-cycle paper run against the simulated platform
//! - `init-campaign` - seed a campaign and its arm grid from a TOML file

mod observability;
mod seed_campaign;
mod simulate;

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use adbandit_connectors::SimPlatform;
use adbandit_engine::{Engine, Supervisor};
use adbandit_models::EngineConfig;
use adbandit_store::PosteriorStore;

#[derive(Parser, Debug)]
#[command(name = "adbandit")]
#[command(about = "AdBandit - continuous ad budget optimization")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the continuous optimization engine
    Run {
        /// Path to the engine configuration file
        #[arg(short, long, default_value = "configs/engine.toml")]
        config: String,

        /// Register the simulated platform (paper mode)
        #[arg(long, default_value_t = false)]
        paper: bool,
    },

    /// Run a bounded simulation against the simulated ad platform
    Simulate {
        /// Number of decision cycles to run
        #[arg(long, default_value_t = 20)]
        cycles: u64,

        /// Total campaign budget (USD)
        #[arg(long, default_value_t = 5000.0)]
        budget: f64,

        /// RNG seed for the simulated environment
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },

    /// Create a campaign and its arm grid from a TOML file
    InitCampaign {
        /// Path to the campaign definition file
        #[arg(short, long, default_value = "configs/campaign.toml")]
        config: String,

        /// Engine configuration (for the database path)
        #[arg(long, default_value = "configs/engine.toml")]
        engine_config: String,
    },
}

/// Shared tokio runtime with a generous stack for decision cycles.
fn create_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("failed to create runtime: {e}"))
}

fn load_config(path: &str) -> EngineConfig {
    match EngineConfig::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(path, error = %e, "config not loaded, using defaults");
            EngineConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guards = observability::init_tracing("adbandit");
    let rt = create_runtime()?;
    rt.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run { config, paper } => run_engine(&config, paper).await,
        Commands::Simulate {
            cycles,
            budget,
            seed,
        } => simulate::run(cycles, budget, seed).await,
        Commands::InitCampaign {
            config,
            engine_config,
        } => seed_campaign::run(&config, &engine_config),
    }
}

async fn run_engine(config_path: &str, paper: bool) -> anyhow::Result<()> {
    let cfg = load_config(config_path);
    info!(db = %cfg.db_path, "starting optimization engine");

    let store = Arc::new(PosteriorStore::open_with_timeout(
        &cfg.db_path,
        cfg.write_timeout(),
    )?);
    let mut engine = Engine::new(cfg, store);
    if paper {
        engine.register_platform(Arc::new(SimPlatform::new("sim", 42, 100_000)));
        info!("paper mode: simulated platform registered");
    }

    info!("press Ctrl+C to stop");
    Supervisor::new(Arc::new(engine)).run().await
}
