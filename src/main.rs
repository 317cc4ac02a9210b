use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fire_sim::api::{self, SimulationMode};
use fire_sim::core::{
    DEFAULT_DATA_DIR, HistoricalDataLoader, RunOptions, Simulator, TaxRegistry,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fire-sim",
    about = "Retirement portfolio simulator (historical bootstrap and Monte Carlo)"
)]
struct Cli {
    /// Root of the historical series (stocks/, bonds/, inflation/).
    #[arg(long, global = true, env = "FIRE_SIM_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one simulation from a JSON config file and print the result.
    Run {
        #[arg(long, value_enum, default_value_t = SimulationMode::Withdrawal)]
        mode: SimulationMode,
        #[arg(long)]
        config: PathBuf,
        /// Overrides the master seed in the config.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        sequential: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let taxes = match TaxRegistry::embedded() {
        Ok(taxes) => Arc::new(taxes),
        Err(e) => {
            error!(error = %e, "tax tables failed to load");
            process::exit(1);
        }
    };
    let loader = Arc::new(HistoricalDataLoader::new(cli.data_dir));
    info!(data_dir = %loader.root().display(), "historical data directory");

    match cli.command {
        Command::Serve { port } => {
            let sim = Simulator::new(loader, taxes);
            if let Err(e) = api::run_http_server(port, sim).await {
                error!(error = %e, "server error");
                process::exit(1);
            }
        }
        Command::Run {
            mode,
            config,
            seed,
            sequential,
        } => {
            let sim = Simulator::new(loader, taxes).with_options(RunOptions {
                parallel: !sequential,
                ..RunOptions::default()
            });
            match run_file(&sim, mode, &config, seed) {
                Ok(output) => println!("{output}"),
                Err(msg) => {
                    error!("{msg}");
                    process::exit(1);
                }
            }
        }
    }
}

fn run_file(
    sim: &Simulator,
    mode: SimulationMode,
    path: &Path,
    seed: Option<u64>,
) -> Result<String, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let mut body: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| format!("invalid JSON in {}: {e}", path.display()))?;
    if let (Some(seed), Some(object)) = (seed, body.as_object_mut()) {
        object.insert("seed".to_string(), seed.into());
    }
    let result = api::run_mode(sim, mode, body).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&result).map_err(|e| format!("failed to encode result: {e}"))
}
