use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use wealthpath::api::{SimulatePayload, build_simulation_request};
use wealthpath::core::SimulationEngine;

#[derive(Parser, Debug)]
#[command(
    name = "wealthpath",
    about = "Dual-path Monte Carlo savings-goal projection engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API server.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one simulation from a JSON payload file and print the output.
    Simulate {
        #[arg(long)]
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port } => {
            if let Err(e) = wealthpath::api::run_http_server(port).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Simulate { input } => {
            if let Err(e) = run_one_shot(&input) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn run_one_shot(path: &Path) -> Result<(), String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let payload: SimulatePayload =
        serde_json::from_str(&raw).map_err(|e| format!("invalid payload JSON: {e}"))?;
    let request = build_simulation_request(payload)?;

    let engine = SimulationEngine::new();
    let output = engine
        .simulate(&request.user_id, &request.input)
        .map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&output).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}
