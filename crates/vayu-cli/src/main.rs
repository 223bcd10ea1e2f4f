use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use vayu_core::model::RunConfig;

const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:9876";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "vayu")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Command-line client for a running vayu-engine instance")]
struct Cli {
    /// Base URL of the running engine's control plane
    #[arg(long, env = "VAYU_ENGINE_URL", default_value = DEFAULT_ENGINE_URL)]
    engine_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a load-test config file to the engine and wait for it to finish
    Run {
        /// Path to a JSON run config matching the engine's `/run` body
        file: PathBuf,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("engine unreachable at {0}: {1}")]
    EngineUnreachable(String, reqwest::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidInput(_) => 1,
            CliError::EngineUnreachable(..) => 2,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "vayu_cli=info".into())).init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::Run { file } => run_command(&client, &cli.engine_url, file).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(e.exit_code());
    }
}

async fn run_command(client: &reqwest::Client, engine_url: &str, file: &PathBuf) -> Result<(), CliError> {
    let raw = std::fs::read_to_string(file).map_err(|e| CliError::InvalidInput(format!("reading {}: {e}", file.display())))?;
    let config: RunConfig = serde_json::from_str(&raw).map_err(|e| CliError::InvalidInput(format!("parsing {}: {e}", file.display())))?;

    let start_url = format!("{engine_url}/run");
    let started: serde_json::Value = client
        .post(&start_url)
        .json(&config)
        .send()
        .await
        .map_err(|e| CliError::EngineUnreachable(start_url.clone(), e))?
        .json()
        .await
        .map_err(|e| CliError::EngineUnreachable(start_url, e))?;

    let run_id = started["runId"].as_str().ok_or_else(|| CliError::InvalidInput("engine response missing runId".to_string()))?;
    info!(run_id, "run started");

    let status_url = format!("{engine_url}/run/{run_id}");
    loop {
        let status: serde_json::Value = client
            .get(&status_url)
            .send()
            .await
            .map_err(|e| CliError::EngineUnreachable(status_url.clone(), e))?
            .json()
            .await
            .map_err(|e| CliError::EngineUnreachable(status_url.clone(), e))?;

        let current = status["status"].as_str().unwrap_or("unknown");
        println!("status: {current}");

        if matches!(current, "completed" | "stopped" | "failed") {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    let report_url = format!("{engine_url}/run/{run_id}/report");
    let report: serde_json::Value = client
        .get(&report_url)
        .send()
        .await
        .map_err(|e| CliError::EngineUnreachable(report_url.clone(), e))?
        .json()
        .await
        .map_err(|e| CliError::EngineUnreachable(report_url, e))?;

    println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    Ok(())
}
