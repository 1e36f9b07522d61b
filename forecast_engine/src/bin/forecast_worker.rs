//! Worker process: one training job as JSON on stdin, the outcome as JSON on
//! stdout. Logs go to stderr.

use clap::Parser;
use forecast_engine::{
    DataRecord, EngineConfig, FileArtifactStore, ForecastError, Result, TrainingEngine,
    TrainingRequest,
};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forecast_worker")]
#[command(about = "Train a forecasting model from a JSON job", long_about = None)]
struct Cli {
    /// Engine configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to store the trained model in
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Read the job from a file instead of stdin
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Increase log detail (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("FORECAST_ENGINE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Accepts `{"request": {...}, "data": [...]}` or the request fields at the
/// top level next to `"data"`
fn parse_job(raw: &str) -> Result<(TrainingRequest, Vec<DataRecord>)> {
    let invalid = |e: serde_json::Error| ForecastError::validation("request", e.to_string());

    let mut job: Value = serde_json::from_str(raw).map_err(invalid)?;
    let fields = job
        .as_object_mut()
        .ok_or_else(|| ForecastError::validation("request", "job must be a JSON object"))?;
    let data = fields
        .remove("data")
        .ok_or_else(|| ForecastError::validation("data", "job has no \"data\" array"))?;
    let request = fields.remove("request").unwrap_or(job);

    let records: Vec<DataRecord> =
        serde_json::from_value(data).map_err(|e| ForecastError::validation("data", e.to_string()))?;
    let request: TrainingRequest = serde_json::from_value(request).map_err(invalid)?;
    Ok((request, records))
}

fn run(cli: &Cli) -> Result<Value> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let mut engine = TrainingEngine::new(config)?;
    if let Some(dir) = &cli.models_dir {
        engine = engine.with_store(Arc::new(FileArtifactStore::open(dir)?));
    }

    let raw = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut raw = String::new();
            io::stdin().read_to_string(&mut raw)?;
            raw
        }
    };
    let (request, records) = parse_job(&raw)?;
    debug!("Parsed job with {} records", records.len());

    let outcome = engine.train(&request, &records)?;
    Ok(serde_json::to_value(&outcome)?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(outcome) => {
            println!("{}", outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            let body = json!({
                "error": {
                    "kind": e.kind(),
                    "message": e.to_string(),
                    "status": e.http_status(),
                }
            });
            println!("{}", body);
            ExitCode::FAILURE
        }
    }
}
