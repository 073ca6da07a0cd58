//! Odin: the raven coordinator.
//!
//! Run with: cargo run -p odin -- exec 10.0.0.5 add --arg 2 --arg 3

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use raven_core::{ExecutionRequest, ExecutionResult, WorkerRegistry};
use raven_session::{Coordinator, CoordinatorConfig, JsonFileRegistry, config::DEFAULT_REGISTRY_PATH};
use raven_transport::{DEFAULT_PORT, FrameOptions, Framing};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "odin")]
#[command(about = "Coordinate raven workers: probe, push files, run routines")]
struct Cli {
    /// Port workers listen on
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Where known workers are recorded
    #[arg(long, global = true, env = "ODIN_REGISTRY", default_value = DEFAULT_REGISTRY_PATH)]
    registry: PathBuf,

    /// Wire framing: length-prefixed or short-read
    #[arg(long, global = true, env = "RAVEN_FRAMING", default_value = "length-prefixed")]
    framing: Framing,

    /// Per read/write timeout in seconds
    #[arg(long, global = true)]
    io_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handshake with a worker and print what it reports
    Probe { host: String },
    /// List workers recorded in the registry
    Nodes,
    /// Push a file into a worker's staging directory
    Push {
        host: String,
        file: PathBuf,
        /// Name to store the file under (defaults to the file's own name)
        #[arg(long)]
        target: Option<String>,
    },
    /// Run a routine on a worker
    Exec {
        host: String,
        script: String,
        /// Positional argument as JSON; bare words are sent as strings (repeatable)
        #[arg(long = "arg", value_parser = parse_json_arg)]
        args: Vec<Value>,
        /// Keyword argument as key=JSON (repeatable)
        #[arg(long = "kwarg", value_parser = parse_kwarg)]
        kwargs: Vec<(String, Value)>,
    },
    /// Send a JSON value for the worker to log
    Echo {
        host: String,
        #[arg(value_parser = parse_json_arg)]
        json: Value,
    },
}

fn parse_json_arg(raw: &str) -> Result<Value, String> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    Ok((key.to_string(), parse_json_arg(value)?))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = CoordinatorConfig {
        port: cli.port,
        frame: FrameOptions::default()
            .with_framing(cli.framing)
            .with_io_timeout(cli.io_timeout.map(Duration::from_secs)),
        registry_path: cli.registry.clone(),
    };
    config.validate()?;
    let coordinator = Coordinator::new(config, JsonFileRegistry::new(cli.registry));

    match cli.command {
        Commands::Probe { host } => {
            let client = coordinator.connect(&host).await?;
            println!("{}", serde_json::to_string_pretty(client.worker())?);
            client.close().await?;
        }
        Commands::Nodes => {
            for worker in coordinator.registry().list().await? {
                println!(
                    "{}\t{}\t{} device(s)\t{} bytes",
                    worker.host,
                    worker.machine_name,
                    worker.devices.len(),
                    worker.total_memory()
                );
            }
        }
        Commands::Push { host, file, target } => {
            let mut client = coordinator.connect(&host).await?;
            let delivery = client
                .push_file(&file, target.as_deref(), |p| {
                    tracing::debug!(sent = p.bytes_sent, total = p.total_bytes, "{:.0}%", p.fraction() * 100.0);
                })
                .await
                .with_context(|| format!("failed to push {}", file.display()))?;
            client.close().await?;
            if !delivery.is_confirmed() {
                bail!("push of {} was not confirmed: {delivery:?}", file.display());
            }
        }
        Commands::Exec {
            host,
            script,
            args,
            kwargs,
        } => {
            let mut request = ExecutionRequest::new(script).args(args);
            for (key, value) in kwargs {
                request = request.kwarg(key, value);
            }

            let mut client = coordinator.connect(&host).await?;
            let result = client.exec(&request).await?;
            client.close().await?;

            println!("{}", serde_json::to_string_pretty(&result.to_envelope())?);
            if let ExecutionResult::Failure { .. } = result {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Echo { host, json } => {
            let mut client = coordinator.connect(&host).await?;
            let delivery = client.send_json(&json).await?;
            client.close().await?;
            if !delivery.is_confirmed() {
                bail!("JSON frame was not confirmed: {delivery:?}");
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
