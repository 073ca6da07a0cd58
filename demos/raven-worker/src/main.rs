//! Raven worker.
//!
//! Run with: cargo run -p raven-worker -- --device "GPU-A:dev:0:8589934592"
//!
//! Then point odin at this host: `cargo run -p odin -- probe 127.0.0.1`.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use raven_core::{DeviceDescriptor, DeviceProbe, NodeInfo, StaticProbe};
use raven_executor::{CommandBuilder, ScriptRegistry, StagedScripts};
use raven_session::{Worker, WorkerConfig};
use raven_transport::{FrameOptions, Framing, framing::DEFAULT_MAX_FRAME_BYTES};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "raven-worker")]
#[command(about = "Serve raven coordinators: file pushes, JSON frames and remote execution")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "RAVEN_BIND", default_value = "0.0.0.0:4269")]
    bind: SocketAddr,

    /// Directory pushed files are written to
    #[arg(long, env = "RAVEN_STAGING_DIR", default_value = ".")]
    staging_dir: PathBuf,

    /// Wire framing: length-prefixed or short-read
    #[arg(long, env = "RAVEN_FRAMING", default_value = "length-prefixed")]
    framing: Framing,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,

    /// Per read/write timeout in seconds
    #[arg(long)]
    io_timeout: Option<u64>,

    /// Serve every coordinator on its own task
    #[arg(long)]
    concurrent: bool,

    /// Machine name announced to coordinators
    #[arg(long, env = "HOSTNAME", default_value = "raven")]
    machine: String,

    /// Device as name:int_name:memory_bytes (repeatable)
    #[arg(long = "device", value_parser = parse_device)]
    devices: Vec<DeviceDescriptor>,

    /// Run pushed scripts through this interpreter, e.g. "python3 -u"
    #[arg(long)]
    interpreter: Option<String>,

    /// Extension appended to script names when looking up pushed scripts
    #[arg(long, default_value = "py")]
    script_extension: String,
}

/// Parse `name:int_name:memory`. The internal name may itself contain colons.
fn parse_device(raw: &str) -> Result<DeviceDescriptor, String> {
    let (rest, memory) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected name:int_name:memory, got {raw:?}"))?;
    let (name, internal_name) = rest
        .split_once(':')
        .ok_or_else(|| format!("expected name:int_name:memory, got {raw:?}"))?;
    let memory = memory
        .parse::<u64>()
        .map_err(|e| format!("invalid memory {memory:?}: {e}"))?;
    Ok(DeviceDescriptor::new(name, internal_name, memory))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let node = args
        .devices
        .iter()
        .cloned()
        .fold(NodeInfo::new(&args.machine), NodeInfo::with_device);
    let probe: Arc<dyn DeviceProbe> = Arc::new(StaticProbe::new(node));

    let mut scripts = ScriptRegistry::with_builtins(Arc::clone(&probe));
    if let Some(interpreter) = &args.interpreter {
        let staged = StagedScripts::new(&args.staging_dir, CommandBuilder::new(interpreter.as_str()))
            .with_extension(args.script_extension.as_str());
        scripts.enable_staged(staged);
        tracing::info!(%interpreter, "Staged scripts enabled");
    }
    tracing::info!(routines = ?scripts.names(), "Routines registered");

    let config = WorkerConfig {
        bind: args.bind,
        staging_dir: args.staging_dir,
        frame: FrameOptions::default()
            .with_framing(args.framing)
            .with_max_frame_bytes(args.max_frame_bytes)
            .with_io_timeout(args.io_timeout.map(Duration::from_secs)),
        concurrent_sessions: args.concurrent,
    };

    let worker = Worker::new(config, scripts, probe.probe());
    let listener = worker.bind().await.context("failed to start worker")?;
    worker
        .serve_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        let device = parse_device("GPU-A:dev:0:8589934592").unwrap();
        assert_eq!(device, DeviceDescriptor::new("GPU-A", "dev:0", 8_589_934_592));
    }

    #[test]
    fn test_parse_device_rejects_bad_memory() {
        assert!(parse_device("GPU-A:dev0:lots").is_err());
        assert!(parse_device("GPU-A").is_err());
        assert!(parse_device("8").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["raven-worker", "--device", "CPU:cpu:1024", "--framing", "short-read"]).unwrap();
        assert_eq!(args.devices.len(), 1);
        assert_eq!(args.framing, Framing::ShortRead);
        assert_eq!(args.bind.port(), 4269);
    }
}
