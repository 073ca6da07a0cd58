//! Worker and coordinator configuration.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use raven_transport::{DEFAULT_PORT, FrameOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default registry location, relative to the coordinator's working directory.
pub const DEFAULT_REGISTRY_PATH: &str = ".odin/nodes.json";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Staging directory {0} is not a directory")]
    StagingNotDirectory(PathBuf),
    #[error("Frame limit must be greater than zero")]
    ZeroFrameLimit,
    #[error("I/O timeout must be greater than zero")]
    ZeroTimeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn validate_frame(frame: &FrameOptions) -> Result<(), ConfigError> {
    if frame.max_frame_bytes == 0 {
        return Err(ConfigError::ZeroFrameLimit);
    }
    if frame.io_timeout == Some(Duration::ZERO) {
        return Err(ConfigError::ZeroTimeout);
    }
    Ok(())
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address to listen on.
    pub bind: SocketAddr,
    /// Directory pushed files are written to and staged scripts run from.
    pub staging_dir: PathBuf,
    pub frame: FrameOptions,
    /// Serve each accepted connection on its own task instead of one at a time.
    pub concurrent_sessions: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            staging_dir: PathBuf::from("."),
            frame: FrameOptions::default(),
            concurrent_sessions: false,
        }
    }
}

impl WorkerConfig {
    /// Check the configuration and create the staging directory if needed.
    ///
    /// # Errors
    /// Returns error if the staging path is a file, a limit is zero, or the
    /// directory cannot be created.
    pub async fn prepare(&self) -> Result<(), ConfigError> {
        validate_frame(&self.frame)?;
        match tokio::fs::metadata(&self.staging_dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ConfigError::StagingNotDirectory(self.staging_dir.clone())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(&self.staging_dir).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Port workers listen on.
    pub port: u16,
    pub frame: FrameOptions,
    /// JSON file the worker registry is persisted to.
    pub registry_path: PathBuf,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            frame: FrameOptions::default(),
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
        }
    }
}

impl CoordinatorConfig {
    /// # Errors
    /// Returns error if a limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_frame(&self.frame)
    }
}
