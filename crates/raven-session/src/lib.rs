//! Raven sessions: the worker server and the coordinator client.
//!
//! Provides:
//! - `Worker` - accept coordinators and serve `<push>`, `<json>` and `<exec>`
//! - `Coordinator` / `RavenClient` - dial workers and drive a session
//! - Worker registry implementations (memory, JSON file)
//! - Configuration for both sides

pub mod config;
pub mod coordinator;
pub mod storage;
pub mod worker;

use std::path::PathBuf;

use raven_core::RegistryError;
use raven_transport::{HandshakeError, SessionState, TransportError};

pub use config::{ConfigError, CoordinatorConfig, WorkerConfig};
pub use coordinator::{Coordinator, RavenClient};
pub use storage::{JsonFileRegistry, MemoryRegistry};
pub use worker::{Acceptor, SessionStats, Worker, WorkerSession};

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Couldn't connect to raven://{host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: TransportError,
    },
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Session is not ready (state: {0:?})")]
    NotReady(SessionState),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("No usable file name in {0}")]
    InvalidPath(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
