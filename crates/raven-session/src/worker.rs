//! Worker side: accept coordinators and serve their commands.

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use raven_core::{ExecutionRequest, ExecutionResult, NodeInfo};
use raven_executor::ScriptRegistry;
use raven_transport::{BufferSize, Command, CommandError, Connection, SessionState};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::{JoinError, JoinSet},
};
use tracing::Instrument;
use uuid::Uuid;

use crate::{SessionError, config::WorkerConfig};

/// Pause after a failed accept, so a full descriptor table does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Source of incoming coordinator connections.
#[async_trait]
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next coordinator.
    async fn next_connection(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn next_connection(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(%peer, "Failed to set TCP_NODELAY: {e}");
        }
        Ok((stream, peer))
    }
}

fn reap(finished: &Result<(), JoinError>) {
    if let Err(e) = finished {
        tracing::error!("Session task failed: {e}");
    }
}

/// Counters for one coordinator session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub files_received: usize,
    pub json_frames: usize,
    pub executions: usize,
    pub dropped_tokens: usize,
}

/// A raven worker: listens for coordinators and serves them.
#[derive(Clone)]
pub struct Worker {
    config: Arc<WorkerConfig>,
    scripts: Arc<ScriptRegistry>,
    node: Arc<NodeInfo>,
}

impl Worker {
    /// `node` is announced to every coordinator during the handshake.
    #[must_use]
    pub fn new(config: WorkerConfig, scripts: ScriptRegistry, node: NodeInfo) -> Self {
        Self {
            config: Arc::new(config),
            scripts: Arc::new(scripts),
            node: Arc::new(node),
        }
    }

    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Prepare the staging directory and bind the configured address.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the bind fails.
    pub async fn bind(&self) -> Result<TcpListener, SessionError> {
        self.config.prepare().await?;
        let listener = TcpListener::bind(self.config.bind).await?;
        tracing::info!(addr = %listener.local_addr()?, "Raven listening");
        Ok(listener)
    }

    /// Serve coordinators until the process ends.
    ///
    /// # Errors
    /// Currently never; accept failures are logged and retried.
    pub async fn serve<A: Acceptor>(&self, listener: A) -> Result<(), SessionError> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve coordinators until `shutdown` resolves.
    ///
    /// A session in progress when sessions are served one at a time is
    /// finished before the shutdown is observed. Concurrent sessions stop
    /// being accepted on shutdown and are waited for before returning.
    ///
    /// # Errors
    /// Currently never; accept failures are logged and retried.
    pub async fn serve_until<A: Acceptor>(
        &self,
        mut listener: A,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), SessionError> {
        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();
        loop {
            while let Some(finished) = sessions.try_join_next() {
                reap(&finished);
            }

            tracing::info!("Waiting for odin node...");
            let accepted = tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.next_connection() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            tracing::info!(%peer, "Connection established");

            if self.config.concurrent_sessions {
                let worker = self.clone();
                sessions.spawn(async move { worker.handle_connection(stream, peer).await });
            } else {
                self.handle_connection(stream, peer).await;
            }
        }

        drop(listener);
        tracing::info!(sessions = sessions.len(), "Shutting down");
        while let Some(finished) = sessions.join_next().await {
            reap(&finished);
        }
        Ok(())
    }

    /// Handshake with one coordinator and serve it until it disconnects.
    ///
    /// Failures are logged and stay confined to this connection.
    pub async fn handle_connection<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let span = tracing::info_span!("session", id = %Uuid::new_v4(), %peer);
        async {
            let mut conn = Connection::new(stream, self.config.frame);
            if let Err(e) = conn.accept_handshake(&self.node).await {
                tracing::error!("Magic verification FAILED: {e}");
                return;
            }
            tracing::info!("Magic verification successful");

            let session = WorkerSession::new(conn, Arc::clone(&self.scripts), self.config.staging_dir.clone());
            match session.run().await {
                Ok(stats) => tracing::warn!(?stats, "Odin node disconnected"),
                Err(e) => tracing::error!("Session ended: {e}"),
            }
        }
        .instrument(span)
        .await;
    }
}

/// Command loop over an established connection.
pub struct WorkerSession<S> {
    conn: Connection<S>,
    scripts: Arc<ScriptRegistry>,
    staging_dir: PathBuf,
    stats: SessionStats,
}

impl<S> WorkerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// `conn` must have completed the handshake.
    #[must_use]
    pub fn new(conn: Connection<S>, scripts: Arc<ScriptRegistry>, staging_dir: PathBuf) -> Self {
        Self {
            conn,
            scripts,
            staging_dir,
            stats: SessionStats::default(),
        }
    }

    /// Serve commands until the coordinator disconnects.
    ///
    /// Unknown or malformed tokens are logged and skipped.
    ///
    /// # Errors
    /// Returns error if the session was not established or the transport fails.
    pub async fn run(mut self) -> Result<SessionStats, SessionError> {
        if self.conn.state() != SessionState::Ready {
            return Err(SessionError::NotReady(self.conn.state()));
        }

        loop {
            let token = self.conn.receive_bytes(BufferSize::Small).await?;
            if token.is_empty() && self.conn.state() == SessionState::Closed {
                return Ok(self.stats);
            }

            let command = match Command::parse(&token) {
                Ok(command) => command,
                Err(CommandError::NotBracketed(raw)) => {
                    tracing::warn!(token = %raw, "Dropping malformed token");
                    self.stats.dropped_tokens += 1;
                    continue;
                }
                Err(CommandError::Unknown(name)) => {
                    tracing::error!("Invalid command {name}");
                    self.stats.dropped_tokens += 1;
                    continue;
                }
            };

            tracing::debug!(%command, "Received command");
            match command {
                Command::Push => self.handle_push().await?,
                Command::Json => self.handle_json().await?,
                Command::Exec => self.handle_exec().await?,
            }
        }
    }

    async fn handle_push(&mut self) -> Result<(), SessionError> {
        let file = self.conn.receive_file(&self.staging_dir).await?;
        tracing::info!(name = %file.name, size = file.size, "File received");
        self.stats.files_received += 1;
        Ok(())
    }

    async fn handle_json(&mut self) -> Result<(), SessionError> {
        let value = self.conn.receive_json().await?;
        tracing::info!(%value, "JSON received");
        self.stats.json_frames += 1;
        Ok(())
    }

    async fn handle_exec(&mut self) -> Result<(), SessionError> {
        let value = self.conn.receive_json().await?;
        let result = match request_from(value) {
            Ok(request) => {
                tracing::info!(script = %request.script, "Trying to execute");
                self.scripts.run(&request).await
            }
            Err(e) => {
                tracing::error!("Malformed execution request: {e}");
                ExecutionResult::failure(format!("Malformed execution request: {e}"), format!("Error: {e}"))
            }
        };

        let delivery = self.conn.send_json(&result.to_envelope()).await?;
        if !delivery.is_confirmed() {
            tracing::warn!(?delivery, "Execution result not confirmed");
        }
        self.stats.executions += 1;
        Ok(())
    }
}

fn request_from(value: Value) -> Result<ExecutionRequest, serde_json::Error> {
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use raven_core::{DeviceDescriptor, ExecutionError};
    use raven_transport::{AckHash, FrameOptions, Framing, TransportError};
    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
        sync::oneshot,
    };

    use super::*;

    fn worker(staging_dir: PathBuf) -> Worker {
        let node = NodeInfo::new("gpu1").with_device(DeviceDescriptor::new("GPU-A", "dev:0", 8));
        let mut scripts = ScriptRegistry::new();
        scripts.register_fn("add", raven_executor::builtins::add);
        scripts.register_fn("fail", |_, _| Err(ExecutionError::Failed("boom".to_string())));
        let config = WorkerConfig {
            staging_dir,
            ..WorkerConfig::default()
        };
        Worker::new(config, scripts, node)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    #[tokio::test]
    async fn test_session_over_duplex() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path().to_path_buf());
        let (client, server) = duplex(64 * 1024);
        let serving = tokio::spawn(async move { worker.handle_connection(server, peer()).await });

        let mut odin = Connection::new(client, FrameOptions::default());
        let info = odin.request_handshake().await.unwrap();
        assert_eq!(info.machine, "gpu1");

        odin.send_command(Command::Exec).await.unwrap();
        let delivery = odin.send_json(&ExecutionRequest::new("add").args([2, 3])).await.unwrap();
        assert!(delivery.is_confirmed());
        assert_eq!(odin.receive_json().await.unwrap(), json!({"status": "OK", "output": 5}));

        odin.send_command(Command::Exec).await.unwrap();
        let _ = odin.send_json(&ExecutionRequest::new("fail")).await.unwrap();
        let envelope = odin.receive_json().await.unwrap();
        assert_eq!(envelope["status"], "FAILED");
        assert_eq!(envelope["error"], "boom");

        odin.send_command(Command::Push).await.unwrap();
        let delivery = odin.send_file("weights.bin", b"abc", |_| {}).await.unwrap();
        assert!(delivery.is_confirmed());
        assert_eq!(std::fs::read(dir.path().join("weights.bin")).unwrap(), b"abc");

        odin.close().await.unwrap();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_becomes_failure() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path().to_path_buf());
        let (client, server) = duplex(64 * 1024);
        let serving = tokio::spawn(async move { worker.handle_connection(server, peer()).await });

        let mut odin = Connection::new(client, FrameOptions::default());
        odin.request_handshake().await.unwrap();
        odin.send_command(Command::Exec).await.unwrap();
        let _ = odin.send_json(&json!({"args": [1]})).await.unwrap();

        let result = ExecutionResult::from_envelope(odin.receive_json().await.unwrap());
        match result {
            ExecutionResult::Failure { error, .. } => assert!(error.starts_with("Malformed execution request")),
            ExecutionResult::Success { .. } => panic!("Expected failure"),
        }

        odin.close().await.unwrap();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_magic_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path().to_path_buf());
        let (mut client, server) = duplex(1024);
        let serving = tokio::spawn(async move { worker.handle_connection(server, peer()).await });

        client.write_all(b"hello").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_session_skips_unknown_commands() {
        let dir = tempfile::tempdir().unwrap();
        let info = NodeInfo::new("gpu1");
        let descriptor = serde_json::to_vec(&info).unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(b"huginn?muninn?")
            .write(b"<raven node>")
            .write(&descriptor)
            .read(AckHash::compute(&descriptor).as_bytes())
            .read(b"<frobnicate>")
            .read(b"no brackets")
            .read(b"<json>")
            .read(br#"{"a":1}"#)
            .write(AckHash::compute(br#"{"a":1}"#).as_bytes())
            .build();

        let mut conn = Connection::new(mock, FrameOptions::default().with_framing(Framing::ShortRead));
        conn.accept_handshake(&info).await.unwrap();

        let session = WorkerSession::new(conn, Arc::new(ScriptRegistry::new()), dir.path().to_path_buf());
        let stats = session.run().await.unwrap();
        assert_eq!(stats.dropped_tokens, 2);
        assert_eq!(stats.json_frames, 1);
    }

    #[tokio::test]
    async fn test_json_array_ends_session_without_ack() {
        let dir = tempfile::tempdir().unwrap();
        let info = NodeInfo::new("gpu1");
        let descriptor = serde_json::to_vec(&info).unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(b"huginn?muninn?")
            .write(b"<raven node>")
            .write(&descriptor)
            .read(AckHash::compute(&descriptor).as_bytes())
            .read(b"<json>")
            .read(b"[1,2,3]")
            .build();

        let mut conn = Connection::new(mock, FrameOptions::default().with_framing(Framing::ShortRead));
        conn.accept_handshake(&info).await.unwrap();

        let session = WorkerSession::new(conn, Arc::new(ScriptRegistry::new()), dir.path().to_path_buf());
        let err = session.run().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::NotAnObject("an array"))));
    }

    /// Hands out a fixed sequence of accept results, then waits forever.
    struct ScriptedAcceptor {
        accepts: VecDeque<io::Result<(DuplexStream, SocketAddr)>>,
    }

    #[async_trait]
    impl Acceptor for ScriptedAcceptor {
        type Stream = DuplexStream;

        async fn next_connection(&mut self) -> io::Result<(DuplexStream, SocketAddr)> {
            match self.accepts.pop_front() {
                Some(accepted) => accepted,
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn test_accept_error_keeps_listening() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(dir.path().to_path_buf());
        let (client, server) = duplex(64 * 1024);
        let acceptor = ScriptedAcceptor {
            accepts: VecDeque::from([
                Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                Err(io::Error::other("Too many open files")),
                Ok((server, peer())),
            ]),
        };
        let (shutdown, signal) = oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            worker
                .serve_until(acceptor, async {
                    let _ = signal.await;
                })
                .await
        });

        let mut odin = Connection::new(client, FrameOptions::default());
        odin.request_handshake().await.unwrap();
        odin.send_command(Command::Exec).await.unwrap();
        let _ = odin.send_json(&ExecutionRequest::new("add").args([2, 3])).await.unwrap();
        assert_eq!(odin.receive_json().await.unwrap(), json!({"status": "OK", "output": 5}));
        odin.close().await.unwrap();

        shutdown.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_requires_handshake() {
        let (_client, server) = duplex(64);
        let conn = Connection::new(server, FrameOptions::default());
        let session = WorkerSession::new(conn, Arc::new(ScriptRegistry::new()), PathBuf::from("."));
        assert!(matches!(session.run().await, Err(SessionError::NotReady(SessionState::Unestablished))));
    }
}
