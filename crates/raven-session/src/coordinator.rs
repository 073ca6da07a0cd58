//! Coordinator side: dial workers, remember them, and drive sessions.

use std::path::Path;

use raven_core::{ExecutionRequest, ExecutionResult, WorkerDescriptor, WorkerRegistry};
use raven_transport::{Command, Connection, Delivery, SessionState, TransferProgress, TransportError};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use crate::{SessionError, config::CoordinatorConfig};

/// Dials workers and records them in a registry.
pub struct Coordinator<R> {
    config: CoordinatorConfig,
    registry: R,
}

impl<R: WorkerRegistry> Coordinator<R> {
    #[must_use]
    pub fn new(config: CoordinatorConfig, registry: R) -> Self {
        Self { config, registry }
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Connect to a worker on the configured port.
    ///
    /// # Errors
    /// Returns error if the worker is unreachable or the handshake fails.
    pub async fn connect(&self, host: &str) -> Result<RavenClient<TcpStream>, SessionError> {
        self.connect_to(host, self.config.port).await
    }

    /// Connect to a worker, handshake, and record it in the registry.
    ///
    /// A registry write failure is logged; the session is still returned.
    ///
    /// # Errors
    /// Returns error if the worker is unreachable or the handshake fails.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<RavenClient<TcpStream>, SessionError> {
        tracing::info!("Connecting to raven://{host}:{port}");
        let conn = Connection::connect((host, port), self.config.frame)
            .await
            .map_err(|source| {
                tracing::error!("Couldn't connect to raven://{host}:{port}: {source}");
                SessionError::Connect {
                    host: host.to_string(),
                    port,
                    source,
                }
            })?;

        let client = RavenClient::handshake(conn, host).await?;
        if let Err(e) = self.registry.put(client.worker()).await {
            tracing::warn!(host, "Failed to record worker: {e}");
        }
        tracing::info!(machine = %client.worker().machine_name, "Connected to raven://{host}:{port}");
        Ok(client)
    }

    /// Reconnect to every worker in the registry.
    ///
    /// # Errors
    /// Returns error only if the registry cannot be read; per-host failures
    /// are returned alongside their host.
    pub async fn connect_known(
        &self,
    ) -> Result<Vec<(String, Result<RavenClient<TcpStream>, SessionError>)>, SessionError> {
        let mut sessions = Vec::new();
        for worker in self.registry.list().await? {
            let session = self.connect(&worker.host).await;
            sessions.push((worker.host, session));
        }
        Ok(sessions)
    }
}

/// An established session with one worker.
pub struct RavenClient<S> {
    conn: Connection<S>,
    worker: WorkerDescriptor,
}

impl<S> RavenClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handshake over a fresh connection to `host`.
    ///
    /// # Errors
    /// Returns error if the peer is not a raven worker.
    pub async fn handshake(mut conn: Connection<S>, host: &str) -> Result<Self, SessionError> {
        let info = conn.request_handshake().await?;
        Ok(Self {
            conn,
            worker: WorkerDescriptor::from_node_info(host, info),
        })
    }

    /// The worker as it described itself during the handshake.
    #[must_use]
    pub const fn worker(&self) -> &WorkerDescriptor {
        &self.worker
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.conn.state()
    }

    /// Push an in-memory buffer as `name` in the worker's staging directory.
    ///
    /// # Errors
    /// Returns error if the session is not ready or the transport fails.
    pub async fn push_bytes(&mut self, name: &str, data: &[u8]) -> Result<Delivery, SessionError> {
        self.push_bytes_with_progress(name, data, |_| {}).await
    }

    /// As [`Self::push_bytes`], reporting progress after every chunk.
    ///
    /// A stalled or rejected transfer leaves the stream mid-frame, so the
    /// session is closed afterwards.
    ///
    /// # Errors
    /// Returns error if the session is not ready or the transport fails.
    pub async fn push_bytes_with_progress<P>(
        &mut self,
        name: &str,
        data: &[u8],
        progress: P,
    ) -> Result<Delivery, SessionError>
    where
        P: FnMut(TransferProgress),
    {
        self.ensure_ready()?;
        self.conn.check_frame_size(name.len())?;

        let sent = async {
            self.conn.send_command(Command::Push).await?;
            self.conn.send_file(name, data, progress).await
        }
        .await;
        let delivery = self.abandon_on_error(sent)?;

        match &delivery {
            Delivery::Confirmed(_) => tracing::info!(name, size = data.len(), "File pushed"),
            other => {
                tracing::error!(name, delivery = ?other, "File push failed");
                self.conn.abandon();
            }
        }
        Ok(delivery)
    }

    /// Push a local file. It is stored under `target`, or its own file name.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or has no usable name, the
    /// session is not ready, or the transport fails.
    pub async fn push_file<P>(&mut self, path: &Path, target: Option<&str>, progress: P) -> Result<Delivery, SessionError>
    where
        P: FnMut(TransferProgress),
    {
        let name = match target {
            Some(target) => target.to_string(),
            None => path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| SessionError::InvalidPath(path.to_path_buf()))?
                .to_string(),
        };
        let data = tokio::fs::read(path).await?;
        self.push_bytes_with_progress(&name, &data, progress).await
    }

    /// Send a JSON object for the worker to log.
    ///
    /// # Errors
    /// Returns error if the session is not ready, the value is not an object
    /// or does not fit in a frame, or the transport fails.
    pub async fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Delivery, SessionError> {
        self.ensure_ready()?;
        let payload = self.prepare_json(value)?;

        let sent = async {
            self.conn.send_command(Command::Json).await?;
            self.conn.send_json_bytes(&payload).await
        }
        .await;
        self.abandon_on_error(sent)
    }

    /// Run a routine on the worker and wait for its result.
    ///
    /// A routine failure comes back as [`ExecutionResult::Failure`], not an error.
    ///
    /// # Errors
    /// Returns error if the session is not ready, the request does not fit
    /// in a frame, or the transport fails.
    pub async fn exec(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult, SessionError> {
        self.ensure_ready()?;
        let payload = self.prepare_json(request)?;
        tracing::info!(script = %request.script, "Trying to execute");

        let exchanged = async {
            self.conn.send_command(Command::Exec).await?;
            let delivery = self.conn.send_json_bytes(&payload).await?;
            if !delivery.is_confirmed() {
                tracing::warn!(?delivery, "Execution request not confirmed");
            }
            self.conn.receive_json().await
        }
        .await;
        let result = ExecutionResult::from_envelope(self.abandon_on_error(exchanged)?);

        match &result {
            ExecutionResult::Success { .. } => tracing::info!(script = %request.script, "Execution complete"),
            ExecutionResult::Failure { error, trace } => {
                tracing::error!(script = %request.script, %error, "Failed to execute");
                tracing::debug!("{trace}");
            }
        }
        Ok(result)
    }

    /// Send a raw token in place of a command.
    ///
    /// Workers log and skip anything they do not recognise.
    ///
    /// # Errors
    /// Returns error if the session is not ready or the write fails.
    pub async fn send_token(&mut self, token: &[u8]) -> Result<(), SessionError> {
        self.ensure_ready()?;
        self.conn.check_frame_size(token.len())?;
        let sent = self.conn.send_bytes(token).await;
        self.abandon_on_error(sent)
    }

    /// End the session.
    ///
    /// # Errors
    /// Returns error if the shutdown fails.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.conn.close().await?;
        tracing::info!(host = %self.worker.host, "Session closed");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.conn.state() {
            SessionState::Ready => Ok(()),
            state => Err(SessionError::NotReady(state)),
        }
    }

    /// Serialize and check a JSON payload before its command token goes out.
    fn prepare_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, SessionError> {
        let payload = serde_json::to_vec(value).map_err(TransportError::from)?;
        // Compact output starts with `{` exactly when it is an object.
        if payload.first() != Some(&b'{') {
            return Err(TransportError::NotAnObject("a non-object value").into());
        }
        self.conn.check_frame_size(payload.len())?;
        Ok(payload)
    }

    /// A transport error part way through an exchange leaves the stream at
    /// an unknown offset; nothing after it can be framed.
    fn abandon_on_error<T>(&mut self, result: Result<T, TransportError>) -> Result<T, SessionError> {
        result.map_err(|e| {
            tracing::error!(host = %self.worker.host, "Session abandoned: {e}");
            self.conn.abandon();
            e.into()
        })
    }
}
