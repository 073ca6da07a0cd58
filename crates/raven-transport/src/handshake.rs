//! Handshake between a coordinator and a worker.
//!
//! The coordinator sends [`HANDSHAKE_MAGIC`]; a worker answers
//! [`HANDSHAKE_ACCEPT`] and then, unprompted, its [`NodeInfo`] as a JSON
//! frame. Only after that frame is acked may commands flow.

use raven_core::NodeInfo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    framing::{Connection, TransportError},
    protocol::{BufferSize, HANDSHAKE_ACCEPT, HANDSHAKE_MAGIC, SessionState},
};

/// Handshake error. The connection is unusable afterwards.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Invalid magic data: {0:?}")]
    BadMagic(String),
    #[error("Peer is not a raven node (replied {0:?})")]
    NotAWorker(String),
    #[error("Peer closed the connection during the handshake")]
    Closed,
    #[error("Worker descriptor was not acknowledged")]
    Unacknowledged,
    #[error("Handshake not allowed in state {0:?}")]
    InvalidState(SessionState),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Coordinator side: prove we speak the protocol and learn who the worker is.
    ///
    /// # Errors
    /// Returns error if the peer does not answer with the accept literal,
    /// closes, or sends an undecodable descriptor.
    pub async fn request_handshake(&mut self) -> Result<NodeInfo, HandshakeError> {
        self.begin_handshake()?;
        self.write_all(HANDSHAKE_MAGIC).await?;

        let reply = match self.receive_literal(HANDSHAKE_ACCEPT).await {
            Ok(reply) => reply,
            Err(TransportError::ConnectionClosed) => return Err(self.fail(HandshakeError::Closed)),
            Err(e) => return Err(self.fail(e.into())),
        };
        if &reply[..] != HANDSHAKE_ACCEPT {
            let reply = String::from_utf8_lossy(&reply).into_owned();
            return Err(self.fail(HandshakeError::NotAWorker(reply)));
        }

        let info = match self.receive_json_as::<NodeInfo>().await {
            Ok(info) => info,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.state = SessionState::Ready;
        Ok(info)
    }

    /// Worker side: check the magic, accept, and announce `info`.
    ///
    /// # Errors
    /// Returns error on a missing or wrong magic, or if the descriptor frame
    /// is not acknowledged.
    pub async fn accept_handshake(&mut self, info: &NodeInfo) -> Result<(), HandshakeError> {
        self.begin_handshake()?;

        let magic = self.receive_once(BufferSize::Small).await?;
        if magic.is_empty() {
            return Err(self.fail(HandshakeError::Closed));
        }
        if &magic[..] != HANDSHAKE_MAGIC {
            let magic = String::from_utf8_lossy(&magic).into_owned();
            return Err(self.fail(HandshakeError::BadMagic(magic)));
        }

        self.write_all(HANDSHAKE_ACCEPT).await?;
        let delivery = self.send_json(info).await?;
        if !delivery.is_confirmed() {
            return Err(self.fail(HandshakeError::Unacknowledged));
        }

        self.state = SessionState::Ready;
        Ok(())
    }

    fn begin_handshake(&mut self) -> Result<(), HandshakeError> {
        if self.state != SessionState::Unestablished {
            return Err(HandshakeError::InvalidState(self.state));
        }
        self.state = SessionState::Handshaking;
        Ok(())
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeError {
        self.state = SessionState::Closed;
        err
    }
}
