//! File transfer: a named blob followed by the `OK` completion token.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use raven_core::staged_path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    ack::AckHash,
    framing::{Connection, Delivery, Framing, TransportError},
    protocol::{ACK_HASH_LEN, BufferSize, SessionState, TRANSFER_OK},
};

/// Progress of an outgoing file, reported after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
}

impl TransferProgress {
    /// Completed fraction in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_sent as f64 / self.total_bytes as f64
        }
    }
}

/// A file stored by [`Connection::receive_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name as sent by the coordinator.
    pub name: String,
    /// Where it was written.
    pub path: PathBuf,
    pub size: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send `data` to be stored under `name`.
    ///
    /// The caller sends the `<push>` token first. `progress` is called after
    /// every chunk.
    ///
    /// # Errors
    /// Returns error on I/O failure. A stalled write or a reply other than
    /// `OK` is reported through [`Delivery`].
    pub async fn send_file<P>(&mut self, name: &str, data: &[u8], mut progress: P) -> Result<Delivery, TransportError>
    where
        P: FnMut(TransferProgress),
    {
        self.send_bytes(name.as_bytes()).await?;
        // Receiver's hash of the name; confirms it parsed the name, nothing to compare.
        let name_ack = AckHash::from_wire(&self.receive_fixed(ACK_HASH_LEN).await?);
        tracing::debug!(name, %name_ack, "File name acknowledged");

        let bytes_sent = self.send_stream(data, &mut progress).await?;
        if bytes_sent < data.len() as u64 {
            tracing::error!(name, bytes_sent, total = data.len(), "File transfer FAILED");
            return Ok(Delivery::Stalled { bytes_sent });
        }

        let reply = self.receive_literal(TRANSFER_OK).await?;
        if &reply[..] != TRANSFER_OK {
            let reply = String::from_utf8_lossy(&reply).into_owned();
            tracing::error!(name, %reply, "File transfer failed!");
            return Ok(Delivery::Rejected { reply });
        }

        Ok(Delivery::Confirmed(name_ack))
    }

    /// Receive a file into `dir`, replying with the name's ack hash and `OK`.
    ///
    /// # Errors
    /// Returns error if the peer closes, the name is unsafe, or I/O fails.
    pub async fn receive_file(&mut self, dir: &Path) -> Result<ReceivedFile, TransportError> {
        let raw = self.receive_bytes(BufferSize::Small).await?;
        if raw.is_empty() && self.state == SessionState::Closed {
            return Err(TransportError::ConnectionClosed);
        }

        let name = String::from_utf8(raw.to_vec())
            .map_err(|e| TransportError::InvalidFileName(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
        let relative = staged_path(&name).ok_or_else(|| TransportError::InvalidFileName(name.clone()))?;
        let path = dir.join(relative);
        tracing::info!(%name, "Receiving file");

        self.write_all(AckHash::compute(&raw).as_bytes()).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        let size = self.receive_stream(&mut file).await?;
        file.flush().await?;

        self.write_all(TRANSFER_OK).await?;
        tracing::info!(%name, size, "Received file");

        Ok(ReceivedFile { name, path, size })
    }

    async fn send_stream<P>(&mut self, data: &[u8], progress: &mut P) -> Result<u64, TransportError>
    where
        P: FnMut(TransferProgress),
    {
        let total_bytes = data.len() as u64;
        if self.options.framing == Framing::LengthPrefixed {
            self.write_all(&total_bytes.to_be_bytes()).await?;
        }

        let started = Instant::now();
        let mut bytes_sent = 0u64;
        for chunk in data.chunks(BufferSize::Large.capacity()) {
            let mut offset = 0;
            while offset < chunk.len() {
                let n = self.write_some(&chunk[offset..]).await?;
                if n == 0 {
                    return Ok(bytes_sent);
                }
                offset += n;
                bytes_sent += n as u64;
            }

            tracing::trace!(bytes_sent, total_bytes, "Sent chunk");
            progress(TransferProgress {
                bytes_sent,
                total_bytes,
                elapsed: started.elapsed(),
            });
        }

        self.flush().await?;
        Ok(bytes_sent)
    }

    async fn receive_stream<W>(&mut self, sink: &mut W) -> Result<u64, TransportError>
    where
        W: AsyncWrite + Unpin,
    {
        let capacity = BufferSize::Large.capacity();
        let mut chunk = vec![0u8; capacity];
        let mut received = 0u64;

        match self.options.framing {
            Framing::LengthPrefixed => {
                let mut header = [0u8; 8];
                self.read_exact(&mut header).await?;
                let total = u64::from_be_bytes(header);

                while received < total {
                    let want = usize::try_from(total - received).map_or(capacity, |left| left.min(capacity));
                    let n = self.read_some(&mut chunk[..want]).await?;
                    if n == 0 {
                        self.state = SessionState::Closed;
                        return Err(TransportError::ConnectionClosed);
                    }
                    sink.write_all(&chunk[..n]).await?;
                    received += n as u64;
                }
            }
            // At least one read always happens. For an empty file it returns only
            // once the peer writes again or closes.
            Framing::ShortRead => loop {
                let n = self.read_some(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                sink.write_all(&chunk[..n]).await?;
                received += n as u64;
                if n < capacity {
                    break;
                }
            },
        }

        Ok(received)
    }
}
