//! Framing primitives: raw byte frames, JSON frames and their acknowledgements.
//!
//! Two framings are supported. `LengthPrefixed` puts a big-endian `u32` size
//! in front of every frame. `ShortRead` places nothing on the wire and ends a
//! frame at the first read that returns less than a full buffer; a payload
//! whose length is an exact multiple of the buffer size therefore stalls until
//! the peer writes again or closes.
//!
//! Fixed-width replies (ack hashes, `OK`, the handshake accept literal) carry
//! no header in either framing. Literal replies are compared as they arrive
//! and a divergent prefix ends the read.

use std::{fmt, io, net::SocketAddr, str::FromStr, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

use crate::{
    ack::AckHash,
    protocol::{ACK_HASH_LEN, BufferSize, Command, SessionState},
};

/// Default upper bound on a single bytes/JSON frame (64 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// How frame boundaries are marked on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Size header before every frame.
    #[default]
    LengthPrefixed,
    /// No header; a short read ends the frame.
    ShortRead,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthPrefixed => f.write_str("length-prefixed"),
            Self::ShortRead => f.write_str("short-read"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('_', "-").as_str() {
            "length-prefixed" => Ok(Self::LengthPrefixed),
            "short-read" => Ok(Self::ShortRead),
            other => Err(format!("unknown framing: {other}")),
        }
    }
}

/// Per-connection framing options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameOptions {
    pub framing: Framing,
    /// Largest accepted bytes/JSON frame.
    pub max_frame_bytes: usize,
    /// Bound on every individual read/write. `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            io_timeout: None,
        }
    }
}

impl FrameOptions {
    #[must_use]
    pub const fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    #[must_use]
    pub const fn with_io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}

/// Transport error.
///
/// Any of these leaves the stream in an unknown position; the connection
/// must be dropped.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: u64, limit: usize },
    #[error("Peer closed the connection")]
    ConnectionClosed,
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// Outcome of a transfer that completed at the transport level.
///
/// Integrity failures are data, not errors: the caller decides what to do.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Receiver acknowledged the transfer.
    Confirmed(AckHash),
    /// Receiver's ack hash does not match the bytes sent.
    Mismatch { expected: AckHash, received: AckHash },
    /// A write accepted zero bytes part way through a file.
    Stalled { bytes_sent: u64 },
    /// Receiver answered a file transfer with something other than `OK`.
    Rejected { reply: String },
}

impl Delivery {
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout(limit))?
            .map_err(TransportError::from),
        None => fut.await.map_err(TransportError::from),
    }
}

/// One end of a raven connection.
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) options: FrameOptions,
    pub(crate) state: SessionState,
}

impl Connection<TcpStream> {
    /// Open a TCP connection to a worker.
    ///
    /// # Errors
    /// Returns error if the connection is refused or times out.
    pub async fn connect<A: ToSocketAddrs>(addr: A, options: FrameOptions) -> Result<Self, TransportError> {
        let stream = with_timeout(options.io_timeout, TcpStream::connect(addr)).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, options))
    }

    /// Address of the remote peer.
    ///
    /// # Errors
    /// Returns error if the socket is no longer connected.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established stream.
    #[must_use]
    pub const fn new(stream: S, options: FrameOptions) -> Self {
        Self {
            stream,
            options,
            state: SessionState::Unestablished,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn options(&self) -> &FrameOptions {
        &self.options
    }

    #[must_use]
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Mark the session closed without touching the stream.
    ///
    /// For callers that no longer know where the next frame starts.
    pub const fn abandon(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Check that a payload of `len` bytes would be accepted by
    /// [`Self::send_bytes`], without writing anything.
    ///
    /// # Errors
    /// Returns [`TransportError::FrameTooLarge`] if it would not.
    pub fn check_frame_size(&self, len: usize) -> Result<(), TransportError> {
        if self.options.framing == Framing::LengthPrefixed {
            self.check_frame_len(len as u64)?;
        }
        Ok(())
    }

    /// Shut down the write half and mark the session closed.
    ///
    /// # Errors
    /// Returns error if the shutdown fails.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.state = SessionState::Closed;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Write one frame.
    ///
    /// # Errors
    /// Returns error if the payload exceeds the frame limit or the write fails.
    pub async fn send_bytes(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let mut frame = BytesMut::with_capacity(payload.len() + 4);
        if self.options.framing == Framing::LengthPrefixed {
            let len = self.check_frame_len(payload.len() as u64)?;
            frame.put_u32(len);
        }
        frame.put_slice(payload);
        self.write_all(&frame).await
    }

    /// Read one frame.
    ///
    /// An empty result with [`SessionState::Closed`] means the peer hung up.
    ///
    /// # Errors
    /// Returns error on I/O failure, timeout, or an oversized frame.
    pub async fn receive_bytes(&mut self, buffer: BufferSize) -> Result<Bytes, TransportError> {
        match self.options.framing {
            Framing::LengthPrefixed => self.receive_prefixed().await,
            Framing::ShortRead => self.receive_until_short(buffer).await,
        }
    }

    /// Send a value as a JSON frame and wait for its ack hash.
    ///
    /// # Errors
    /// Returns error if serialization or I/O fails. A wrong ack is reported
    /// as [`Delivery::Mismatch`].
    pub async fn send_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<Delivery, TransportError> {
        let payload = serde_json::to_vec(value)?;
        self.send_json_bytes(&payload).await
    }

    /// As [`Self::send_json`] for a payload that is already serialized.
    ///
    /// # Errors
    /// Returns error if the payload exceeds the frame limit or I/O fails.
    pub async fn send_json_bytes(&mut self, payload: &[u8]) -> Result<Delivery, TransportError> {
        self.send_bytes(payload).await?;

        let expected = AckHash::compute(payload);
        let received = AckHash::from_wire(&self.receive_fixed(ACK_HASH_LEN).await?);

        if received == expected {
            Ok(Delivery::Confirmed(expected))
        } else {
            tracing::error!(%expected, %received, "Data hash mismatch");
            Ok(Delivery::Mismatch { expected, received })
        }
    }

    /// Receive a JSON object frame and acknowledge it.
    ///
    /// The ack is only sent once the payload has parsed as an object.
    ///
    /// # Errors
    /// Returns error if the peer closed, the payload is not a JSON object, or
    /// I/O fails.
    pub async fn receive_json(&mut self) -> Result<Value, TransportError> {
        let data = self.receive_bytes(BufferSize::Large).await?;
        if data.is_empty() && self.state == SessionState::Closed {
            return Err(TransportError::ConnectionClosed);
        }

        let value: Value = serde_json::from_slice(&data)?;
        if !value.is_object() {
            return Err(TransportError::NotAnObject(json_kind(&value)));
        }
        let ack = AckHash::compute(&data);
        self.write_all(ack.as_bytes()).await?;
        Ok(value)
    }

    /// Receive a JSON frame and decode it into `T`.
    ///
    /// # Errors
    /// As [`Self::receive_json`], plus decode failures after the ack was sent.
    pub async fn receive_json_as<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let value = self.receive_json().await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a command token.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn send_command(&mut self, command: Command) -> Result<(), TransportError> {
        tracing::trace!(%command, "Sending command");
        self.send_bytes(command.token()).await
    }

    /// Perform exactly one read of up to `buffer` bytes.
    ///
    /// # Errors
    /// Returns error on I/O failure or timeout.
    pub async fn receive_once(&mut self, buffer: BufferSize) -> Result<Bytes, TransportError> {
        let mut chunk = vec![0u8; buffer.capacity()];
        let n = self.read_some(&mut chunk).await?;
        if n == 0 {
            self.state = SessionState::Closed;
        }
        chunk.truncate(n);
        Ok(Bytes::from(chunk))
    }

    /// Read a fixed-width reply such as an ack hash.
    ///
    /// `LengthPrefixed` reads exactly `len` bytes. `ShortRead` takes whatever
    /// a single read returns, up to `len`.
    pub(crate) async fn receive_fixed(&mut self, len: usize) -> Result<Bytes, TransportError> {
        let mut reply = vec![0u8; len];
        match self.options.framing {
            Framing::LengthPrefixed => self.read_exact(&mut reply).await?,
            Framing::ShortRead => {
                let n = self.read_some(&mut reply).await?;
                if n == 0 {
                    self.state = SessionState::Closed;
                    return Err(TransportError::ConnectionClosed);
                }
                reply.truncate(n);
            }
        }
        Ok(Bytes::from(reply))
    }

    /// Read a reply that should equal `expected`, such as `OK`.
    ///
    /// Returns as soon as the bytes received so far stop matching, or after
    /// the first read in `ShortRead` mode, so a peer that answers with
    /// something shorter and then goes quiet cannot stall the caller.
    pub(crate) async fn receive_literal(&mut self, expected: &[u8]) -> Result<Bytes, TransportError> {
        let mut reply = vec![0u8; expected.len()];
        let mut filled = 0;
        while filled < reply.len() {
            let n = self.read_some(&mut reply[filled..]).await?;
            if n == 0 {
                self.state = SessionState::Closed;
                if filled == 0 {
                    return Err(TransportError::ConnectionClosed);
                }
                break;
            }
            filled += n;
            if reply[..filled] != expected[..filled] || self.options.framing == Framing::ShortRead {
                break;
            }
        }
        reply.truncate(filled);
        Ok(Bytes::from(reply))
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let limit = self.options.io_timeout;
        let stream = &mut self.stream;
        with_timeout(limit, async move {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await
    }

    pub(crate) async fn write_some(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let limit = self.options.io_timeout;
        with_timeout(limit, self.stream.write(data)).await
    }

    pub(crate) async fn flush(&mut self) -> Result<(), TransportError> {
        let limit = self.options.io_timeout;
        with_timeout(limit, self.stream.flush()).await
    }

    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let limit = self.options.io_timeout;
        with_timeout(limit, self.stream.read(buf)).await
    }

    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let limit = self.options.io_timeout;
        match with_timeout(limit, self.stream.read_exact(buf)).await {
            Ok(_) => Ok(()),
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.state = SessionState::Closed;
                Err(TransportError::ConnectionClosed)
            }
            Err(e) => Err(e),
        }
    }

    fn check_frame_len(&self, size: u64) -> Result<u32, TransportError> {
        let limit = self.options.max_frame_bytes;
        if size > limit as u64 {
            return Err(TransportError::FrameTooLarge { size, limit });
        }
        u32::try_from(size).map_err(|_| TransportError::FrameTooLarge { size, limit })
    }

    async fn receive_prefixed(&mut self) -> Result<Bytes, TransportError> {
        let mut header = [0u8; 4];
        match self.read_exact(&mut header).await {
            Ok(()) => {}
            Err(TransportError::ConnectionClosed) => return Ok(Bytes::new()),
            Err(e) => return Err(e),
        }

        let len = self.check_frame_len(u64::from(u32::from_be_bytes(header)))?;
        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload).await?;
        Ok(Bytes::from(payload))
    }

    async fn receive_until_short(&mut self, buffer: BufferSize) -> Result<Bytes, TransportError> {
        let capacity = buffer.capacity();
        let mut data = BytesMut::new();
        let mut chunk = vec![0u8; capacity];

        loop {
            let n = self.read_some(&mut chunk).await?;
            if n == 0 {
                if data.is_empty() {
                    self.state = SessionState::Closed;
                }
                break;
            }

            data.extend_from_slice(&chunk[..n]);
            if data.len() > self.options.max_frame_bytes {
                return Err(TransportError::FrameTooLarge {
                    size: data.len() as u64,
                    limit: self.options.max_frame_bytes,
                });
            }
            if n < capacity {
                break;
            }
        }

        Ok(data.freeze())
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::io::Builder;

    use super::*;

    fn short_read() -> FrameOptions {
        FrameOptions::default().with_framing(Framing::ShortRead)
    }

    #[tokio::test]
    async fn test_bytes_roundtrip_length_prefixed() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut tx = Connection::new(a, FrameOptions::default());
        let mut rx = Connection::new(b, FrameOptions::default());

        tx.send_bytes(b"hello worker").await.unwrap();
        let received = rx.receive_bytes(BufferSize::Small).await.unwrap();
        assert_eq!(&received[..], b"hello worker");
    }

    #[tokio::test]
    async fn test_bytes_roundtrip_short_read() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut tx = Connection::new(a, short_read());
        let mut rx = Connection::new(b, short_read());

        let payload = vec![7u8; 1000];
        tx.send_bytes(&payload).await.unwrap();
        let received = rx.receive_bytes(BufferSize::Small).await.unwrap();
        assert_eq!(&received[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_length_prefixed_wire_format() {
        let mock = Builder::new().write(b"\x00\x00\x00\x05hello").build();
        let mut conn = Connection::new(mock, FrameOptions::default());
        conn.send_bytes(b"hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_short_read_continues_after_full_buffer() {
        let full = vec![b'a'; BufferSize::Small.capacity()];
        let mock = Builder::new().read(&full).read(b"tail").build();
        let mut conn = Connection::new(mock, short_read());

        let received = conn.receive_bytes(BufferSize::Small).await.unwrap();
        assert_eq!(received.len(), full.len() + 4);
        assert!(received.ends_with(b"tail"));
    }

    #[tokio::test]
    async fn test_eof_marks_closed() {
        let mut conn = Connection::new(Builder::new().build(), FrameOptions::default());
        let received = conn.receive_bytes(BufferSize::Small).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(conn.state(), SessionState::Closed);

        let mut conn = Connection::new(Builder::new().build(), short_read());
        let received = conn.receive_bytes(BufferSize::Small).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(conn.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mock = Builder::new().read(&[0, 0, 0, 100]).build();
        let mut conn = Connection::new(mock, FrameOptions::default().with_max_frame_bytes(8));

        let err = conn.receive_bytes(BufferSize::Large).await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 100, limit: 8 }));
    }

    #[tokio::test]
    async fn test_json_roundtrip_acks_wire_bytes() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut tx = Connection::new(a, FrameOptions::default());
        let mut rx = Connection::new(b, FrameOptions::default());

        let value = json!({"machine": "gpu1", "devices": [{"name": "GPU-A", "memory": 8, "int_name": "dev:0"}]});
        let (delivery, received) = tokio::join!(tx.send_json(&value), rx.receive_json());

        let expected = AckHash::compute(&serde_json::to_vec(&value).unwrap());
        assert_eq!(delivery.unwrap(), Delivery::Confirmed(expected));
        assert_eq!(received.unwrap(), value);
    }

    #[tokio::test]
    async fn test_send_json_confirms_matching_ack() {
        let payload = br#"{"a":1}"#;
        let ack = AckHash::compute(payload);
        let mock = Builder::new().write(payload).read(ack.as_bytes()).build();
        let mut conn = Connection::new(mock, short_read());

        let delivery = conn.send_json(&json!({"a": 1})).await.unwrap();
        assert_eq!(delivery, Delivery::Confirmed(ack));
    }

    #[tokio::test]
    async fn test_send_json_reports_mismatch() {
        let mock = Builder::new()
            .write(br#"{"a":1}"#)
            .read(b"0000000000000000")
            .build();
        let mut conn = Connection::new(mock, short_read());

        let delivery = conn.send_json(&json!({"a": 1})).await.unwrap();
        assert!(matches!(delivery, Delivery::Mismatch { .. }));
        assert!(!delivery.is_confirmed());
    }

    #[tokio::test]
    async fn test_legacy_short_ack_is_a_mismatch() {
        let mock = Builder::new().write(br#"{"a":1}"#).read(b"0123").build();
        let mut conn = Connection::new(mock, short_read());

        let delivery = conn.send_json(&json!({"a": 1})).await.unwrap();
        assert!(matches!(delivery, Delivery::Mismatch { ref received, .. } if received.as_str() == "0123"));
    }

    #[tokio::test]
    async fn test_frame_size_checked_before_writing() {
        // Any write would fail the mock.
        let conn = Connection::new(Builder::new().build(), FrameOptions::default().with_max_frame_bytes(8));
        conn.check_frame_size(8).unwrap();
        let err = conn.check_frame_size(9).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 9, limit: 8 }));

        let legacy = Connection::new(Builder::new().build(), short_read().with_max_frame_bytes(8));
        legacy.check_frame_size(9).unwrap();
    }

    #[tokio::test]
    async fn test_receive_json_replies_with_ack() {
        let payload = br#"{"x": true}"#;
        let mock = Builder::new()
            .read(payload)
            .write(AckHash::compute(payload).as_bytes())
            .build();
        let mut conn = Connection::new(mock, short_read());

        let value = conn.receive_json().await.unwrap();
        assert_eq!(value, json!({"x": true}));
    }

    #[tokio::test]
    async fn test_receive_json_parse_failure_sends_no_ack() {
        let mock = Builder::new().read(b"not json").build();
        let mut conn = Connection::new(mock, short_read());

        let err = conn.receive_json().await.unwrap_err();
        assert!(matches!(err, TransportError::Json(_)));
    }

    #[tokio::test]
    async fn test_receive_json_rejects_non_objects() {
        for payload in [&b"[1,2]"[..], b"5", br#""text""#, b"null"] {
            let mock = Builder::new().read(payload).build();
            let mut conn = Connection::new(mock, short_read());

            let err = conn.receive_json().await.unwrap_err();
            assert!(matches!(err, TransportError::NotAnObject(_)), "{payload:?}");
        }
    }

    #[test]
    fn test_framing_from_str() {
        assert_eq!("short-read".parse::<Framing>(), Ok(Framing::ShortRead));
        assert_eq!("length_prefixed".parse::<Framing>(), Ok(Framing::LengthPrefixed));
        assert!("bogus".parse::<Framing>().is_err());
    }
}
