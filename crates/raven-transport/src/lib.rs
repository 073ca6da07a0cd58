//! Wire protocol between a raven coordinator and its workers.
//!
//! Provides:
//! - Framing primitives for byte and JSON frames with ack hashes
//! - The magic-string handshake
//! - File transfer with the `OK` completion token

pub mod ack;
pub mod framing;
pub mod handshake;
pub mod protocol;
pub mod transfer;

pub use ack::AckHash;
pub use framing::{Connection, Delivery, FrameOptions, Framing, TransportError};
pub use handshake::HandshakeError;
pub use protocol::{BufferSize, Command, CommandError, DEFAULT_PORT, SessionState};
pub use transfer::{ReceivedFile, TransferProgress};
