//! Wire protocol constants and command tokens.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Literal the coordinator opens every connection with.
pub const HANDSHAKE_MAGIC: &[u8] = b"huginn?muninn?";

/// Literal a worker answers a valid magic with.
pub const HANDSHAKE_ACCEPT: &[u8] = b"<raven node>";

/// Completion token written after a file has been stored.
pub const TRANSFER_OK: &[u8] = b"OK";

/// Length of an ack hash in hex characters.
pub const ACK_HASH_LEN: usize = 16;

/// Default worker port.
pub const DEFAULT_PORT: u16 = 4269;

/// Read buffer sizes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    /// Tokens, file names, handshake literals.
    Small,
    /// JSON and file bodies.
    Large,
}

impl BufferSize {
    #[must_use]
    pub const fn capacity(self) -> usize {
        match self {
            Self::Small => 1024,
            Self::Large => 4 * 1024,
        }
    }
}

/// Command token sent by the coordinator before each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// File transfer.
    Push,
    /// Bare JSON frame, acknowledged and discarded.
    Json,
    /// Remote execution request.
    Exec,
}

/// Rejected command token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Token is not wrapped in <...>: {0:?}")]
    NotBracketed(String),
    #[error("Invalid command: {0}")]
    Unknown(String),
}

impl Command {
    /// Bare command name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Json => "json",
            Self::Exec => "exec",
        }
    }

    /// Bracketed wire token.
    #[must_use]
    pub const fn token(self) -> &'static [u8] {
        match self {
            Self::Push => b"<push>",
            Self::Json => b"<json>",
            Self::Exec => b"<exec>",
        }
    }

    /// Parse a raw token as read from the wire.
    ///
    /// Surrounding whitespace is ignored; names are case-sensitive.
    ///
    /// # Errors
    /// Returns `NotBracketed` for tokens not wrapped in `<...>` and
    /// `Unknown` for bracketed names that are not recognized.
    pub fn parse(raw: &[u8]) -> Result<Self, CommandError> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();

        let name = text
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or_else(|| CommandError::NotBracketed(text.to_string()))?;

        match name {
            "push" => Ok(Self::Push),
            "json" => Ok(Self::Json),
            "exec" => Ok(Self::Exec),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.name())
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, nothing exchanged yet.
    Unestablished,
    /// Magic sent or received.
    Handshaking,
    /// Worker descriptor exchanged; commands may flow.
    Ready,
    /// Closed by either side.
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        for command in [Command::Push, Command::Json, Command::Exec] {
            assert_eq!(Command::parse(command.token()), Ok(command));
        }
        assert_eq!(Command::parse(b"<exec>\n"), Ok(Command::Exec));
    }

    #[test]
    fn test_parse_unknown_command() {
        assert_eq!(
            Command::parse(b"<frobnicate>"),
            Err(CommandError::Unknown("frobnicate".to_string()))
        );
        assert_eq!(
            Command::parse(b"<PUSH>"),
            Err(CommandError::Unknown("PUSH".to_string()))
        );
    }

    #[test]
    fn test_parse_unbracketed() {
        assert!(matches!(Command::parse(b"push"), Err(CommandError::NotBracketed(_))));
        assert!(matches!(Command::parse(b"<"), Err(CommandError::NotBracketed(_))));
    }

    #[test]
    fn test_display_matches_token() {
        assert_eq!(Command::Exec.to_string().as_bytes(), Command::Exec.token());
    }
}
