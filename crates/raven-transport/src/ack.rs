//! Transfer acknowledgement hashes.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::protocol::ACK_HASH_LEN;

/// First 16 hex characters of the SHA-256 digest of a frame's wire bytes.
///
/// Only used to confirm a frame arrived intact; never as a content address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHash(String);

impl AckHash {
    /// Hash the exact bytes that crossed the wire.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(data));
        Self(digest[..ACK_HASH_LEN].to_string())
    }

    /// Wrap a reply read from the peer, whatever it contains.
    #[must_use]
    pub fn from_wire(reply: &[u8]) -> Self {
        Self(String::from_utf8_lossy(reply).into_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for AckHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
