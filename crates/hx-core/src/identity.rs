//! Session identifiers for live connections.
//!
//! An id is 32 bytes from the operating system's secure random source,
//! encoded with the URL-safe base64 alphabet (no padding).

use crate::error::{HxError, HxResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// Number of random bytes behind every id.
pub const ID_ENTROPY_BYTES: usize = 32;

/// Opaque, URL-safe connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh id.
    ///
    /// Fails with [`HxError::IdGeneration`] if the random source is
    /// unavailable; an empty or predictable id is never produced.
    pub fn generate() -> HxResult<Self> {
        Self::generate_from(&mut OsRng)
    }

    /// Generate an id from a caller-supplied random source.
    pub fn generate_from<R: RngCore + ?Sized>(rng: &mut R) -> HxResult<Self> {
        let mut bytes = [0u8; ID_ENTROPY_BYTES];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|e| HxError::IdGeneration(e.to_string()))?;
        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConnectionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ConnectionId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ConnectionId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
