//! Ack tokens and session identity.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::charset;

/// Ack token width in bytes (and in ISO-8859-1 characters).
pub const ACK_LEN: usize = 2;

/// Single-use correlation id attached to every frame the sender displays.
/// Also the receiver's replay guard against repeated scans of the same code.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AckToken([u8; ACK_LEN]);

impl AckToken {
    /// Fresh token from the OS CSPRNG; unpredictable to an observer of earlier frames.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ACK_LEN];
        OsRng.fill_bytes(&mut bytes);
        AckToken(bytes)
    }

    pub fn from_bytes(bytes: [u8; ACK_LEN]) -> Self {
        AckToken(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ACK_LEN] {
        &self.0
    }

    /// Wire rendering: two ISO-8859-1 characters.
    pub fn to_latin1(&self) -> String {
        charset::from_latin1_bytes(&self.0)
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}{:02x}", self.0[0], self.0[1])
    }
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AckToken({})", self)
    }
}

/// `n` cryptographically strong random bytes rendered as ISO-8859-1 text,
/// so the result passes through the forward channel unchanged.
pub fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    OsRng.fill_bytes(&mut bytes);
    charset::from_latin1_bytes(&bytes)
}

/// Per-session id. Only used to correlate log lines of one transfer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}
