//! WriterId: identifies one writer (a browser tab or a native host process).
//!
//! Wraps a u64 internally but displays as a 16-character hex string. Used as
//! the tie-break component of every [`Timestamp`](crate::clock::Timestamp) and
//! to let a tab recognise its own broadcasts and storage writes.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WriterIdError {
    #[error("Invalid writer ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a writer.
///
/// # Examples
/// ```
/// use fieldsync_core::WriterId;
///
/// let writer = WriterId::generate();
/// let parsed: WriterId = writer.to_string().parse().unwrap();
/// assert_eq!(writer, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct WriterId(u64);

impl WriterId {
    /// The zero writer. Used for timestamps migrated from legacy envelopes
    /// that never recorded a writer; it sorts before every generated id.
    pub const LEGACY: WriterId = WriterId(0);

    /// Generate a new random writer ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for WriterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for WriterId {
    type Err = WriterIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(WriterIdError::InvalidFormat)
    }
}

impl From<u64> for WriterId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<WriterId> for u64 {
    fn from(writer: WriterId) -> u64 {
        writer.0
    }
}

// Serialized as a hex string so envelopes stay readable in devtools.
impl serde::Serialize for WriterId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for WriterId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
