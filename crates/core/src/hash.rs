//! File content digests used to detect changes against the baseline

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A content hash using BLAKE3 (256-bit)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash `data` with ASCII whitespace removed
    #[must_use]
    pub fn ignoring_whitespace(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for run in data.split(u8::is_ascii_whitespace) {
            hasher.update(run);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Wrap an already computed digest
    #[must_use]
    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a file's content as it is on disk
    ///
    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(std::fs::File::open(path)?)?;
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}
