//! Encoding of snapshot blobs and ledger files

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Byte encoding used by the filesystem backends
///
/// Implementations must be able to decode a [`StateBlob`](crate::StateBlob), which rules out
/// formats that are not self-describing.
pub trait SerializerProtocol: Send + Sync {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;

    /// File extension for values written with this encoding
    fn extension(&self) -> &'static str;
}

/// Pretty-printed JSON, readable by operators (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}
