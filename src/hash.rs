//! Content hash codecs: the 32-byte opaque block identifier and its
//! hex/base64 wire forms.
//!
//! The hashing function itself is out of scope for this crate (clients
//! compute and send hashes); this module only converts between the
//! binary form and the two wire representations used by the protocol.

use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

pub const HASH_LEN: usize = 32;

/// A 256-bit content hash identifying a stored block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockHash([u8; HASH_LEN]);

impl BlockHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        BlockHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Decodes a 64-character lowercase hex string into a hash.
    pub fn from_hex(hex: &str) -> Result<Self, ServerError> {
        if hex.len() != HASH_LEN * 2 {
            return Err(ServerError::BadRequest(format!(
                "invalid hash length: {} instead of {}",
                hex.len(),
                HASH_LEN * 2
            )));
        }

        let mut out = [0u8; HASH_LEN];
        for i in 0..HASH_LEN {
            let byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| ServerError::BadRequest(format!("invalid hex in hash: {hex}")))?;
            out[i] = byte;
        }
        Ok(BlockHash(out))
    }

    /// Encodes the hash as 64 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(HASH_LEN * 2);
        for byte in &self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }

    /// Decodes a standard (padded) base64 string into a hash.
    pub fn from_base64(b64: &str) -> Result<Self, ServerError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| ServerError::BadRequest(format!("invalid base64 hash: {e}")))?;
        if bytes.len() != HASH_LEN {
            return Err(ServerError::BadRequest(format!(
                "invalid decoded hash length: {} instead of {}",
                bytes.len(),
                HASH_LEN
            )));
        }
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&bytes);
        Ok(BlockHash(out))
    }

    /// Encodes the hash as standard padded base64 (44 characters).
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    /// Fan-out path components for a directory tree of depth `level`:
    /// one two-hex-digit component per level, taken from the leading
    /// bytes of the hash.
    pub fn fanout_components(&self, level: usize) -> Vec<String> {
        self.0[..level]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// The filename suffix after the fan-out prefix has been stripped:
    /// the remaining hex digits of the hash past `level` bytes.
    pub fn suffix_hex(&self, level: usize) -> String {
        let mut s = String::with_capacity((HASH_LEN - level) * 2);
        for byte in &self.0[level..] {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl TryFrom<String> for BlockHash {
    type Error = ServerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BlockHash::from_base64(&value)
    }
}

impl From<BlockHash> for String {
    fn from(hash: BlockHash) -> Self {
        hash.to_base64()
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Decodes a base64 string to UTF-8, tolerating empty input as empty string.
/// Used for the `name64`/`link64` journal fields.
pub fn decode_b64_string(encoded: &str) -> Result<String, ServerError> {
    if encoded.is_empty() {
        return Ok(String::new());
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ServerError::ParseWarning(format!("invalid base64 field: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ServerError::ParseWarning(format!("invalid utf-8 field: {e}")))
}

/// Encodes a string field to base64, empty string stays empty.
pub fn encode_b64_string(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
}
