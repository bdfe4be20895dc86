//! The `Block` entity and its compression-type enumeration.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::BlockHash;

/// Compression codec identifier stored alongside a block. The codec
/// itself is out of scope for this crate; `cmptype` and `uncmplen`
/// are carried as opaque metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i16)]
pub enum CompressionType {
    None = 0,
    Zlib = 1,
}

impl CompressionType {
    pub fn is_allowed(value: i16) -> bool {
        matches!(value, 0 | 1)
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            1 => CompressionType::Zlib,
            _ => CompressionType::None,
        }
    }
}

// Hand-rolled integer-repr serde impls: this crate's dependency stack
// already carries serde/serde_json, so a two-variant enum doesn't earn
// its own serde_repr dependency.
impl Serialize for CompressionType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(*self as i16)
    }
}

impl<'de> Deserialize<'de> for CompressionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i16::deserialize(deserializer)?;
        if !CompressionType::is_allowed(value) {
            return Err(D::Error::custom(format!("invalid cmptype: {value}")));
        }
        Ok(CompressionType::from_i16(value))
    }
}

/// One content-addressed data block: the hash, its (possibly
/// compressed) bytes, and the metadata needed to interpret them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub hash: BlockHash,
    #[serde(with = "crate::codec::base64_bytes")]
    pub data: Vec<u8>,
    pub size: u64,
    pub cmptype: CompressionType,
    pub uncmplen: i64,
}
