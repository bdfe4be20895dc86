//! The content-addressed block store (C1).
//!
//! Blocks are stored under `<root>/data/` in a fan-out tree keyed by
//! the hex representation of their hash; block metadata (compression
//! type, uncompressed length) lives in a `.meta` sidecar file next to
//! the data file. Grounded on `server/file_backend.c`'s
//! `file_store_data` / `file_retrieve_data` / `file_build_needed_hash_list`
//! / `make_all_subdirectories`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::block::{Block, CompressionType};
use crate::error::ServerError;
use crate::hash::BlockHash;

pub const MIN_LEVEL: usize = 2;
pub const MAX_LEVEL: usize = 4;
const DONE_SENTINEL: &str = ".done";

/// A file-backed, content-addressed block store.
#[derive(Debug, Clone)]
pub struct BlockStore {
    data_root: PathBuf,
    level: usize,
}

impl BlockStore {
    /// Initializes the store rooted at `root/data`, creating the
    /// fan-out tree idempotently. Refuses levels outside `[2, 4]`.
    pub fn init(root: &Path, level: usize) -> Result<Self, ServerError> {
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&level) {
            return Err(ServerError::BadRequest(format!(
                "dir-level ({level}) should be >= {MIN_LEVEL} and <= {MAX_LEVEL}"
            )));
        }

        let data_root = root.join("data");
        fs::create_dir_all(&data_root)?;

        let done_marker = data_root.join(DONE_SENTINEL);
        if !done_marker.exists() {
            if level >= 3 {
                warn!(level, "pre-creating the full fan-out tree at this level is slow and disk-hungry");
            }
            debug!(level, "creating block store fan-out tree");
            make_all_subdirectories(&data_root, level)?;
            fs::write(&done_marker, b"")?;
            debug!("block store fan-out tree created");
        }

        Ok(BlockStore { data_root, level })
    }

    fn path_for(&self, hash: &BlockHash) -> PathBuf {
        let mut path = self.data_root.clone();
        for component in hash.fanout_components(self.level) {
            path.push(component);
        }
        path.push(hash.suffix_hex(self.level));
        path
    }

    fn meta_path_for(&self, hash: &BlockHash) -> PathBuf {
        let mut path = self.path_for(hash);
        path.set_extension({
            let mut ext = path
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !ext.is_empty() {
                ext.push('.');
            }
            ext.push_str("meta");
            ext
        });
        path
    }

    /// Writes `block` to disk. Write-then-rename makes the replace
    /// atomic-enough: a reader never observes a partially written file.
    pub fn put(&self, block: &Block) -> Result<(), ServerError> {
        let path = self.path_for(&block.hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        self.write_meta(&block.hash, block.cmptype, block.uncmplen)?;

        let tmp_path = path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(&block.data)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        Ok(())
    }

    /// Write-then-rename, same as `put`'s data file: a reader racing the
    /// writer never observes a truncated `.meta` sidecar.
    fn write_meta(&self, hash: &BlockHash, cmptype: CompressionType, uncmplen: i64) -> Result<(), ServerError> {
        let meta_path = self.meta_path_for(hash);
        let tmp_path = meta_path.with_extension("meta.tmp");
        let contents = format!("cmptype={}\nuncmplen={}\n", cmptype as i16, uncmplen);
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &meta_path)?;
        Ok(())
    }

    fn read_meta(&self, hash: &BlockHash) -> (CompressionType, i64) {
        let meta_path = self.meta_path_for(hash);
        let Ok(contents) = fs::read_to_string(&meta_path) else {
            return (CompressionType::None, 0);
        };

        let mut cmptype_value: i16 = 0;
        let mut uncmplen: i64 = 0;
        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("cmptype=") {
                cmptype_value = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("uncmplen=") {
                uncmplen = value.trim().parse().unwrap_or(0);
            }
        }

        let cmptype = if CompressionType::is_allowed(cmptype_value) {
            CompressionType::from_i16(cmptype_value)
        } else {
            CompressionType::None
        };

        (cmptype, uncmplen)
    }

    /// Retrieves a block by hash, or `Ok(None)` if it is not present.
    pub fn get(&self, hash: &BlockHash) -> Result<Option<Block>, ServerError> {
        let path = self.path_for(hash);
        match fs::read(&path) {
            Ok(data) => {
                let (cmptype, uncmplen) = self.read_meta(hash);
                let size = data.len() as u64;
                Ok(Some(Block {
                    hash: *hash,
                    data,
                    size,
                    cmptype,
                    uncmplen,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!(hash = %hash, error = %e, "error reading block");
                Err(ServerError::InternalIo(e.to_string()))
            }
        }
    }

    /// True if a block with this hash is already present.
    pub fn exists(&self, hash: &BlockHash) -> bool {
        self.path_for(hash).is_file()
    }

    /// Hash-set oracle (C4): given an ordered list of candidate hashes,
    /// returns the subset the store lacks, preserving first-occurrence
    /// order and collapsing duplicates.
    pub fn needed(&self, candidates: &[BlockHash]) -> Vec<BlockHash> {
        let mut seen: FxHashSet<BlockHash> = FxHashSet::default();
        let mut needed = Vec::new();
        for hash in candidates {
            if seen.contains(hash) {
                continue;
            }
            seen.insert(*hash);
            if !self.exists(hash) {
                needed.push(*hash);
            }
        }
        needed
    }
}

/// Builds the `level`-deep fan-out tree of two-hex-digit directories
/// under `data_root`. Mirrors `make_all_subdirectories` in the
/// original file backend: `256^level` directories are created, one
/// path per possible hash prefix.
fn make_all_subdirectories(data_root: &Path, level: usize) -> Result<(), ServerError> {
    build_subdirectories_recursive(data_root, level)
}

fn build_subdirectories_recursive(base: &Path, remaining: usize) -> Result<(), ServerError> {
    if remaining == 0 {
        fs::create_dir_all(base)?;
        return Ok(());
    }

    for byte in 0u16..256 {
        let component = format!("{byte:02x}");
        let next = base.join(component);
        build_subdirectories_recursive(&next, remaining - 1)?;
    }

    Ok(())
}
