//! `FileMetaRecord`: one version of one file on one host, as carried
//! through the metadata journal and the JSON query response.

use serde::{Deserialize, Serialize};

use crate::hash::BlockHash;

/// A single version of a single file on one host.
#[derive(Clone, Debug, PartialEq)]
pub struct FileMetaRecord {
    pub file_type: u8,
    pub inode: u64,
    pub mode: u32,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
    pub owner: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub link: String,
    pub hash_list: Vec<BlockHash>,
}

/// Full JSON projection: every field, named per the wire shape in the
/// external-interfaces section (`filetype`, `fsize`, ...).
#[derive(Serialize, Deserialize)]
struct FullRecordJson {
    filetype: u8,
    inode: u64,
    mode: u32,
    atime: u64,
    ctime: u64,
    mtime: u64,
    fsize: u64,
    owner: String,
    group: String,
    uid: u32,
    gid: u32,
    name: String,
    link: String,
    hash_list: Vec<BlockHash>,
}

/// Compact projection used when a query asks for `reduced = true`.
#[derive(Serialize, Deserialize)]
struct ReducedRecordJson {
    filetype: u8,
    name: String,
    mtime: u64,
    fsize: u64,
}

impl FileMetaRecord {
    pub fn to_full_json(&self) -> serde_json::Value {
        serde_json::to_value(FullRecordJson {
            filetype: self.file_type,
            inode: self.inode,
            mode: self.mode,
            atime: self.atime,
            ctime: self.ctime,
            mtime: self.mtime,
            fsize: self.size,
            owner: self.owner.clone(),
            group: self.group.clone(),
            uid: self.uid,
            gid: self.gid,
            name: self.name.clone(),
            link: self.link.clone(),
            hash_list: self.hash_list.clone(),
        })
        .expect("FileMetaRecord fields always serialize")
    }

    pub fn to_reduced_json(&self) -> serde_json::Value {
        serde_json::to_value(ReducedRecordJson {
            filetype: self.file_type,
            name: self.name.clone(),
            mtime: self.mtime,
            fsize: self.size,
        })
        .expect("FileMetaRecord fields always serialize")
    }

    /// Parses a `FileMetaRecord` from the POST body shape of `/Meta.json`
    /// (same field names as [`FileMetaRecord::to_full_json`]).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        let parsed: FullRecordJson = serde_json::from_value(value.clone())?;
        Ok(FileMetaRecord {
            file_type: parsed.filetype,
            inode: parsed.inode,
            mode: parsed.mode,
            atime: parsed.atime,
            ctime: parsed.ctime,
            mtime: parsed.mtime,
            size: parsed.fsize,
            owner: parsed.owner,
            group: parsed.group,
            uid: parsed.uid,
            gid: parsed.gid,
            name: parsed.name,
            link: parsed.link,
            hash_list: parsed.hash_list,
        })
    }
}
