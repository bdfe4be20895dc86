//! The append-only per-host metadata journal (C2): a hand-coded
//! streaming line parser tolerant of buffer boundaries crossing
//! records, plus the append-path writer.
//!
//! Grounded on `server/file_backend.c`'s `init_buffer_structure` /
//! `read_one_buffer` / `extract_one_line_from_buffer` (the streaming
//! parser) and `extract_from_line` / `file_store_smeta` (the record
//! decoder and the append-path line builder).

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ServerError;
use crate::hash::{self, BlockHash};
use crate::record::FileMetaRecord;

/// Minimum number of unquoted commas a line must contain before a
/// trailing newline closes the record.
const MIN_COMMA_COUNT: usize = 12;
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A per-host journal rooted at `<prefix>/meta/<hostname>`.
pub struct Journal {
    meta_root: PathBuf,
}

impl Journal {
    pub fn new(root: &Path) -> Result<Self, ServerError> {
        let meta_root = root.join("meta");
        std::fs::create_dir_all(&meta_root)?;
        Ok(Journal { meta_root })
    }

    fn host_path(&self, hostname: &str) -> PathBuf {
        self.meta_root.join(hostname)
    }

    /// Appends one record to the host's journal file. Called only from
    /// the metadata writer: the journal relies on there being exactly
    /// one writer per host subtree for its line-framing guarantee.
    pub fn append(&self, hostname: &str, record: &FileMetaRecord) -> Result<(), ServerError> {
        let path = self.host_path(hostname);
        let line = encode_line(record);

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Streams every decodable record from a host's journal, skipping
    /// malformed lines with a logged warning rather than aborting.
    pub fn scan_host(&self, hostname: &str) -> Result<Vec<FileMetaRecord>, ServerError> {
        let path = self.host_path(hostname);
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = RecordReader::new(file, DEFAULT_BUFFER_SIZE);
        let mut records = Vec::new();
        while let Some(line) = reader.next_line()? {
            match decode_record(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(hostname, error = %e, "skipping malformed journal record"),
            }
        }
        Ok(records)
    }
}

/// Builds one journal line for `record`, in the fixed comma-separated
/// format: integers bare, strings quoted and base64-encoded, hash list
/// trailing as bare base64 literals.
pub fn encode_line(record: &FileMetaRecord) -> String {
    let name64 = hash::encode_b64_string(&record.name);
    let link64 = hash::encode_b64_string(&record.link);

    let mut line = format!(
        "{},{},{},{},{},{},{},\"{}\",\"{}\",{},{},\"{}\",\"{}\"",
        record.file_type,
        record.inode,
        record.mode,
        record.atime,
        record.ctime,
        record.mtime,
        record.size,
        record.owner,
        record.group,
        record.uid,
        record.gid,
        name64,
        link64,
    );

    for h in &record.hash_list {
        line.push(',');
        line.push_str(&h.to_base64());
    }
    line.push('\n');
    line
}

/// Decodes one journal line (without the trailing newline) into a
/// `FileMetaRecord`. Mirrors `extract_from_line`: split on `,` into
/// the 13 fixed fields plus a variable hash-list tail.
pub fn decode_record(line: &[u8]) -> Result<FileMetaRecord, ServerError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| ServerError::ParseWarning(format!("non-utf8 journal line: {e}")))?;

    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 13 {
        return Err(ServerError::ParseWarning(format!(
            "journal record has {} fields, expected at least 13",
            fields.len()
        )));
    }

    let parse_u8 = |s: &str| -> Result<u8, ServerError> {
        s.parse().map_err(|_| ServerError::ParseWarning(format!("invalid integer field: {s}")))
    };
    let parse_u32 = |s: &str| -> Result<u32, ServerError> {
        s.parse().map_err(|_| ServerError::ParseWarning(format!("invalid integer field: {s}")))
    };
    let parse_u64 = |s: &str| -> Result<u64, ServerError> {
        s.parse().map_err(|_| ServerError::ParseWarning(format!("invalid integer field: {s}")))
    };

    let file_type = parse_u8(fields[0])?;
    let inode = parse_u64(fields[1])?;
    let mode = parse_u32(fields[2])?;
    let atime = parse_u64(fields[3])?;
    let ctime = parse_u64(fields[4])?;
    let mtime = parse_u64(fields[5])?;
    let size = parse_u64(fields[6])?;
    let owner = strip_quotes(fields[7]).to_string();
    let group = strip_quotes(fields[8]).to_string();
    let uid = parse_u32(fields[9])?;
    let gid = parse_u32(fields[10])?;
    let name = hash::decode_b64_string(strip_quotes(fields[11]))?;
    let link = hash::decode_b64_string(strip_quotes(fields[12]))?;

    let mut hash_list = Vec::with_capacity(fields.len().saturating_sub(13));
    for raw in &fields[13..] {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        hash_list.push(BlockHash::from_base64(raw)?);
    }

    Ok(FileMetaRecord {
        file_type,
        inode,
        mode,
        atime,
        ctime,
        mtime,
        size,
        owner,
        group,
        uid,
        gid,
        name,
        link,
        hash_list,
    })
}

fn strip_quotes(field: &str) -> &str {
    field.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(field)
}

/// Streaming line reader: pulls fixed-size chunks from `R` and
/// delivers one record at a time, carrying a partial record across
/// chunk refills. Commas inside a quoted field do not count toward
/// the close condition, and a newline inside a quoted field does not
/// close the record either.
struct RecordReader<R> {
    reader: R,
    buf: Vec<u8>,
    buf_pos: usize,
    buf_len: usize,
    in_string: bool,
    comma_count: usize,
    carry: Vec<u8>,
}

impl<R: Read> RecordReader<R> {
    fn new(reader: R, buffer_size: usize) -> Self {
        RecordReader {
            reader,
            buf: vec![0u8; buffer_size.max(1)],
            buf_pos: 0,
            buf_len: 0,
            in_string: false,
            comma_count: 0,
            carry: Vec::new(),
        }
    }

    fn refill(&mut self) -> Result<bool, ServerError> {
        let n = self.reader.read(&mut self.buf)?;
        self.buf_pos = 0;
        self.buf_len = n;
        Ok(n > 0)
    }

    /// Returns the next complete record line (without its trailing
    /// newline), or `None` once the source is exhausted with no
    /// pending partial record.
    fn next_line(&mut self) -> Result<Option<Vec<u8>>, ServerError> {
        loop {
            if self.buf_pos >= self.buf_len && !self.refill()? {
                if !self.carry.is_empty() {
                    warn!(
                        bytes = self.carry.len(),
                        "journal ended mid-record, discarding trailing partial line"
                    );
                    self.carry.clear();
                    self.comma_count = 0;
                    self.in_string = false;
                }
                return Ok(None);
            }

            while self.buf_pos < self.buf_len {
                let byte = self.buf[self.buf_pos];
                self.buf_pos += 1;

                if byte == b'"' {
                    self.in_string = !self.in_string;
                    self.carry.push(byte);
                    continue;
                }

                if byte == b',' && !self.in_string {
                    self.comma_count += 1;
                    self.carry.push(byte);
                    continue;
                }

                if byte == b'\n' && !self.in_string && self.comma_count >= MIN_COMMA_COUNT {
                    let line = std::mem::take(&mut self.carry);
                    self.comma_count = 0;
                    self.in_string = false;
                    return Ok(Some(line));
                }

                self.carry.push(byte);
            }
            // Buffer exhausted mid-record: loop back around to refill.
        }
    }
}
