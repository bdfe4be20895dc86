//! The query engine (C5): filters a host's journal by filename regex
//! and date predicates, applies latest-version reduction, sorts, and
//! serializes to the `file_list` JSON shape.
//!
//! Grounded on `server/file_backend.c`'s `get_file_list_from_regex_and_query`
//! / `file_get_list_of_files` (scan + sort + latest-reduction) and
//! `libcdpfgl/query.h`'s `query_t`.

use chrono::{DateTime, Datelike, Utc};
use regex::RegexBuilder;
use rustc_hash::FxHashMap;

use crate::error::ServerError;
use crate::record::FileMetaRecord;

/// A file-listing query. `uid`/`gid`/`owner`/`group` are accepted but
/// not applied: the source this is modeled on leaves the matching
/// comparison commented out, so this crate keeps the fields for wire
/// compatibility without filtering on them.
#[derive(Clone, Debug, Default)]
pub struct Query {
    pub hostname: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub filename: String,
    pub date: Option<DateTime<Utc>>,
    pub afterdate: Option<DateTime<Utc>>,
    pub beforedate: Option<DateTime<Utc>>,
    pub latest: bool,
    pub reduced: bool,
}

/// Runs `query` over `records`, returning the filtered, reduced, and
/// sorted result list.
pub fn run(query: &Query, records: Vec<FileMetaRecord>) -> Result<Vec<FileMetaRecord>, ServerError> {
    let filename_re = RegexBuilder::new(&query.filename)
        .case_insensitive(true)
        .build()
        .map_err(|e| ServerError::BadRequest(format!("invalid filename regex: {e}")))?;

    let mut filtered: Vec<FileMetaRecord> = records
        .into_iter()
        .filter(|record| filename_re.is_match(&record.name))
        .filter(|record| matches_date(record.mtime, query.date, DateMatch::SameDay))
        .filter(|record| matches_date(record.mtime, query.afterdate, DateMatch::After))
        .filter(|record| matches_date(record.mtime, query.beforedate, DateMatch::Before))
        .collect();

    if query.latest {
        filtered = keep_latest_per_name(filtered);
    }

    filtered.sort_by(|a, b| a.name.cmp(&b.name).then(a.mtime.cmp(&b.mtime)));

    Ok(filtered)
}

enum DateMatch {
    SameDay,
    After,
    Before,
}

fn matches_date(mtime: u64, bound: Option<DateTime<Utc>>, kind: DateMatch) -> bool {
    let Some(bound) = bound else {
        return true;
    };
    let Some(mtime_dt) = DateTime::<Utc>::from_timestamp(mtime as i64, 0) else {
        return false;
    };

    match kind {
        DateMatch::SameDay => {
            mtime_dt.year() == bound.year()
                && mtime_dt.month() == bound.month()
                && mtime_dt.day() == bound.day()
        }
        DateMatch::After => mtime_dt > bound,
        DateMatch::Before => mtime_dt < bound,
    }
}

/// For each unique `name`, keeps only the record with the maximum
/// `mtime`; ties are broken by later journal position (the later
/// record in the input list wins).
fn keep_latest_per_name(records: Vec<FileMetaRecord>) -> Vec<FileMetaRecord> {
    let mut latest: FxHashMap<String, FileMetaRecord> = FxHashMap::default();
    for record in records {
        match latest.get(&record.name) {
            Some(existing) if existing.mtime > record.mtime => {}
            _ => {
                latest.insert(record.name.clone(), record);
            }
        }
    }
    latest.into_values().collect()
}

/// Serializes `records` to the `{"file_list": [...]}` shape, applying
/// the reduced projection per record when `reduced` is set.
pub fn to_file_list_json(records: &[FileMetaRecord], reduced: bool) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = records
        .iter()
        .map(|r| if reduced { r.to_reduced_json() } else { r.to_full_json() })
        .collect();
    serde_json::json!({ "file_list": entries })
}
