//! Writer workers (C3): two long-lived consumers that drain the
//! metadata queue and the data queue, decoupling the HTTP response
//! path from durable filesystem writes.
//!
//! Grounded on `server/server.c`'s `meta_data_thread` / `data_thread`
//! (endless `g_async_queue_pop` loops calling into the backend).
//! Modeled here as `spawn_blocking` loops over `tokio::sync::mpsc`
//! channels, per the rearchitecting note on coroutines/threads: the
//! loop body is blocking filesystem I/O, so it must not run on the
//! async reactor that serves network I/O.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::block::Block;
use crate::block_store::BlockStore;
use crate::journal::Journal;
use crate::record::FileMetaRecord;

/// One pending metadata append: the target host and the record.
pub type MetaJob = (String, FileMetaRecord);

pub fn spawn_metadata_writer(journal: Arc<Journal>, mut rx: mpsc::Receiver<MetaJob>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some((hostname, record)) = rx.blocking_recv() {
            if let Err(e) = journal.append(&hostname, &record) {
                warn!(hostname, error = %e, "metadata writer dropped a record");
            }
        }
    })
}

pub fn spawn_data_writer(block_store: Arc<BlockStore>, mut rx: mpsc::Receiver<Block>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(block) = rx.blocking_recv() {
            let hash = block.hash;
            if let Err(e) = block_store.put(&block) {
                warn!(hash = %hash, error = %e, "data writer dropped a block");
            }
        }
    })
}
