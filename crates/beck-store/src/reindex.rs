//! Rebuilding the metadata store from raw data files.
//!
//! A reindex runs in two phases recorded in the metadata store so a crash
//! resumes where it left off: first every data file is scanned for framed
//! records and each position is queued with the validation engine, then the
//! driver waits for validation to drain before clearing the flag. The scan
//! applies backpressure through the validation engine and polls the
//! shutdown flag between files.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use beck_core::constants::MIN_BLOCK_SIZE;
use beck_core::types::DiskPos;

use crate::metadata::BlockFileInfo;
use crate::store::BlockStore;

/// Progress of a metadata rebuild, persisted under the reindex key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexState {
    /// No rebuild in progress.
    NoReindex,
    /// Enumerating records in the raw data files.
    ScanningFiles,
    /// All positions queued; waiting for validation to finish.
    ParsingBlocks,
}

/// The validation engine as seen from the storage layer.
///
/// `wait_for_space` provides backpressure during a file scan and is
/// expected to return promptly once a shutdown has been requested.
pub trait ValidationQueue: Send + Sync {
    /// Queue one block position for validation.
    fn add_block(&self, pos: DiskPos);
    /// Block until the engine can accept more work.
    fn wait_for_space(&self);
    /// Block until every queued block has been processed.
    fn wait_finished(&self);
}

/// Body of the block importer thread.
pub(crate) fn reimport_block_files(store: &BlockStore, validation: Arc<dyn ValidationQueue>) {
    if store.reindexing() == ReindexState::ScanningFiles {
        let mut file = 0;
        loop {
            if !load_external_block_file(store, validation.as_ref(), file) {
                break;
            }
            if store.is_shutting_down() {
                return;
            }
            file += 1;
        }
        if let Err(err) = store.set_reindexing(ReindexState::ParsingBlocks) {
            warn!(%err, "failed to persist reindex state");
        }
    }
    validation.wait_finished();
    if let Err(err) = store.set_reindexing(ReindexState::NoReindex) {
        warn!(%err, "failed to clear reindex state");
    }
    if let Err(err) = store.flush() {
        warn!(%err, "failed to flush after reindex");
    }
    info!("reindexing finished");
    if store.config().stop_after_block_import {
        info!("stopping after block import");
        store.request_shutdown();
    }
}

/// Scan one data file for framed records, queueing each with the
/// validation engine. Returns false when the file could not be opened,
/// which ends the file loop.
fn load_external_block_file(
    store: &BlockStore,
    validation: &dyn ValidationQueue,
    file: i32,
) -> bool {
    let started = Instant::now();
    let data = match store.load_block_file(file) {
        Ok(data) => data,
        Err(err) => {
            if !err.is_not_found() {
                warn!(file, %err, "unable to open block file");
            }
            return false;
        }
    };
    let magic = store.magic();
    let bytes: &[u8] = &data;
    let mut info = BlockFileInfo::default();
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        if bytes[offset..offset + 4] != magic {
            // No record here; advance a single byte and rescan.
            offset += 1;
            continue;
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&bytes[offset + 4..offset + 8]);
        let length = u32::from_le_bytes(length_bytes);
        if length < MIN_BLOCK_SIZE {
            offset += 4;
            continue;
        }
        let end = offset + 8 + length as usize;
        if end > bytes.len() {
            break; // truncated tail frame
        }
        validation.wait_for_space();
        validation.add_block(DiskPos::new(file, (offset + 8) as u32));
        info.blocks += 1;
        offset = end;
        info.size = offset as u32;
    }
    if info.blocks > 0 {
        info!(
            file,
            blocks = info.blocks,
            bytes = info.size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded blocks from data file"
        );
        store.found_block_file(file, &info);
    }
    true
}
