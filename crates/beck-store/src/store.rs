//! The block store façade and write coordinator.
//!
//! [`BlockStore`] composes the file mapper, record codec, metadata store,
//! block index, and reindex driver behind the surface the rest of the node
//! uses. The write coordinator picks the file and offset for every append,
//! rolls block files over at the configured size cap, grows files in
//! chunks through the mapper, and keeps per-file statistics dirty-tracked
//! for the next metadata flush.
//!
//! Lock order: the block index mutex before the file registry mutex before
//! the mapper cache. No call path here acquires them out of that order.

use std::collections::BTreeSet;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use beck_core::error::StoreError;
use beck_core::types::{BlockHeader, DiskPos, Hash256};

use crate::codec;
use crate::config::StoreConfig;
use crate::index::{BlockId, BlockIndex};
use crate::mapper::{FileKind, FileMapper, MappedSlice};
use crate::metadata::{BlockFileInfo, MetaDb};
use crate::reindex::{self, ReindexState, ValidationQueue};

/// Per-file statistics and the current write file, guarded by one mutex
/// held only while framing a write.
struct FileRegistry {
    infos: Vec<BlockFileInfo>,
    last_file: i32,
    dirty: BTreeSet<i32>,
}

/// The block storage engine.
pub struct BlockStore {
    config: StoreConfig,
    magic: [u8; 4],
    meta: MetaDb,
    mapper: FileMapper,
    index: BlockIndex,
    files: Mutex<FileRegistry>,
    last_block_file: Arc<AtomicI32>,
    reindexing: Mutex<ReindexState>,
    shutdown: AtomicBool,
}

impl BlockStore {
    /// Open the store under the configured data directory, creating it
    /// when absent. `wipe` destroys the metadata store but leaves the data
    /// files alone, which is the first half of a reindex.
    pub fn open(config: StoreConfig) -> Result<Arc<Self>, StoreError> {
        fs::create_dir_all(config.blocks_dir())?;
        let meta = MetaDb::open(&config.index_dir(), config.cache_bytes, config.wipe)?;
        let reindexing = meta.reindex_state()?;
        if reindexing != ReindexState::NoReindex {
            info!(state = ?reindexing, "resuming interrupted reindex");
        }

        let mut alternates = Vec::new();
        for dir in &config.block_data_dirs {
            if dir.join("blocks").is_dir() {
                alternates.push(dir.clone());
            } else {
                warn!(dir = %dir.display(), "ignoring block data dir without a blocks subdirectory");
            }
        }

        let stored_last = meta.read_last_file()?;
        let last_file = stored_last.unwrap_or(0);
        let last_shared = Arc::new(AtomicI32::new(last_file));
        let mapper = FileMapper::new(config.blocks_dir(), alternates, Arc::clone(&last_shared));

        let mut infos = Vec::new();
        if stored_last.is_some() {
            for file in 0..=last_file {
                infos.push(meta.read_file_info(file)?.unwrap_or_default());
            }
        }

        let magic = config.network.magic_bytes();
        Ok(Arc::new(Self {
            magic,
            config,
            meta,
            mapper,
            index: BlockIndex::new(),
            files: Mutex::new(FileRegistry {
                infos,
                last_file,
                dirty: BTreeSet::new(),
            }),
            last_block_file: last_shared,
            reindexing: Mutex::new(reindexing),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// The configuration this store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The in-memory block index and header chain tracker.
    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub(crate) fn magic(&self) -> [u8; 4] {
        self.magic
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Load the block payload stored at `pos`.
    pub fn load_block(&self, pos: DiskPos) -> Result<MappedSlice, StoreError> {
        if pos.pos < 4 {
            return Err(StoreError::InvalidArgument(format!(
                "block position {pos} inside file framing"
            )));
        }
        let view = self.mapper.map(pos.file, FileKind::Block)?;
        codec::read_block(&view, pos.pos)
    }

    /// Load the undo payload stored at `pos`, verifying its checksum
    /// against the hash of the block it reverses.
    pub fn load_undo_block(
        &self,
        pos: DiskPos,
        block_hash: &Hash256,
    ) -> Result<MappedSlice, StoreError> {
        if pos.pos < 4 {
            return Err(StoreError::InvalidArgument(format!(
                "undo position {pos} inside file framing"
            )));
        }
        let view = self.mapper.map(pos.file, FileKind::Undo)?;
        codec::read_undo(&view, pos.pos, block_hash)
    }

    /// Map one whole block data file, for the reindex scanner.
    pub fn load_block_file(&self, file: i32) -> Result<MappedSlice, StoreError> {
        let view = self.mapper.map(file, FileKind::Block)?;
        let len = view.len();
        Ok(MappedSlice::new(view, 0, len))
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    /// Append a block payload, choosing the file and offset. On return
    /// `pos` locates the payload and the returned view aliases the bytes
    /// just written. `height` feeds the per-file statistics; the timestamp
    /// is read from the payload's header.
    pub fn write_block(
        &self,
        payload: &[u8],
        height: u32,
        pos: &mut DiskPos,
    ) -> Result<MappedSlice, StoreError> {
        if payload.is_empty() {
            return Err(StoreError::InvalidArgument("empty block payload".into()));
        }
        let time = BlockHeader::deserialize(payload)
            .map(|header| header.time as u64)
            .unwrap_or(0);
        self.write_record(payload, pos, FileKind::Block, None, height, time)
    }

    /// Append an undo payload to the undo file matching `file`, returning
    /// the in-file offset through `pos_out`.
    pub fn write_undo_block(
        &self,
        payload: &[u8],
        block_hash: &Hash256,
        file: i32,
        pos_out: &mut u32,
    ) -> Result<MappedSlice, StoreError> {
        if payload.is_empty() {
            return Err(StoreError::InvalidArgument("empty undo payload".into()));
        }
        if block_hash.is_zero() {
            return Err(StoreError::InvalidArgument(
                "undo write without a block hash".into(),
            ));
        }
        let mut pos = DiskPos::new(file, 0);
        let written = self.write_record(payload, &mut pos, FileKind::Undo, Some(block_hash), 0, 0)?;
        *pos_out = pos.pos;
        Ok(written)
    }

    fn write_record(
        &self,
        payload: &[u8],
        pos: &mut DiskPos,
        kind: FileKind,
        undo_hash: Option<&Hash256>,
        height: u32,
        time: u64,
    ) -> Result<MappedSlice, StoreError> {
        if payload.len() as u64 + 8 >= self.config.max_file_bytes as u64 {
            return Err(StoreError::InvalidArgument(format!(
                "record of {} bytes larger than a data file",
                payload.len()
            )));
        }
        let len = payload.len() as u32;
        let use_blk = kind == FileKind::Block;
        let mut files = self.files.lock();

        let mut new_file = false;
        if files.infos.len() as i32 <= files.last_file {
            // Very first write into this store.
            new_file = true;
            let want = (files.last_file + 1) as usize;
            files.infos.resize_with(want, Default::default);
        } else if use_blk
            && files.infos[files.last_file as usize].size as u64 + len as u64 + 8
                > self.config.max_file_bytes as u64
        {
            // Current file full; roll over.
            new_file = true;
            files.last_file += 1;
            self.last_block_file.store(files.last_file, Ordering::Relaxed);
            let want = (files.last_file + 1) as usize;
            files.infos.resize_with(want, Default::default);
        } else if !use_blk && files.last_file < pos.file {
            // A resync can write undo data into files no block has
            // landed in yet.
            new_file = true;
            files.last_file = (files.last_file + 1).max(pos.file);
            self.last_block_file.store(files.last_file, Ordering::Relaxed);
            let want = (files.last_file + 1) as usize;
            files.infos.resize_with(want, Default::default);
        }
        if use_blk {
            pos.file = files.last_file;
        }
        if pos.file < 0 || pos.file > files.last_file {
            return Err(StoreError::InvalidArgument(format!(
                "file index {} out of range",
                pos.file
            )));
        }

        let chunk = if use_blk {
            self.config.blockfile_chunk_size
        } else {
            self.config.undofile_chunk_size
        };
        let undo_fresh = !use_blk && files.infos[pos.file as usize].undo_size == 0;
        if new_file || undo_fresh {
            let mut initial = (len as u64 + 8).max(chunk as u64);
            if cfg!(windows) {
                // mmap cannot extend a file there; skip the growing steps.
                initial = self.config.max_file_bytes as u64;
            }
            debug!(file = pos.file, kind = kind.prefix(), "starting new data file");
            self.mapper.create(pos.file, kind, initial)?;
        }

        let mut view = self.mapper.map(pos.file, kind)?;
        if !view.writable() {
            error!(file = pos.file, kind = kind.prefix(), "data file is not writable");
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "data file opened read-only",
            )));
        }
        let trailer = if use_blk { 0 } else { codec::UNDO_CHECKSUM_SIZE };
        if !cfg!(windows) {
            loop {
                let fill = {
                    let info = &files.infos[pos.file as usize];
                    if use_blk {
                        info.size
                    } else {
                        info.undo_size
                    }
                };
                let needed = fill as u64 + len as u64 + 8 + trailer as u64;
                if needed <= view.len() as u64 {
                    break;
                }
                let mut target = view.len() as u64 + chunk as u64;
                if use_blk {
                    // Block files are capped; the rollover check above
                    // guarantees the record fits below the cap.
                    target = target.min(self.config.max_file_bytes as u64);
                }
                self.mapper.grow(pos.file, kind, target.max(needed))?;
                view = self.mapper.map(pos.file, kind)?;
                if !view.writable() {
                    error!(file = pos.file, "data file no longer writable after resize");
                    return Err(StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "resized file opened read-only",
                    )));
                }
            }
        }

        let info = &mut files.infos[pos.file as usize];
        let written = if use_blk {
            pos.pos = info.size + 8;
            let slice = codec::write_block_record(&view, &mut info.size, self.magic, payload);
            info.add_block(height, time);
            slice
        } else {
            pos.pos = info.undo_size + 8;
            let hash = undo_hash.ok_or_else(|| {
                StoreError::InvalidArgument("undo write without a block hash".into())
            })?;
            codec::write_undo_record(&view, &mut info.undo_size, self.magic, payload, hash)
        };
        files.dirty.insert(pos.file);
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Header chain
    // ------------------------------------------------------------------

    /// Feed a header record into the chain tracker. Returns whether the
    /// main chain changed.
    pub fn append_header(&self, id: BlockId) -> bool {
        self.index.append_header(id)
    }

    /// Persist one block index record plus the last-file pointer in a
    /// synchronous batch.
    pub fn append_block(&self, id: BlockId, last_file: i32) -> Result<(), StoreError> {
        let record = self.index.stored_record(id);
        self.meta.write_batch_sync(&[], last_file, &[record])
    }

    /// Hashes of the best header chain, genesis first.
    pub fn header_chain(&self) -> Vec<Hash256> {
        self.index.header_chain()
    }

    /// Hashes of every currently tracked chain head.
    pub fn header_chain_tips(&self) -> Vec<Hash256> {
        self.index
            .chain_tips()
            .into_iter()
            .map(|id| self.index.record(id).hash)
            .collect()
    }

    /// Hash of the best known header.
    pub fn best_header(&self) -> Option<Hash256> {
        self.index
            .best_header()
            .map(|id| self.index.record(id).hash)
    }

    // ------------------------------------------------------------------
    // Metadata passthrough
    // ------------------------------------------------------------------

    pub fn read_block_file_info(&self, file: i32) -> Result<Option<BlockFileInfo>, StoreError> {
        self.meta.read_file_info(file)
    }

    pub fn read_last_block_file(&self) -> Result<Option<i32>, StoreError> {
        self.meta.read_last_file()
    }

    pub fn read_tx_index(&self, txid: &Hash256) -> Result<Option<DiskPos>, StoreError> {
        self.meta.read_tx_index(txid)
    }

    pub fn write_tx_index(&self, entries: &[(Hash256, DiskPos)]) -> Result<(), StoreError> {
        self.meta.write_tx_index(entries)
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), StoreError> {
        self.meta.write_flag(name, value)
    }

    pub fn read_flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        self.meta.read_flag(name)
    }

    /// Populate the block index from the metadata store, then rebuild
    /// skip pointers, cumulative work, and the header chains.
    pub fn cache_all_block_infos(&self) -> Result<(), StoreError> {
        let mut max_file = 0;
        self.meta.for_each_block_index(|hash, stored| {
            if self.is_shutting_down() {
                return Err(StoreError::ShuttingDown);
            }
            max_file = max_file.max(stored.file);
            self.index.load_stored(hash, stored)
        })?;
        self.mapper.reserve(max_file);
        self.index.finish_bulk_load();
        debug!(records = self.index.len(), max_file, "cached block index");
        Ok(())
    }

    /// Write dirty file statistics, the last file number, and changed
    /// index records in one synchronous atomic batch.
    pub fn flush(&self) -> Result<(), StoreError> {
        let records = self.index.take_unsaved();
        let (infos, last_file) = {
            let mut files = self.files.lock();
            let dirty: Vec<(i32, BlockFileInfo)> = files
                .dirty
                .iter()
                .map(|file| (*file, files.infos[*file as usize]))
                .collect();
            files.dirty.clear();
            (dirty, files.last_file)
        };
        debug!(
            file_infos = infos.len(),
            records = records.len(),
            "flushing block metadata"
        );
        self.meta.write_batch_sync(&infos, last_file, &records)
    }

    // ------------------------------------------------------------------
    // Reindexing
    // ------------------------------------------------------------------

    /// Current reindex state.
    pub fn reindexing(&self) -> ReindexState {
        *self.reindexing.lock()
    }

    /// Transition the reindex state machine, writing the new state through
    /// immediately.
    pub fn set_reindexing(&self, state: ReindexState) -> Result<(), StoreError> {
        let mut current = self.reindexing.lock();
        if *current == state {
            return Ok(());
        }
        *current = state;
        self.meta.set_reindex_state(state)
    }

    /// Register statistics for a data file discovered during a scan. Any
    /// undo size already recorded for the file is kept.
    pub(crate) fn found_block_file(&self, file: i32, info: &BlockFileInfo) {
        let mut files = self.files.lock();
        if files.last_file < file {
            files.last_file = file;
            self.last_block_file.store(file, Ordering::Relaxed);
        }
        if files.infos.len() as i32 <= files.last_file {
            let want = (files.last_file + 1) as usize;
            files.infos.resize_with(want, Default::default);
        }
        files.infos[file as usize].blocks = info.blocks;
        files.infos[file as usize].size = info.size;
        files.dirty.insert(file);
        info!(file, blocks = info.blocks, bytes = info.size, "registering block file info");
    }

    /// Launch the block importer thread when a reindex is pending.
    /// Returns `None` when no reindex is in progress.
    pub fn start_block_importer(
        self: &Arc<Self>,
        validation: Arc<dyn ValidationQueue>,
    ) -> Option<JoinHandle<()>> {
        if self.reindexing() == ReindexState::NoReindex {
            return None;
        }
        let store = Arc::clone(self);
        Some(thread::spawn(move || {
            reindex::reimport_block_files(&store, validation)
        }))
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Ask long-running loops to stop at the next opportunity.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Whether a shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        self.index.unload();
    }
}
