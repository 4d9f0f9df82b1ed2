//! Storage engine configuration.
//!
//! Provides [`StoreConfig`] with defaults for the data directory, metadata
//! cache budget, and data file sizing. The file sizing knobs exist so tests
//! can exercise rollover and growth with small files.

use std::path::PathBuf;

use beck_core::constants::{
    Network, BLOCKFILE_CHUNK_SIZE, MAX_BLOCKFILE_SIZE, UNDOFILE_CHUNK_SIZE,
};

/// Configuration for a [`BlockStore`](crate::store::BlockStore) instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Which chain this store belongs to; selects the record magic.
    pub network: Network,
    /// Cache budget for the embedded metadata store, in bytes.
    pub cache_bytes: usize,
    /// Destroy the metadata store before opening. Data files are kept.
    pub wipe: bool,
    /// Additional read-only directories searched for data files missing
    /// from the primary location. Each must contain a `blocks` subdirectory.
    pub block_data_dirs: Vec<PathBuf>,
    /// Request a shutdown once a reindex run has imported every block.
    pub stop_after_block_import: bool,
    /// Maximum size of one block data file before rolling over.
    pub max_file_bytes: u32,
    /// Growth increment for block data files.
    pub blockfile_chunk_size: u32,
    /// Growth increment for undo data files.
    pub undofile_chunk_size: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            network: Network::default(),
            cache_bytes: 8 * 1024 * 1024,
            wipe: false,
            block_data_dirs: Vec::new(),
            stop_after_block_import: false,
            max_file_bytes: MAX_BLOCKFILE_SIZE,
            blockfile_chunk_size: BLOCKFILE_CHUNK_SIZE,
            undofile_chunk_size: UNDOFILE_CHUNK_SIZE,
        }
    }
}

impl StoreConfig {
    /// Directory holding the numbered data files.
    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    /// Directory holding the embedded metadata store.
    pub fn index_dir(&self) -> PathBuf {
        self.blocks_dir().join("index")
    }
}
