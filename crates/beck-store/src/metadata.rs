//! Typed façade over the embedded metadata store.
//!
//! Keys are a single prefix byte followed by a raw secondary key (big-endian
//! file number, hash bytes, or UTF-8 flag name), so the store's
//! byte-lexicographic ordering groups records by prefix. Values are bincode
//! encoded and XOR-obfuscated with a per-database random key discovered on
//! open; the typed accessors never see the obfuscation.

use std::path::Path;

use rand::Rng;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{Deserialize, Serialize};

use beck_core::error::StoreError;
use beck_core::types::{DiskPos, Hash256};

use crate::reindex::ReindexState;

const PREFIX_FILE_INFO: u8 = b'f';
const PREFIX_TX_INDEX: u8 = b't';
const PREFIX_BLOCK_INDEX: u8 = b'b';
const PREFIX_FLAG: u8 = b'F';
const KEY_REINDEX: &[u8] = b"R";
const KEY_LAST_BLOCK: &[u8] = b"l";

/// Reserved key holding the obfuscation key itself; the leading 0x0e byte
/// keeps it outside every prefix namespace.
const OBFUSCATE_KEY_KEY: &[u8] = b"\x0e\x00obfuscate_key";
const OBFUSCATE_KEY_LEN: usize = 8;

/// Statistics for one numbered block data file.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockFileInfo {
    /// Number of blocks stored in the file.
    pub blocks: u32,
    /// Bytes of the file used by block data, including framing.
    pub size: u32,
    /// Bytes of the matching undo file used, including framing.
    pub undo_size: u32,
    /// Lowest block height stored in the file.
    pub height_first: u32,
    /// Highest block height stored in the file.
    pub height_last: u32,
    /// Earliest block timestamp stored in the file.
    pub time_first: u64,
    /// Latest block timestamp stored in the file.
    pub time_last: u64,
}

impl BlockFileInfo {
    /// Fold one block into the statistics windows.
    pub fn add_block(&mut self, height: u32, time: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        if height > self.height_last {
            self.height_last = height;
        }
        if time > self.time_last {
            self.time_last = time;
        }
    }
}

/// Serialized form of one block index entry, keyed by block hash.
///
/// Cumulative chain work and skip pointers are not stored; both are
/// recomputed when the index is reloaded.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct StoredBlockIndex {
    pub height: i32,
    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub status: u32,
    pub tx_count: u32,
}

fn db_err(err: rocksdb::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Database(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Corruption(e.to_string()))
}

fn file_info_key(file: i32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = PREFIX_FILE_INFO;
    key[1..].copy_from_slice(&(file as u32).to_be_bytes());
    key
}

fn hash_key(prefix: u8, hash: &Hash256) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = prefix;
    key[1..].copy_from_slice(hash.as_bytes());
    key
}

fn flag_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(PREFIX_FLAG);
    key.extend_from_slice(name.as_bytes());
    key
}

/// The embedded key–value store behind the block index and file metadata.
pub struct MetaDb {
    db: DB,
    obfuscate_key: Vec<u8>,
}

impl MetaDb {
    /// Open (or create) the store at `path`. `wipe` destroys any existing
    /// database first; `cache_bytes` sizes the read cache.
    pub fn open(path: &Path, cache_bytes: usize, wipe: bool) -> Result<Self, StoreError> {
        if wipe && path.exists() {
            DB::destroy(&Options::default(), path).map_err(db_err)?;
        }
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.optimize_for_point_lookup(((cache_bytes / (1024 * 1024)).max(1)) as u64);
        let db = DB::open(&opts, path).map_err(db_err)?;

        let obfuscate_key = match db.get(OBFUSCATE_KEY_KEY).map_err(db_err)? {
            Some(key) => key,
            None => {
                // First open: invent and persist this database's key. The
                // key itself is stored in the clear.
                let key: [u8; OBFUSCATE_KEY_LEN] = rand::thread_rng().gen();
                db.put(OBFUSCATE_KEY_KEY, key).map_err(db_err)?;
                key.to_vec()
            }
        };
        Ok(Self { db, obfuscate_key })
    }

    fn obfuscate(&self, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.obfuscate_key[i % self.obfuscate_key.len()];
        }
    }

    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.db.get(key).map_err(db_err)? {
            Some(mut value) => {
                self.obfuscate(&mut value);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_raw(&self, key: &[u8], mut value: Vec<u8>) -> Result<(), StoreError> {
        self.obfuscate(&mut value);
        self.db.put(key, value).map_err(db_err)
    }

    fn batch_put(&self, batch: &mut WriteBatch, key: &[u8], mut value: Vec<u8>) {
        self.obfuscate(&mut value);
        batch.put(key, value);
    }

    // --- Typed accessors ---

    pub fn read_file_info(&self, file: i32) -> Result<Option<BlockFileInfo>, StoreError> {
        match self.get_raw(&file_info_key(file))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_last_file(&self) -> Result<Option<i32>, StoreError> {
        match self.get_raw(KEY_LAST_BLOCK)? {
            Some(bytes) => Ok(Some(decode::<u32>(&bytes)? as i32)),
            None => Ok(None),
        }
    }

    pub fn read_tx_index(&self, txid: &Hash256) -> Result<Option<DiskPos>, StoreError> {
        match self.get_raw(&hash_key(PREFIX_TX_INDEX, txid))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a batch of transaction locations in one atomic batch.
    pub fn write_tx_index(&self, entries: &[(Hash256, DiskPos)]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for (txid, pos) in entries {
            self.batch_put(&mut batch, &hash_key(PREFIX_TX_INDEX, txid), encode(pos)?);
        }
        self.db.write(batch).map_err(db_err)
    }

    pub fn write_flag(&self, name: &str, value: bool) -> Result<(), StoreError> {
        self.put_raw(&flag_key(name), vec![if value { b'1' } else { b'0' }])
    }

    pub fn read_flag(&self, name: &str) -> Result<Option<bool>, StoreError> {
        Ok(self
            .get_raw(&flag_key(name))?
            .map(|bytes| bytes.first() == Some(&b'1')))
    }

    /// Persisted reindex state; absent means no reindex is in progress.
    pub fn reindex_state(&self) -> Result<ReindexState, StoreError> {
        match self.get_raw(KEY_REINDEX)? {
            None => Ok(ReindexState::NoReindex),
            Some(bytes) => match bytes.first() {
                Some(&1) => Ok(ReindexState::ScanningFiles),
                Some(&2) => Ok(ReindexState::ParsingBlocks),
                other => Err(StoreError::Corruption(format!(
                    "unexpected reindex state {other:?}"
                ))),
            },
        }
    }

    /// Persist a reindex state transition immediately.
    pub fn set_reindex_state(&self, state: ReindexState) -> Result<(), StoreError> {
        match state {
            ReindexState::NoReindex => self.db.delete(KEY_REINDEX).map_err(db_err),
            ReindexState::ScanningFiles => self.put_raw(KEY_REINDEX, vec![1]),
            ReindexState::ParsingBlocks => self.put_raw(KEY_REINDEX, vec![2]),
        }
    }

    /// Write dirty file statistics, the last file number, and block index
    /// records in one atomic batch, synced to disk on commit.
    pub fn write_batch_sync(
        &self,
        file_infos: &[(i32, BlockFileInfo)],
        last_file: i32,
        blocks: &[(Hash256, StoredBlockIndex)],
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for (file, info) in file_infos {
            self.batch_put(&mut batch, &file_info_key(*file), encode(info)?);
        }
        self.batch_put(&mut batch, KEY_LAST_BLOCK, encode(&(last_file as u32))?);
        for (hash, record) in blocks {
            self.batch_put(
                &mut batch,
                &hash_key(PREFIX_BLOCK_INDEX, hash),
                encode(record)?,
            );
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts).map_err(db_err)
    }

    /// Visit every stored block index record in key order.
    pub fn for_each_block_index(
        &self,
        mut visit: impl FnMut(Hash256, StoredBlockIndex) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let start = [PREFIX_BLOCK_INDEX];
        let iter = self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(db_err)?;
            if key.first() != Some(&PREFIX_BLOCK_INDEX) {
                break;
            }
            if key.len() != 33 {
                return Err(StoreError::Corruption(format!(
                    "block index key of {} bytes",
                    key.len()
                )));
            }
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&key[1..]);
            let mut value = value.into_vec();
            self.obfuscate(&mut value);
            visit(Hash256(hash), decode(&value)?)?;
        }
        Ok(())
    }
}
