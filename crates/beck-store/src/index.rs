//! In-memory index of every known block header.
//!
//! Records live in an arena owned by [`BlockIndex`]; inter-record links
//! (`prev`, `skip`) are plain [`BlockId`] handles, so the cyclic pointer
//! graph of a header DAG needs no reference counting. Handles stay valid
//! until [`BlockIndex::unload`] tears the whole map down.
//!
//! The header chain tracker shares the index mutex, so chain observers
//! always see a prefix-consistent main chain.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use beck_core::error::StoreError;
use beck_core::types::{BlockHeader, DiskPos, Hash256};
use beck_core::work::{block_proof, U256};

use crate::chain::ChainTracker;
use crate::metadata::StoredBlockIndex;

// Block status bits.
pub const BLOCK_VALID_HEADER: u32 = 1;
pub const BLOCK_VALID_TREE: u32 = 2;
pub const BLOCK_VALID_TRANSACTIONS: u32 = 3;
pub const BLOCK_VALID_CHAIN: u32 = 4;
pub const BLOCK_VALID_SCRIPTS: u32 = 5;
/// Mask covering the validity level.
pub const BLOCK_VALID_MASK: u32 = 7;
/// Full block data is stored at the record's data position.
pub const BLOCK_HAVE_DATA: u32 = 8;
/// Undo data is stored at the record's undo position.
pub const BLOCK_HAVE_UNDO: u32 = 16;
/// The block itself failed validation.
pub const BLOCK_FAILED_VALID: u32 = 32;
/// An ancestor of the block failed validation.
pub const BLOCK_FAILED_CHILD: u32 = 64;
/// This header, or one of its ancestors, is invalid.
pub const BLOCK_FAILED_MASK: u32 = BLOCK_FAILED_VALID | BLOCK_FAILED_CHILD;

/// Handle to one record in the block index arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

pub(crate) struct IndexEntry {
    pub hash: Hash256,
    pub height: i32,
    pub prev: Option<BlockId>,
    pub skip: Option<BlockId>,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub tx_count: u32,
    pub status: u32,
    pub chain_work: U256,
}

impl IndexEntry {
    fn new(hash: Hash256) -> Self {
        Self {
            hash,
            height: -1,
            prev: None,
            skip: None,
            version: 0,
            merkle_root: Hash256::ZERO,
            time: 0,
            bits: 0,
            nonce: 0,
            file: -1,
            data_pos: 0,
            undo_pos: 0,
            tx_count: 0,
            status: 0,
            chain_work: U256::ZERO,
        }
    }

    fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    fn stored(&self) -> StoredBlockIndex {
        StoredBlockIndex {
            height: self.height,
            file: self.file,
            data_pos: self.data_pos,
            undo_pos: self.undo_pos,
            version: self.version,
            prev_hash: Hash256::ZERO, // filled by the caller from `prev`
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
            status: self.status,
            tx_count: self.tx_count,
        }
    }
}

/// Plain-data snapshot of one block index record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexRecord {
    pub hash: Hash256,
    pub height: i32,
    pub prev_hash: Option<Hash256>,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub file: i32,
    pub data_pos: u32,
    pub undo_pos: u32,
    pub tx_count: u32,
    pub status: u32,
    pub chain_work: U256,
}

impl BlockIndexRecord {
    /// Whether full block data is stored for this record.
    pub fn have_data(&self) -> bool {
        self.status & BLOCK_HAVE_DATA != 0
    }

    /// Whether undo data is stored for this record.
    pub fn have_undo(&self) -> bool {
        self.status & BLOCK_HAVE_UNDO != 0
    }

    /// Whether this header or one of its ancestors failed validation.
    pub fn is_failed(&self) -> bool {
        self.status & BLOCK_FAILED_MASK != 0
    }

    /// Position of the stored block data, if any.
    pub fn data_pos(&self) -> Option<DiskPos> {
        (self.data_pos != 0).then(|| DiskPos::new(self.file, self.data_pos))
    }

    /// Position of the stored undo data, if any.
    pub fn undo_pos(&self) -> Option<DiskPos> {
        (self.undo_pos != 0).then(|| DiskPos::new(self.file, self.undo_pos))
    }

    /// Reassemble the header this record was created from.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash: self.prev_hash.unwrap_or(Hash256::ZERO),
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }
}

pub(crate) struct Arena {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash256, BlockId>,
}

impl Arena {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_hash: HashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entry(&self, id: BlockId) -> &IndexEntry {
        &self.entries[id.0 as usize]
    }

    pub(crate) fn entry_mut(&mut self, id: BlockId) -> &mut IndexEntry {
        &mut self.entries[id.0 as usize]
    }

    pub(crate) fn get(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub(crate) fn get_or_create(&mut self, hash: Hash256) -> Result<BlockId, StoreError> {
        if hash.is_zero() {
            return Err(StoreError::InvalidArgument(
                "null hash in block index insert".into(),
            ));
        }
        if let Some(id) = self.by_hash.get(&hash) {
            return Ok(*id);
        }
        let id = BlockId(self.entries.len() as u32);
        self.entries.push(IndexEntry::new(hash));
        self.by_hash.insert(hash, id);
        Ok(id)
    }

    /// Turn the lowest set bit off.
    fn invert_lowest_one(n: i32) -> i32 {
        n & (n - 1)
    }

    /// Height the skip pointer of a record at `height` jumps to.
    fn skip_height(height: i32) -> i32 {
        if height < 2 {
            return 0;
        }
        // Skip steps are chosen so repeated jumps cover any distance in
        // O(log n) while only one extra pointer is stored per record.
        if height & 1 == 1 {
            Self::invert_lowest_one(Self::invert_lowest_one(height - 1)) + 1
        } else {
            Self::invert_lowest_one(height)
        }
    }

    /// Install the skip pointer once the record's height and parent link
    /// are known.
    pub(crate) fn build_skip(&mut self, id: BlockId) {
        let entry = self.entry(id);
        let skip = match entry.prev {
            Some(prev) => self.get_ancestor(prev, Self::skip_height(entry.height)),
            None => None,
        };
        self.entry_mut(id).skip = skip;
    }

    /// Ancestor of `id` at `height`, in O(log n) via the skip pointers.
    pub(crate) fn get_ancestor(&self, id: BlockId, height: i32) -> Option<BlockId> {
        let mut walk = id;
        let mut walk_height = self.entry(id).height;
        if height > walk_height || height < 0 {
            return None;
        }
        while walk_height > height {
            let entry = self.entry(walk);
            let skip_h = Self::skip_height(walk_height);
            let skip_prev_h = Self::skip_height(walk_height - 1);
            match entry.skip {
                Some(skip)
                    if skip_h == height
                        || (skip_h > height
                            && !(skip_prev_h < skip_h - 2 && skip_prev_h >= height)) =>
                {
                    walk = skip;
                    walk_height = skip_h;
                }
                _ => {
                    walk = entry.prev?;
                    walk_height -= 1;
                }
            }
        }
        Some(walk)
    }

    fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.entries.len() as u32).map(BlockId)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_hash.clear();
    }
}

pub(crate) struct IndexInner {
    pub arena: Arena,
    pub tracker: ChainTracker,
    pub unsaved: BTreeSet<BlockId>,
}

/// Process-wide mapping from block hash to header record, plus the header
/// chain tracker, behind one mutex.
pub struct BlockIndex {
    inner: Mutex<IndexInner>,
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IndexInner {
                arena: Arena::new(),
                tracker: ChainTracker::new(),
                unsaved: BTreeSet::new(),
            }),
        }
    }

    /// Look up a record by hash.
    pub fn get(&self, hash: &Hash256) -> Option<BlockId> {
        self.inner.lock().arena.get(hash)
    }

    /// Whether a record exists for `hash`.
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.get(hash).is_some()
    }

    /// Return the existing record for `hash` or insert a fresh default one.
    /// The zero hash is rejected.
    pub fn get_or_create(&self, hash: Hash256) -> Result<BlockId, StoreError> {
        self.inner.lock().arena.get_or_create(hash)
    }

    /// Number of records in the index.
    pub fn len(&self) -> usize {
        self.inner.lock().arena.len()
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one record. The id must come from this index and
    /// predate the last [`unload`](Self::unload).
    pub fn record(&self, id: BlockId) -> BlockIndexRecord {
        let inner = self.inner.lock();
        let entry = inner.arena.entry(id);
        BlockIndexRecord {
            hash: entry.hash,
            height: entry.height,
            prev_hash: entry.prev.map(|p| inner.arena.entry(p).hash),
            version: entry.version,
            merkle_root: entry.merkle_root,
            time: entry.time,
            bits: entry.bits,
            nonce: entry.nonce,
            file: entry.file,
            data_pos: entry.data_pos,
            undo_pos: entry.undo_pos,
            tx_count: entry.tx_count,
            status: entry.status,
            chain_work: entry.chain_work,
        }
    }

    /// Insert a header, linking it to its parent and computing its height
    /// and cumulative work. Returns the existing record when the header is
    /// already known.
    pub fn insert_header(&self, header: &BlockHeader) -> Result<BlockId, StoreError> {
        let hash = header.hash();
        let mut inner = self.inner.lock();
        if let Some(id) = inner.arena.get(&hash) {
            return Ok(id);
        }
        let prev = if header.prev_hash.is_zero() {
            None
        } else {
            Some(inner.arena.get_or_create(header.prev_hash)?)
        };
        let id = inner.arena.get_or_create(hash)?;
        let (height, prev_work) = match prev {
            Some(p) => {
                let parent = inner.arena.entry(p);
                (parent.height + 1, parent.chain_work)
            }
            None => (0, U256::ZERO),
        };
        let entry = inner.arena.entry_mut(id);
        entry.prev = prev;
        entry.height = height;
        entry.version = header.version;
        entry.merkle_root = header.merkle_root;
        entry.time = header.time;
        entry.bits = header.bits;
        entry.nonce = header.nonce;
        entry.chain_work = prev_work + block_proof(header.bits);
        inner.arena.build_skip(id);
        inner.unsaved.insert(id);
        Ok(id)
    }

    /// Record where the block's data lives and how many transactions it has.
    pub fn set_block_data(&self, id: BlockId, pos: DiskPos, tx_count: u32) {
        let mut inner = self.inner.lock();
        let entry = inner.arena.entry_mut(id);
        entry.file = pos.file;
        entry.data_pos = pos.pos;
        entry.tx_count = tx_count;
        entry.status |= BLOCK_HAVE_DATA;
        inner.unsaved.insert(id);
    }

    /// Record where the block's undo data lives.
    pub fn set_undo_data(&self, id: BlockId, pos: DiskPos) {
        let mut inner = self.inner.lock();
        let entry = inner.arena.entry_mut(id);
        entry.undo_pos = pos.pos;
        entry.status |= BLOCK_HAVE_UNDO;
        inner.unsaved.insert(id);
    }

    /// Replace the record's status bitfield.
    pub fn set_status(&self, id: BlockId, status: u32) {
        let mut inner = self.inner.lock();
        inner.arena.entry_mut(id).status = status;
        inner.unsaved.insert(id);
    }

    /// Ancestor of `id` at `height` along the `prev` chain.
    pub fn ancestor(&self, id: BlockId, height: i32) -> Option<BlockId> {
        self.inner.lock().arena.get_ancestor(id, height)
    }

    /// All records as `(height, id)`, sorted by height.
    pub fn all_by_height(&self) -> Vec<(i32, BlockId)> {
        let inner = self.inner.lock();
        let mut all: Vec<(i32, BlockId)> = inner
            .arena
            .ids()
            .map(|id| (inner.arena.entry(id).height, id))
            .collect();
        all.sort();
        all
    }

    /// File numbers currently hosting at least one record with block data.
    pub fn file_indexes(&self) -> BTreeSet<i32> {
        let inner = self.inner.lock();
        inner
            .arena
            .ids()
            .filter(|id| inner.arena.entry(*id).status & BLOCK_HAVE_DATA != 0)
            .map(|id| inner.arena.entry(id).file)
            .collect()
    }

    /// Clear the failure flags on `id`, all its ancestors, and every
    /// descendant. Cleared records are queued for the next metadata flush.
    pub fn reconsider(&self, id: BlockId) {
        let mut inner = self.inner.lock();
        let height = inner.arena.entry(id).height;

        // Descendants: any failed record whose ancestor at our height is us.
        let cleared: Vec<BlockId> = inner
            .arena
            .ids()
            .filter(|other| {
                inner.arena.entry(*other).is_failed()
                    && inner.arena.get_ancestor(*other, height) == Some(id)
            })
            .collect();
        for other in cleared {
            inner.arena.entry_mut(other).status &= !BLOCK_FAILED_MASK;
            inner.unsaved.insert(other);
        }

        // Ancestors.
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if inner.arena.entry(current).is_failed() {
                inner.arena.entry_mut(current).status &= !BLOCK_FAILED_MASK;
                inner.unsaved.insert(current);
            }
            cursor = inner.arena.entry(current).prev;
        }
    }

    /// Feed a record into the header chain tracker. Returns whether the
    /// main chain changed.
    pub fn append_header(&self, id: BlockId) -> bool {
        let mut inner = self.inner.lock();
        let IndexInner { arena, tracker, .. } = &mut *inner;
        tracker.append(arena, id)
    }

    /// Hashes of the main chain, genesis first.
    pub fn header_chain(&self) -> Vec<Hash256> {
        let inner = self.inner.lock();
        inner.tracker.chain.hashes(&inner.arena)
    }

    /// Height of the main chain tip, -1 when empty.
    pub fn chain_height(&self) -> i32 {
        self.inner.lock().tracker.chain.height()
    }

    /// Record at the main chain tip.
    pub fn chain_tip(&self) -> Option<BlockId> {
        self.inner.lock().tracker.chain.tip()
    }

    /// Record on the main chain at `height`.
    pub fn chain_at(&self, height: i32) -> Option<BlockId> {
        self.inner.lock().tracker.chain.at(height)
    }

    /// Heads of every currently tracked header chain.
    pub fn chain_tips(&self) -> Vec<BlockId> {
        self.inner.lock().tracker.tips.clone()
    }

    /// Tip of the best known header chain.
    pub fn best_header(&self) -> Option<BlockId> {
        self.inner.lock().tracker.best_header
    }

    /// Install a record loaded from the metadata store, creating the
    /// parent placeholder when needed. Loaded records are not marked
    /// unsaved.
    pub(crate) fn load_stored(
        &self,
        hash: Hash256,
        stored: StoredBlockIndex,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let id = inner.arena.get_or_create(hash)?;
        let prev = if stored.prev_hash.is_zero() {
            None
        } else {
            Some(inner.arena.get_or_create(stored.prev_hash)?)
        };
        let entry = inner.arena.entry_mut(id);
        entry.prev = prev;
        entry.height = stored.height;
        entry.file = stored.file;
        entry.data_pos = stored.data_pos;
        entry.undo_pos = stored.undo_pos;
        entry.version = stored.version;
        entry.merkle_root = stored.merkle_root;
        entry.time = stored.time;
        entry.bits = stored.bits;
        entry.nonce = stored.nonce;
        entry.status = stored.status;
        entry.tx_count = stored.tx_count;
        Ok(())
    }

    /// After a bulk load: rebuild skip pointers and cumulative work in
    /// height order, then replay every record into the chain tracker.
    pub(crate) fn finish_bulk_load(&self) {
        let mut inner = self.inner.lock();
        let mut order: Vec<(i32, BlockId)> = inner
            .arena
            .ids()
            .map(|id| (inner.arena.entry(id).height, id))
            .collect();
        order.sort();
        for (height, id) in &order {
            if *height < 0 {
                // Placeholder parent whose own record never arrived.
                continue;
            }
            inner.arena.build_skip(*id);
            let entry = inner.arena.entry(*id);
            let prev_work = entry
                .prev
                .map(|p| inner.arena.entry(p).chain_work)
                .unwrap_or(U256::ZERO);
            let work = prev_work + block_proof(entry.bits);
            inner.arena.entry_mut(*id).chain_work = work;
        }
        let IndexInner { arena, tracker, .. } = &mut *inner;
        for (height, id) in &order {
            if *height < 0 {
                continue;
            }
            tracker.append(arena, *id);
        }
    }

    /// Drain the set of records changed since the last flush, as
    /// `(hash, serialized record)` pairs.
    pub(crate) fn take_unsaved(&self) -> Vec<(Hash256, StoredBlockIndex)> {
        let mut inner = self.inner.lock();
        let ids: Vec<BlockId> = std::mem::take(&mut inner.unsaved).into_iter().collect();
        ids.into_iter()
            .map(|id| {
                let entry = inner.arena.entry(id);
                let mut stored = entry.stored();
                stored.prev_hash = entry
                    .prev
                    .map(|p| inner.arena.entry(p).hash)
                    .unwrap_or(Hash256::ZERO);
                (entry.hash, stored)
            })
            .collect()
    }

    /// Serialized form of one record, for single-record metadata writes.
    pub(crate) fn stored_record(&self, id: BlockId) -> (Hash256, StoredBlockIndex) {
        let inner = self.inner.lock();
        let entry = inner.arena.entry(id);
        let mut stored = entry.stored();
        stored.prev_hash = entry
            .prev
            .map(|p| inner.arena.entry(p).hash)
            .unwrap_or(Hash256::ZERO);
        (entry.hash, stored)
    }

    /// Destroy every record and reset the chain tracker. Callers must
    /// ensure no [`BlockId`] handles survive this.
    pub fn unload(&self) {
        let mut inner = self.inner.lock();
        inner.arena.clear();
        inner.tracker.reset();
        inner.unsaved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a linear chain of `len` headers on regtest-grade difficulty,
    /// returning the ids in height order.
    fn linear_chain(index: &BlockIndex, len: usize) -> Vec<BlockId> {
        let mut prev_hash = Hash256::ZERO;
        let mut ids = Vec::new();
        for height in 0..len {
            let header = BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: Hash256([height as u8; 32]),
                time: 1_700_000_000 + height as u32,
                bits: 0x207f_ffff,
                nonce: 0,
            };
            prev_hash = header.hash();
            ids.push(index.insert_header(&header).unwrap());
        }
        ids
    }

    // ------------------------------------------------------------------
    // Insert and lookup
    // ------------------------------------------------------------------

    #[test]
    fn get_or_create_rejects_null_hash() {
        let index = BlockIndex::new();
        assert!(matches!(
            index.get_or_create(Hash256::ZERO),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let index = BlockIndex::new();
        let hash = Hash256([7; 32]);
        let a = index.get_or_create(hash).unwrap();
        let b = index.get_or_create(hash).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&hash));
        assert_eq!(index.get(&hash), Some(a));
    }

    #[test]
    fn insert_header_links_parent_and_height() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 3);
        for (height, id) in ids.iter().enumerate() {
            let record = index.record(*id);
            assert_eq!(record.height, height as i32);
        }
        let tip = index.record(ids[2]);
        assert_eq!(tip.prev_hash, Some(index.record(ids[1]).hash));
    }

    #[test]
    fn insert_header_accumulates_work() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 3);
        // Each regtest block contributes work 2.
        assert_eq!(index.record(ids[0]).chain_work, U256::from_u64(2));
        assert_eq!(index.record(ids[2]).chain_work, U256::from_u64(6));
    }

    #[test]
    fn insert_header_twice_returns_same_record() {
        let index = BlockIndex::new();
        let header = BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time: 1,
            bits: 0x207f_ffff,
            nonce: 0,
        };
        let a = index.insert_header(&header).unwrap();
        let b = index.insert_header(&header).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);
    }

    // ------------------------------------------------------------------
    // Ancestors and the skip list
    // ------------------------------------------------------------------

    #[test]
    fn ancestor_walks_to_any_height() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 64);
        for target in [0usize, 1, 13, 31, 32, 62] {
            assert_eq!(index.ancestor(ids[63], target as i32), Some(ids[target]));
        }
        assert_eq!(index.ancestor(ids[63], 63), Some(ids[63]));
        assert_eq!(index.ancestor(ids[10], 11), None);
        assert_eq!(index.ancestor(ids[10], -1), None);
    }

    #[test]
    fn skip_height_construction() {
        assert_eq!(Arena::skip_height(0), 0);
        assert_eq!(Arena::skip_height(1), 0);
        assert_eq!(Arena::skip_height(2), 0);
        assert_eq!(Arena::skip_height(16), 0);
        assert_eq!(Arena::skip_height(10), 8);
        assert_eq!(Arena::skip_height(12), 8);
        // Odd heights step off the power-of-two ladder.
        assert_eq!(Arena::skip_height(11), 1);
    }

    // ------------------------------------------------------------------
    // Status mutation
    // ------------------------------------------------------------------

    #[test]
    fn set_block_data_and_undo_update_status() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 1);
        index.set_block_data(ids[0], DiskPos::new(0, 8), 12);
        index.set_undo_data(ids[0], DiskPos::new(0, 8));

        let record = index.record(ids[0]);
        assert!(record.have_data());
        assert!(record.have_undo());
        assert_eq!(record.tx_count, 12);
        assert_eq!(record.data_pos(), Some(DiskPos::new(0, 8)));
        assert_eq!(record.undo_pos(), Some(DiskPos::new(0, 8)));
    }

    #[test]
    fn file_indexes_reports_files_with_data() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 3);
        index.set_block_data(ids[0], DiskPos::new(0, 8), 1);
        index.set_block_data(ids[2], DiskPos::new(2, 8), 1);

        let files = index.file_indexes();
        assert_eq!(files.into_iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    // ------------------------------------------------------------------
    // Reconsider
    // ------------------------------------------------------------------

    #[test]
    fn reconsider_clears_ancestors_and_descendants() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 5);
        for id in &ids {
            let status = index.record(*id).status;
            index.set_status(*id, status | BLOCK_FAILED_VALID);
        }
        index.reconsider(ids[2]);
        for id in &ids {
            assert!(!index.record(*id).is_failed());
        }
    }

    #[test]
    fn reconsider_is_idempotent() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 3);
        index.set_status(ids[2], BLOCK_FAILED_VALID);
        index.reconsider(ids[2]);
        let snapshot: Vec<_> = ids.iter().map(|id| index.record(*id)).collect();
        index.reconsider(ids[2]);
        let again: Vec<_> = ids.iter().map(|id| index.record(*id)).collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn reconsider_leaves_unrelated_branches_failed() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 2);
        // A fork off genesis.
        let fork = BlockHeader {
            version: 1,
            prev_hash: index.record(ids[0]).hash,
            merkle_root: Hash256([0xFF; 32]),
            time: 9,
            bits: 0x207f_ffff,
            nonce: 9,
        };
        let fork_id = index.insert_header(&fork).unwrap();
        index.set_status(ids[1], BLOCK_FAILED_VALID);
        index.set_status(fork_id, BLOCK_FAILED_VALID);

        index.reconsider(ids[1]);
        assert!(!index.record(ids[1]).is_failed());
        assert!(index.record(fork_id).is_failed());
    }

    // ------------------------------------------------------------------
    // Unsaved tracking and unload
    // ------------------------------------------------------------------

    #[test]
    fn take_unsaved_drains_changed_records() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 2);
        let unsaved = index.take_unsaved();
        assert_eq!(unsaved.len(), 2);
        assert!(index.take_unsaved().is_empty());

        index.set_block_data(ids[0], DiskPos::new(0, 8), 1);
        let unsaved = index.take_unsaved();
        assert_eq!(unsaved.len(), 1);
        assert_eq!(unsaved[0].0, index.record(ids[0]).hash);
    }

    #[test]
    fn stored_record_carries_prev_hash() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 2);
        let (hash, stored) = index.stored_record(ids[1]);
        assert_eq!(hash, index.record(ids[1]).hash);
        assert_eq!(stored.prev_hash, index.record(ids[0]).hash);
        assert_eq!(stored.height, 1);
    }

    #[test]
    fn unload_empties_the_index() {
        let index = BlockIndex::new();
        linear_chain(&index, 4);
        assert_eq!(index.len(), 4);
        index.unload();
        assert!(index.is_empty());
        assert_eq!(index.chain_height(), -1);
        assert!(index.chain_tips().is_empty());
    }

    #[test]
    fn all_by_height_is_sorted() {
        let index = BlockIndex::new();
        let ids = linear_chain(&index, 4);
        let all = index.all_by_height();
        assert_eq!(all.len(), 4);
        for (i, (height, id)) in all.iter().enumerate() {
            assert_eq!(*height, i as i32);
            assert_eq!(*id, ids[i]);
        }
    }
}
