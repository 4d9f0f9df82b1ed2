//! End-to-end tests for the block storage engine: write/read round trips,
//! file rollover, undo checksums, header chain reorgs, persistence across
//! reopen, and a full reindex with a mock validation engine.

use std::sync::Arc;

use parking_lot::Mutex;

use beck_core::constants::Network;
use beck_core::error::StoreError;
use beck_core::types::{BlockHeader, DiskPos, Hash256, HEADER_SIZE};
use beck_store::{BlockStore, ReindexState, StoreConfig, ValidationQueue};

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

const TEST_MAX_FILE_BYTES: u32 = 16 * 1024;

fn test_config(data_dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        data_dir: data_dir.to_path_buf(),
        network: Network::Regtest,
        max_file_bytes: TEST_MAX_FILE_BYTES,
        blockfile_chunk_size: 8 * 1024,
        undofile_chunk_size: 4 * 1024,
        ..StoreConfig::default()
    }
}

fn temp_store() -> (Arc<BlockStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(test_config(dir.path())).unwrap();
    (store, dir)
}

/// Header with regtest-grade difficulty on top of `prev_hash`.
fn header(prev_hash: Hash256, nonce: u32) -> BlockHeader {
    header_bits(prev_hash, nonce, 0x207f_ffff)
}

fn header_bits(prev_hash: Hash256, nonce: u32, bits: u32) -> BlockHeader {
    BlockHeader {
        version: 1,
        prev_hash,
        merkle_root: Hash256([nonce as u8; 32]),
        time: 1_700_000_000 + nonce,
        bits,
        nonce,
    }
}

/// A block payload of `len` bytes whose first 80 bytes are a serialized
/// header, the way real block data starts.
fn block_payload(fill: u8, len: usize) -> Vec<u8> {
    let mut payload = vec![fill; len.max(HEADER_SIZE)];
    let head = header(Hash256([fill; 32]), fill as u32);
    payload[..HEADER_SIZE].copy_from_slice(&head.serialize());
    payload
}

/// Validation engine mock recording every queued position.
#[derive(Default)]
struct MockValidation {
    positions: Mutex<Vec<DiskPos>>,
}

impl ValidationQueue for MockValidation {
    fn add_block(&self, pos: DiskPos) {
        self.positions.lock().push(pos);
    }

    fn wait_for_space(&self) {}

    fn wait_finished(&self) {}
}

// ----------------------------------------------------------------------
// Write and read round trips
// ----------------------------------------------------------------------

#[test]
fn single_block_write_and_read() {
    let (store, dir) = temp_store();
    let payload = vec![0xAA; 1000];
    let mut pos = DiskPos::null();

    store.write_block(&payload, 0, &mut pos).unwrap();
    assert_eq!(pos, DiskPos::new(0, 8));
    assert_eq!(&*store.load_block(pos).unwrap(), &payload[..]);

    let file = dir.path().join("blocks").join("blk00000.dat");
    assert!(file.exists());
    assert!(std::fs::metadata(&file).unwrap().len() >= 1008);
}

#[test]
fn framing_precedes_every_payload() {
    let (store, _dir) = temp_store();
    let payload = vec![0x5A; 600];
    let mut pos = DiskPos::null();
    store.write_block(&payload, 0, &mut pos).unwrap();

    let file = store.load_block_file(pos.file).unwrap();
    let start = (pos.pos - 8) as usize;
    assert_eq!(
        &file[start..start + 4],
        &Network::Regtest.magic_bytes(),
        "magic must precede the record"
    );
    assert_eq!(
        &file[start + 4..start + 8],
        &600u32.to_le_bytes(),
        "length prefix must match the payload"
    );
}

#[test]
fn rollover_at_the_file_size_cap() {
    let (store, _dir) = temp_store();
    let payload = vec![0xBB; 15 * 1024];

    let mut first = DiskPos::null();
    store.write_block(&payload, 0, &mut first).unwrap();
    assert_eq!(first, DiskPos::new(0, 8));

    let mut second = DiskPos::null();
    store.write_block(&payload, 1, &mut second).unwrap();
    assert_eq!(second, DiskPos::new(1, 8));

    store.flush().unwrap();
    assert_eq!(store.read_last_block_file().unwrap(), Some(1));

    assert_eq!(&*store.load_block(first).unwrap(), &payload[..]);
    assert_eq!(&*store.load_block(second).unwrap(), &payload[..]);
}

#[test]
fn block_files_never_exceed_the_cap() {
    let (store, dir) = temp_store();
    let payload = block_payload(0xCC, 4096);
    for height in 0..8 {
        let mut pos = DiskPos::null();
        store.write_block(&payload, height, &mut pos).unwrap();
    }
    let blocks_dir = dir.path().join("blocks");
    for entry in std::fs::read_dir(&blocks_dir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("blk") {
            assert!(
                entry.metadata().unwrap().len() <= TEST_MAX_FILE_BYTES as u64,
                "{name} exceeds the file size cap"
            );
        }
    }
}

#[test]
fn file_sizes_never_shrink() {
    let (store, dir) = temp_store();
    let file = dir.path().join("blocks").join("blk00000.dat");
    let mut previous = 0u64;
    for height in 0..3 {
        let mut pos = DiskPos::null();
        store
            .write_block(&block_payload(height as u8, 2048), height, &mut pos)
            .unwrap();
        let size = std::fs::metadata(&file).unwrap().len();
        assert!(size >= previous);
        previous = size;
    }
}

// ----------------------------------------------------------------------
// Undo records
// ----------------------------------------------------------------------

#[test]
fn undo_round_trip_and_wrong_hash() {
    let (store, _dir) = temp_store();
    let h1 = Hash256([0x01; 32]);
    let h2 = Hash256([0x02; 32]);

    let mut offset = 0u32;
    store
        .write_undo_block(&[0x01, 0x02, 0x03], &h1, 0, &mut offset)
        .unwrap();
    let pos = DiskPos::new(0, offset);

    assert_eq!(&*store.load_undo_block(pos, &h1).unwrap(), &[0x01, 0x02, 0x03]);
    let err = store.load_undo_block(pos, &h2).unwrap_err();
    assert!(
        matches!(err, StoreError::Corruption(_)),
        "wrong hash must fail with Corruption, got {err:?}"
    );
}

#[test]
fn undo_files_follow_the_block_file_number() {
    let (store, _dir) = temp_store();
    let payload = vec![0xBB; 15 * 1024];
    let mut pos = DiskPos::null();
    store.write_block(&payload, 0, &mut pos).unwrap();
    store.write_block(&payload, 1, &mut pos).unwrap();
    assert_eq!(pos.file, 1);

    // Undo data lands in the rev file matching the block's file number.
    let hash = Hash256([0x55; 32]);
    let mut offset = 0u32;
    store
        .write_undo_block(&[9, 9, 9], &hash, pos.file, &mut offset)
        .unwrap();
    assert_eq!(offset, 8);
    let read = store
        .load_undo_block(DiskPos::new(pos.file, offset), &hash)
        .unwrap();
    assert_eq!(&*read, &[9, 9, 9]);
}

// ----------------------------------------------------------------------
// Header chains
// ----------------------------------------------------------------------

#[test]
fn reorg_to_the_heavier_fork() {
    let (store, _dir) = temp_store();
    let index = store.index();

    let genesis = header(Hash256::ZERO, 0);
    let genesis_id = index.insert_header(&genesis).unwrap();
    assert!(store.append_header(genesis_id));

    // Chain A: three blocks of baseline work.
    let a1 = header(genesis.hash(), 1);
    let a2 = header(a1.hash(), 2);
    let a3 = header(a2.hash(), 3);
    let mut changes = Vec::new();
    for h in [&a1, &a2, &a3] {
        let id = index.insert_header(h).unwrap();
        changes.push(store.append_header(id));
    }
    assert_eq!(changes, vec![true, true, true]);
    assert_eq!(store.header_chain().last(), Some(&a3.hash()));

    // Chain B: two blocks, each worth two A blocks.
    let b1 = header_bits(genesis.hash(), 100, 0x203f_ffff);
    let b2 = header_bits(b1.hash(), 101, 0x203f_ffff);
    let b1_id = index.insert_header(&b1).unwrap();
    assert!(
        !store.append_header(b1_id),
        "lighter fork must not move the main chain"
    );
    let b2_id = index.insert_header(&b2).unwrap();
    assert!(store.append_header(b2_id), "heavier fork must win");

    let chain = store.header_chain();
    assert_eq!(chain, vec![genesis.hash(), b1.hash(), b2.hash()]);
    assert_eq!(store.best_header(), Some(b2.hash()));

    // Both heads remain tracked.
    let tips = store.header_chain_tips();
    assert!(tips.contains(&a3.hash()) && tips.contains(&b2.hash()));
}

#[test]
fn invalidate_and_reconsider_the_winning_tip() {
    let (store, _dir) = temp_store();
    let index = store.index();

    let genesis = header(Hash256::ZERO, 0);
    let genesis_id = index.insert_header(&genesis).unwrap();
    store.append_header(genesis_id);
    let a1 = header(genesis.hash(), 1);
    let a2 = header(a1.hash(), 2);
    let a3 = header(a2.hash(), 3);
    for h in [&a1, &a2, &a3] {
        let id = index.insert_header(h).unwrap();
        store.append_header(id);
    }
    let b1 = header_bits(genesis.hash(), 100, 0x203f_ffff);
    let b2 = header_bits(b1.hash(), 101, 0x203f_ffff);
    let b1_id = index.insert_header(&b1).unwrap();
    store.append_header(b1_id);
    let b2_id = index.insert_header(&b2).unwrap();
    store.append_header(b2_id);
    assert_eq!(store.header_chain().last(), Some(&b2.hash()));

    // Mark B's head invalid: the main chain must revert to A.
    let status = index.record(b2_id).status;
    index.set_status(b2_id, status | beck_store::index::BLOCK_FAILED_VALID);
    assert!(store.append_header(b2_id));
    assert_eq!(store.header_chain().last(), Some(&a3.hash()));

    // Reconsider and replay: back to B.
    index.reconsider(b2_id);
    assert!(store.append_header(b2_id));
    assert_eq!(store.header_chain().last(), Some(&b2.hash()));
}

#[test]
fn header_chain_is_prefix_consistent() {
    let (store, _dir) = temp_store();
    let index = store.index();

    let genesis = header(Hash256::ZERO, 0);
    let mut prev = genesis.clone();
    let id = index.insert_header(&genesis).unwrap();
    store.append_header(id);
    for nonce in 1..6 {
        let next = header(prev.hash(), nonce);
        let id = index.insert_header(&next).unwrap();
        store.append_header(id);
        prev = next;
    }

    let chain = store.header_chain();
    assert_eq!(chain.len(), 6);
    for window in 1..chain.len() {
        let record = index.record(index.get(&chain[window]).unwrap());
        assert_eq!(record.prev_hash, Some(chain[window - 1]));
        assert_eq!(record.height, window as i32);
    }
}

// ----------------------------------------------------------------------
// Index persistence
// ----------------------------------------------------------------------

#[test]
fn index_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let genesis = header(Hash256::ZERO, 0);
    let b1 = header(genesis.hash(), 1);
    let b2 = header(b1.hash(), 2);

    let mut originals = Vec::new();
    {
        let store = BlockStore::open(config.clone()).unwrap();
        let index = store.index();
        for (height, h) in [&genesis, &b1, &b2].into_iter().enumerate() {
            let id = index.insert_header(h).unwrap();
            let mut pos = DiskPos::null();
            store
                .write_block(&block_payload(height as u8 + 1, 500), height as u32, &mut pos)
                .unwrap();
            index.set_block_data(id, pos, 1 + height as u32);
            store.append_header(id);
        }
        store.flush().unwrap();
        for h in [&genesis, &b1, &b2] {
            originals.push(store.index().record(store.index().get(&h.hash()).unwrap()));
        }
    }

    let store = BlockStore::open(config).unwrap();
    assert!(store.index().is_empty());
    store.cache_all_block_infos().unwrap();
    assert_eq!(store.index().len(), 3);

    for original in &originals {
        let id = store.index().get(&original.hash).unwrap();
        let reloaded = store.index().record(id);
        assert_eq!(&reloaded, original, "record for {} changed", original.hash);
    }
    // The chain tracker was rebuilt as well.
    assert_eq!(store.header_chain().last(), Some(&b2.hash()));
    assert_eq!(store.best_header(), Some(b2.hash()));

    // Stored positions still read back.
    let record = store.index().record(store.index().get(&b2.hash()).unwrap());
    assert!(record.have_data());
    let data = store.load_block(record.data_pos().unwrap()).unwrap();
    assert_eq!(data.len(), 500);
}

// ----------------------------------------------------------------------
// Reindex
// ----------------------------------------------------------------------

#[test]
fn reindex_replays_every_block_in_disk_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    // Five 4 KiB blocks: three fit per 16 KiB file, so they span two files.
    let mut written = Vec::new();
    {
        let store = BlockStore::open(config.clone()).unwrap();
        for height in 0..5u32 {
            let mut pos = DiskPos::null();
            store
                .write_block(&block_payload(height as u8, 4096), height, &mut pos)
                .unwrap();
            written.push(pos);
        }
        store.flush().unwrap();
    }
    assert_eq!(written[2].file, 0);
    assert_eq!(written[3].file, 1);

    // Wipe the metadata store but keep the data files, then reindex.
    let store = BlockStore::open(StoreConfig {
        wipe: true,
        ..config
    })
    .unwrap();
    store.set_reindexing(ReindexState::ScanningFiles).unwrap();

    let validation = Arc::new(MockValidation::default());
    let importer = store
        .start_block_importer(validation.clone())
        .expect("reindex pending, importer must start");
    importer.join().unwrap();

    let seen = validation.positions.lock().clone();
    assert_eq!(seen, written, "positions must arrive in on-disk order");
    assert_eq!(store.reindexing(), ReindexState::NoReindex);

    // The synthetic file statistics were registered and flushed.
    let info = store.read_block_file_info(0).unwrap().unwrap();
    assert_eq!(info.blocks, 3);
    let info = store.read_block_file_info(1).unwrap().unwrap();
    assert_eq!(info.blocks, 2);
    assert_eq!(store.read_last_block_file().unwrap(), Some(1));
}

#[test]
fn importer_does_not_start_without_pending_reindex() {
    let (store, _dir) = temp_store();
    let validation = Arc::new(MockValidation::default());
    assert!(store
        .start_block_importer(validation)
        .is_none());
}

#[test]
fn stop_after_block_import_requests_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    {
        let store = BlockStore::open(config.clone()).unwrap();
        let mut pos = DiskPos::null();
        store
            .write_block(&block_payload(1, 500), 0, &mut pos)
            .unwrap();
        store.flush().unwrap();
    }
    config.wipe = true;
    config.stop_after_block_import = true;
    let store = BlockStore::open(config).unwrap();
    store.set_reindexing(ReindexState::ScanningFiles).unwrap();

    let validation = Arc::new(MockValidation::default());
    let importer = store
        .start_block_importer(validation.clone())
        .unwrap();
    importer.join().unwrap();

    assert!(store.is_shutting_down());
    assert_eq!(validation.positions.lock().len(), 1);
}
