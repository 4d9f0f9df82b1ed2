//! Memory-mapped access to the numbered data files.
//!
//! The mapper hands out reference-counted views over `blkNNNNN.dat` and
//! `revNNNNN.dat`. Each cache slot holds only a weak reference, so the last
//! clone of a view to drop unmaps and closes the file; a short history of
//! recently handed-out views keeps hot files from being remapped over and
//! over. A mapping's length is fixed at map time. Growing a file therefore
//! means invalidating the cached slot and letting the next `map` call reopen
//! at the new size while in-flight readers finish on the old mapping.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;
use tracing::debug;

use beck_core::error::StoreError;

/// Number of recently handed-out views the mapper keeps alive to avoid
/// closing and reopening files all the time.
const FILE_HISTORY_DEPTH: usize = 10;

/// Which of the two parallel file families a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Forward block data (`blk` files).
    Block,
    /// Undo records (`rev` files).
    Undo,
}

impl FileKind {
    /// File name prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Block => "blk",
            Self::Undo => "rev",
        }
    }
}

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// One live memory mapping of a data file.
///
/// The mapping is unmapped when the last [`Arc`] referencing it drops.
#[derive(Debug)]
pub struct MappedFile {
    map: Mapping,
    len: usize,
    writable: bool,
}

impl MappedFile {
    /// The mapped bytes. The length was fixed when the file was mapped.
    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Mapping::ReadOnly(m) => m,
            Mapping::Writable(m) => m,
        }
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the file was opened read-write.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Write through the shared mapping.
    ///
    /// Callers must serialize writes through the write coordinator's lock
    /// and stay within the mapped length; concurrent writers to the same
    /// region are not allowed.
    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) {
        debug_assert!(self.writable);
        debug_assert!(offset + data.len() <= self.len);
        let Mapping::Writable(map) = &self.map else {
            return;
        };
        unsafe {
            let ptr = map.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        }
    }
}

/// An owned view of a byte range inside a mapped file.
///
/// Cloning is cheap; the underlying mapping stays alive while any view or
/// clone of it exists.
#[derive(Clone, Debug)]
pub struct MappedSlice {
    file: Arc<MappedFile>,
    offset: usize,
    len: usize,
}

impl MappedSlice {
    pub(crate) fn new(file: Arc<MappedFile>, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= file.len());
        Self { file, offset, len }
    }

    /// The viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.file.bytes()[self.offset..self.offset + self.len]
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for MappedSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for MappedSlice {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

struct MapperCache {
    block_files: Vec<Option<Weak<MappedFile>>>,
    undo_files: Vec<Option<Weak<MappedFile>>>,
    history: VecDeque<Arc<MappedFile>>,
}

impl MapperCache {
    fn slots(&mut self, kind: FileKind) -> &mut Vec<Option<Weak<MappedFile>>> {
        match kind {
            FileKind::Block => &mut self.block_files,
            FileKind::Undo => &mut self.undo_files,
        }
    }

    fn slot(&mut self, index: i32, kind: FileKind) -> &mut Option<Weak<MappedFile>> {
        let slots = self.slots(kind);
        let index = index as usize;
        if slots.len() <= index {
            slots.resize_with(index + 1, || None);
        }
        &mut slots[index]
    }
}

/// Opens, maps, grows, and caches the numbered data files.
pub struct FileMapper {
    blocks_dir: PathBuf,
    alternate_dirs: Vec<PathBuf>,
    last_block_file: Arc<AtomicI32>,
    cache: Mutex<MapperCache>,
}

impl FileMapper {
    /// Create a mapper rooted at `blocks_dir`. `alternate_dirs` are base
    /// directories of read-only mirrors consulted for missing files;
    /// `last_block_file` is shared with the write coordinator and decides
    /// which forward file opens writable.
    pub fn new(
        blocks_dir: PathBuf,
        alternate_dirs: Vec<PathBuf>,
        last_block_file: Arc<AtomicI32>,
    ) -> Self {
        Self {
            blocks_dir,
            alternate_dirs,
            last_block_file,
            cache: Mutex::new(MapperCache {
                block_files: Vec::new(),
                undo_files: Vec::new(),
                history: VecDeque::new(),
            }),
        }
    }

    fn file_name(index: i32, kind: FileKind) -> String {
        format!("{}{:05}.dat", kind.prefix(), index)
    }

    /// Path of a data file, searching the alternate directories when it is
    /// missing from the primary location.
    pub fn resolve_path(&self, index: i32, kind: FileKind) -> PathBuf {
        let primary = self.blocks_dir.join(Self::file_name(index, kind));
        if !primary.exists() {
            for dir in &self.alternate_dirs {
                let alternate = dir.join("blocks").join(Self::file_name(index, kind));
                if alternate.exists() {
                    return alternate;
                }
            }
        }
        primary
    }

    /// Map a data file, reusing a live mapping when one exists.
    ///
    /// The forward file at the last block file number opens writable, all
    /// earlier forward files read-only, undo files writable. A failed
    /// writable open falls back to read-only; check
    /// [`MappedFile::writable`] on the result.
    pub fn map(&self, index: i32, kind: FileKind) -> Result<Arc<MappedFile>, StoreError> {
        if index < 0 {
            return Err(StoreError::InvalidArgument(format!(
                "negative file index {index}"
            )));
        }
        let mut cache = self.cache.lock();
        if let Some(weak) = cache.slot(index, kind) {
            if let Some(live) = weak.upgrade() {
                return Ok(live);
            }
        }

        let path = self.resolve_path(index, kind);
        let want_writable =
            kind == FileKind::Undo || index == self.last_block_file.load(Ordering::Relaxed);
        let mapped = Arc::new(Self::open_and_map(&path, want_writable)?);

        *cache.slot(index, kind) = Some(Arc::downgrade(&mapped));
        cache.history.push_back(Arc::clone(&mapped));
        if cache.history.len() > FILE_HISTORY_DEPTH {
            cache.history.pop_front();
        }
        Ok(mapped)
    }

    fn open_and_map(path: &Path, want_writable: bool) -> Result<MappedFile, StoreError> {
        if want_writable {
            // The file may live on a read-only medium; retry read-only below.
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => {
                    let map = unsafe { MmapMut::map_mut(&file)? };
                    return Ok(MappedFile {
                        len: map.len(),
                        map: Mapping::Writable(map),
                        writable: true,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(path.display().to_string()));
                }
                Err(_) => {}
            }
        }
        let file = fs::File::open(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(path.display().to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        let map = unsafe { Mmap::map(&file)? };
        Ok(MappedFile {
            len: map.len(),
            map: Mapping::ReadOnly(map),
            writable: false,
        })
    }

    /// Invalidate the cached mapping for a file and extend it on disk.
    ///
    /// Live views keep the old, shorter mapping alive until they drop; the
    /// next [`map`](Self::map) call reopens at the new size. This is the
    /// only safe way to observe a resize.
    pub fn grow(&self, index: i32, kind: FileKind, new_len: u64) -> Result<(), StoreError> {
        let mut cache = self.cache.lock();
        *cache.slot(index, kind) = None;
        let path = self.blocks_dir.join(Self::file_name(index, kind));
        debug!(file = index, kind = kind.prefix(), new_len, "growing data file");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.set_len(new_len)?;
        Ok(())
    }

    /// Create a data file pre-sized to `len` bytes. Existing larger files
    /// are left untouched.
    pub fn create(&self, index: i32, kind: FileKind, len: u64) -> Result<(), StoreError> {
        fs::create_dir_all(&self.blocks_dir)?;
        let mut cache = self.cache.lock();
        *cache.slot(index, kind) = None;
        let path = self.blocks_dir.join(Self::file_name(index, kind));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }

    /// Pre-size the cache slots up to `max_file` for both kinds.
    pub fn reserve(&self, max_file: i32) {
        if max_file < 0 {
            return;
        }
        let mut cache = self.cache.lock();
        let _ = cache.slot(max_file, FileKind::Block);
        let _ = cache.slot(max_file, FileKind::Undo);
    }
}
