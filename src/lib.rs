//! An embedded, single-writer, page-based storage engine core.
//!
//! The engine is composed of modular layers, each independently testable:
//!
//! - **Device** (`device`): block I/O abstraction plus the persisted
//!   superblock and free-page list.
//! - **Buffer** (`buffer`): single-threaded, pin-counted page cache with
//!   LRU eviction and write-back on dirty eviction.
//! - **Page** (`page`): the common page header and the three slot
//!   directories records are packed into.
//! - **B+ tree** (`btree`): sorted key-value storage with cursor iteration.
//! - **Radix trie** (`radix`): fixed-width-key storage addressed by digit.
//! - **Long store** (`long_store`): chained-page byte streams for values
//!   too large for one page.
//! - **Slab** (`slab`): many-objects-per-page allocation at stable ids.
//!
//! [`Db`] wires a [`BufferManager`] and a [`BTree`] together over a
//! [`BlockDevice`] into the key-value facade most callers want.
//!
//! ```rust,ignore
//! use btree_storage::Db;
//!
//! let db = Db::open("my_database.db")?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.delete(b"hello")?;
//! ```

pub mod btree;
pub mod buffer;
pub mod device;
pub mod error;
pub mod long_store;
pub mod page;
pub mod radix;
pub mod slab;
pub mod types;

pub use error::{Result, StorageError};
pub use types::{BTreeConfig, PageId, RadixConfig, PAGE_SIZE};

pub use btree::{BTree, Cursor};
pub use buffer::BufferManager;
pub use device::{BlockDevice, FileBlockDevice, MemoryBlockDevice};

use std::path::Path;
use tracing::{debug, instrument};

/// Default number of pages kept pinned/cached in memory at once.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Key-value facade over a single [`BTree`], the entry point most callers want.
///
/// `Db` is not `Send`/`Sync`: the buffer manager it wraps uses `Rc<RefCell<_>>`
/// internally, matching the single-writer, single-threaded contract the rest
/// of the engine assumes.
pub struct Db<D> {
    tree: BTree<D>,
}

impl Db<FileBlockDevice> {
    /// Open (or create) a database file at `path` with the default buffer
    /// capacity and tree configuration.
    #[instrument(skip(path))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, DEFAULT_BUFFER_CAPACITY, BTreeConfig::default())
    }

    /// Open (or create) a database file at `path` with an explicit buffer
    /// capacity and tree configuration.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        buffer_capacity: usize,
        config: BTreeConfig,
    ) -> Result<Self> {
        let device = FileBlockDevice::open(path.as_ref(), PAGE_SIZE)?;
        debug!(path = %path.as_ref().display(), buffer_capacity, "opening database file");
        Self::from_device(device, buffer_capacity, config)
    }
}

impl Db<MemoryBlockDevice> {
    /// An in-memory database, useful for tests and scratch work.
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(DEFAULT_BUFFER_CAPACITY, BTreeConfig::default())
    }

    /// An in-memory database with an explicit buffer capacity and tree
    /// configuration.
    pub fn in_memory_with(buffer_capacity: usize, config: BTreeConfig) -> Result<Self> {
        Self::from_device(MemoryBlockDevice::new(PAGE_SIZE), buffer_capacity, config)
    }
}

impl<D: BlockDevice> Db<D> {
    /// Build a `Db` directly from an already-constructed device.
    pub fn from_device(device: D, buffer_capacity: usize, config: BTreeConfig) -> Result<Self> {
        let buffer = BufferManager::new(device, buffer_capacity)?;
        Ok(Self { tree: BTree::new(buffer, config) })
    }

    /// The tree's configuration.
    pub fn config(&self) -> &BTreeConfig {
        self.tree.config()
    }

    /// Whether the database currently holds any entries.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Get a value by key. Returns `None` if the key does not exist.
    #[instrument(skip(self, key), fields(key_len = key.len()))]
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(key)
    }

    /// Whether `key` exists.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.tree.contains_key(key)
    }

    /// Insert or update a key-value pair.
    #[instrument(skip(self, key, value), fields(key_len = key.len(), value_len = value.len()))]
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.put(key, value)
    }

    /// Delete a key-value pair. Returns `true` if the key existed.
    #[instrument(skip(self, key), fields(key_len = key.len()))]
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.tree.remove(key)?.is_some())
    }

    /// Iterate over all entries in sorted key order.
    pub fn iter(&self) -> Result<DbIter<'_, D>> {
        Ok(DbIter { cursor: Cursor::first(&self.tree)? })
    }

    /// Iterate over entries whose key is `>= start` (inclusive), in sorted order.
    pub fn range_from(&self, start: &[u8]) -> Result<DbIter<'_, D>> {
        Ok(DbIter { cursor: Cursor::seek(&self.tree, start)? })
    }

    /// Flush every dirty page currently pinned in the buffer cache to the
    /// underlying device.
    pub fn flush(&self) -> Result<()> {
        self.tree.buffer().flush_all()
    }
}

/// Forward iterator over a [`Db`]'s entries, yielded in sorted key order.
pub struct DbIter<'a, D> {
    cursor: Cursor<'a, D>,
}

impl<'a, D: BlockDevice> Iterator for DbIter<'a, D> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cursor.entry() {
            Ok(None) => None,
            Ok(Some(entry)) => {
                if let Err(e) = self.cursor.next() {
                    return Some(Err(e));
                }
                Some(Ok(entry))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_operations() -> Result<()> {
        let db = Db::in_memory()?;

        db.put(b"key1", b"value1")?;
        assert_eq!(db.get(b"key1")?, Some(b"value1".to_vec()));

        db.put(b"key1", b"value2")?;
        assert_eq!(db.get(b"key1")?, Some(b"value2".to_vec()));

        assert!(db.delete(b"key1")?);
        assert_eq!(db.get(b"key1")?, None);

        assert_eq!(db.get(b"nonexistent")?, None);
        assert!(!db.delete(b"nonexistent")?);

        Ok(())
    }

    #[test]
    fn iteration_is_sorted() -> Result<()> {
        let db = Db::in_memory()?;
        db.put(b"banana", b"2")?;
        db.put(b"apple", b"1")?;
        db.put(b"cherry", b"3")?;
        db.put(b"date", b"4")?;

        let all: Vec<_> = db.iter()?.collect::<Result<_>>()?;
        assert_eq!(
            all,
            vec![
                (b"apple".to_vec(), b"1".to_vec()),
                (b"banana".to_vec(), b"2".to_vec()),
                (b"cherry".to_vec(), b"3".to_vec()),
                (b"date".to_vec(), b"4".to_vec()),
            ]
        );

        let from_banana: Vec<_> = db.range_from(b"banana")?.collect::<Result<_>>()?;
        assert_eq!(from_banana.len(), 3);
        assert_eq!(from_banana[0].0, b"banana".to_vec());

        Ok(())
    }

    #[test]
    fn file_backed_db_roundtrips_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let db = Db::open(&path)?;
            db.put(b"hello", b"world")?;
            db.flush()?;
        }
        {
            let db = Db::open(&path)?;
            assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
        }

        Ok(())
    }
}
