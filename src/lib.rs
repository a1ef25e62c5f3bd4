//! # btree-storage
//!
//! An embedded, single-process, durable key-value store backed by a
//! B+ tree over a memory-mapped, fixed-page-size file.
//!
//! ## Architecture
//!
//! - **Page Layer** (`page`): fixed-size page buffers and the byte-level
//!   node codec for leaf and internal nodes.
//! - **Storage Layer** (`storage`): the file header and the
//!   memory-mapped page manager, including the on-disk free list.
//! - **B+ Tree Layer** (`btree`): descent, search, insert/split, and
//!   delete/merge over pages handed out by a page manager.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use btree_storage::{Config, Db};
//!
//! # fn main() -> btree_storage::Result<()> {
//! let db = Db::open(Config::new("my_database"))?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! db.delete(b"hello")?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod error;
pub mod page;
pub mod storage;
pub mod types;

pub use btree::BTree;
pub use error::{Result, StorageError};
pub use storage::{MmapPageManager, PageManager};
pub use types::{PageId, PAGE_SIZE};

use parking_lot::Mutex;
use std::path::PathBuf;
use types::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base path for the store's `.idx`/`.dat` file pair.
    pub path: PathBuf,
    /// Whether to `msync` after every write (default: `false`).
    ///
    /// When disabled, durability is still guaranteed across an orderly
    /// [`Db::close`] or [`Db::flush`]; it is only an unclean process
    /// exit between writes that can lose data not yet synced.
    pub sync_on_write: bool,
}

impl Config {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            sync_on_write: false,
        }
    }

    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }
}

struct Inner {
    pm: MmapPageManager,
    tree: BTree,
    sync_on_write: bool,
}

/// A database handle. Holds the page manager and the tree engine behind
/// a single mutex — this crate makes no claim to intra-process
/// parallelism, only to `Db` being safely shareable across threads.
pub struct Db {
    inner: Mutex<Inner>,
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_SIZE {
        return Err(StorageError::KeyTooLarge {
            size: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(StorageError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

impl Db {
    /// Open or create a database at `config.path`.
    pub fn open(config: Config) -> Result<Self> {
        let pm = MmapPageManager::open(&config.path)?;
        let tree = BTree::new(&pm);
        Ok(Self {
            inner: Mutex::new(Inner {
                pm,
                tree,
                sync_on_write: config.sync_on_write,
            }),
        })
    }

    /// Look up a key. Returns `None` if it does not exist.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let inner = self.inner.lock();
        inner.tree.get(&inner.pm, key)
    }

    /// Insert a key-value pair, or overwrite the value if the key
    /// already exists.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_key(key)?;
        check_value(value)?;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        inner.tree.put(&mut inner.pm, key, value)?;
        if inner.sync_on_write {
            inner.pm.flush()?;
        }
        Ok(())
    }

    /// Remove a key. Returns `true` if it existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let removed = inner.tree.delete(&mut inner.pm, key)?;
        if removed && inner.sync_on_write {
            inner.pm.flush()?;
        }
        Ok(removed)
    }

    /// Check whether a key exists, without allocating a copy of its
    /// value.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Flush the memory map to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock().pm.flush()
    }

    /// Statistics about the store.
    pub fn stats(&self) -> Result<DbStats> {
        let inner = self.inner.lock();
        Ok(DbStats {
            page_count: inner.pm.page_count(),
            tree_height: inner.tree.height(&inner.pm)?,
        })
    }

    /// Flush and release the underlying memory maps and file handles.
    /// Consumes `self`: once closed, a `Db` cannot be used again, which
    /// the type system enforces rather than a runtime "is open" flag.
    pub fn close(self) -> Result<()> {
        self.inner.into_inner().pm.close()
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbStats {
    /// Total pages currently allocated in the index file.
    pub page_count: u32,
    /// Depth of the B+ tree, counting the root as level 1.
    pub tree_height: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let db = Db::open(Config::new(dir.path().join("test")))?;

        db.put(b"key1", b"value1")?;
        assert_eq!(db.get(b"key1")?, Some(b"value1".to_vec()));

        db.put(b"key1", b"value2")?;
        assert_eq!(db.get(b"key1")?, Some(b"value2".to_vec()));

        assert!(db.delete(b"key1")?);
        assert_eq!(db.get(b"key1")?, None);

        assert_eq!(db.get(b"nonexistent")?, None);
        assert!(!db.delete(b"nonexistent")?);

        db.close()
    }

    #[test]
    fn test_key_too_large_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Db::open(Config::new(dir.path().join("test"))).unwrap();
        let key = vec![b'k'; MAX_KEY_SIZE + 1];
        assert!(matches!(
            db.put(&key, b"v"),
            Err(StorageError::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn test_value_too_large_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Db::open(Config::new(dir.path().join("test"))).unwrap();
        let value = vec![b'v'; MAX_VALUE_SIZE + 1];
        assert!(matches!(
            db.put(b"k", &value),
            Err(StorageError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn test_bulk_put_and_stats() -> Result<()> {
        let dir = tempdir().unwrap();
        let db = Db::open(Config::new(dir.path().join("test")))?;
        for i in 0..100u32 {
            let key = format!("key{i:04}");
            db.put(key.as_bytes(), b"v")?;
        }
        let stats = db.stats()?;
        assert!(stats.page_count > 1);
        assert!(stats.tree_height >= 1);
        db.close()
    }

    #[test]
    fn test_reopen_preserves_data() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test");

        {
            let db = Db::open(Config::new(&path))?;
            for i in 0..30u32 {
                let key = format!("key{i:03}");
                let value = format!("value{i}");
                db.put(key.as_bytes(), value.as_bytes())?;
            }
            db.close()?;
        }
        {
            let db = Db::open(Config::new(&path))?;
            for i in 0..30u32 {
                let key = format!("key{i:03}");
                let value = format!("value{i}");
                assert_eq!(db.get(key.as_bytes())?, Some(value.into_bytes()));
            }
            db.close()?;
        }
        Ok(())
    }

    #[test]
    fn test_random_order_insert_and_delete() -> Result<()> {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let dir = tempdir().unwrap();
        let db = Db::open(Config::new(dir.path().join("test")))?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let mut keys: Vec<String> = (0..200u32).map(|i| format!("rk{i:04}")).collect();
        keys.shuffle(&mut rng);
        for key in &keys {
            db.put(key.as_bytes(), b"x")?;
        }
        for key in &keys {
            assert_eq!(db.get(key.as_bytes())?, Some(b"x".to_vec()));
        }

        keys.shuffle(&mut rng);
        for key in keys.iter().take(150) {
            assert!(db.delete(key.as_bytes())?);
        }
        for key in keys.iter().take(150) {
            assert!(!db.contains(key.as_bytes())?);
        }
        for key in keys.iter().skip(150) {
            assert!(db.contains(key.as_bytes())?);
        }

        db.close()
    }

    #[test]
    fn test_delete_range_then_verify() -> Result<()> {
        let dir = tempdir().unwrap();
        let db = Db::open(Config::new(dir.path().join("test")))?;
        for i in 0..20u32 {
            let key = format!("k{i:02}");
            db.put(key.as_bytes(), b"x")?;
        }
        for i in 5..15u32 {
            let key = format!("k{i:02}");
            assert!(db.delete(key.as_bytes())?);
        }
        for i in 0..20u32 {
            let key = format!("k{i:02}");
            let expected = !(5..15).contains(&i);
            assert_eq!(db.contains(key.as_bytes())?, expected);
        }
        db.close()
    }
}
