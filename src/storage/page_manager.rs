//! Memory-mapped page manager.
//!
//! Opens a pair of files — `<path>.idx` holding the file header, free
//! list, and every B+ tree node, and `<path>.dat`, provisioned and
//! mapped identically but never written to (see `SPEC_FULL.md` §11) —
//! maps both, and hands out page contents as owned copies. There is no
//! cache layer above the mapping; the mapping is the cache.

use crate::error::{Result, StorageError};
use crate::page::PageBuf;
use crate::storage::FileHeader;
use crate::types::{PageId, MAX_PAGES, PAGE_SIZE};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Trait for page I/O, kept separate from [`MmapPageManager`] so the
/// B+ tree engine can be exercised against a test double if needed.
pub trait PageManager: Send {
    fn alloc(&mut self) -> Result<PageId>;
    fn free(&mut self, page_id: PageId) -> Result<()>;
    fn read(&self, page_id: PageId) -> Result<PageBuf>;
    fn write(&mut self, page_id: PageId, data: &[u8]) -> Result<()>;
    fn mark_dirty(&mut self);
    fn flush(&mut self) -> Result<()>;
    fn root_page(&self) -> PageId;
    fn set_root_page(&mut self, page_id: PageId) -> Result<()>;
    fn page_count(&self) -> u32;
}

fn sibling_path(path: &Path, extension: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".");
    os.push(extension);
    PathBuf::from(os)
}

fn min_file_size() -> u64 {
    MAX_PAGES as u64 * PAGE_SIZE as u64
}

/// The production [`PageManager`], backed by two memory-mapped files.
pub struct MmapPageManager {
    idx_file: File,
    dat_file: File,
    idx_mmap: MmapMut,
    #[allow(dead_code)]
    dat_mmap: MmapMut,
    header: FileHeader,
    dirty: bool,
}

impl MmapPageManager {
    pub fn open(path: &Path) -> Result<Self> {
        let idx_path = sibling_path(path, "idx");
        let dat_path = sibling_path(path, "dat");

        let idx_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&idx_path)?;
        let dat_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&dat_path)?;

        let min_size = min_file_size();
        if idx_file.metadata()?.len() < min_size {
            idx_file.set_len(min_size)?;
        }
        if dat_file.metadata()?.len() < min_size {
            dat_file.set_len(min_size)?;
        }

        let mut idx_mmap = unsafe { MmapMut::map_mut(&idx_file)? };
        let dat_mmap = unsafe { MmapMut::map_mut(&dat_file)? };

        let existing_magic =
            u32::from_le_bytes([idx_mmap[0], idx_mmap[1], idx_mmap[2], idx_mmap[3]]);
        let header = if existing_magic == 0 {
            let header = FileHeader::new();
            header.write(&mut idx_mmap[0..PAGE_SIZE]);
            header
        } else {
            FileHeader::read(&idx_mmap[0..PAGE_SIZE])?
        };

        let mut manager = Self {
            idx_file,
            dat_file,
            idx_mmap,
            dat_mmap,
            header,
            dirty: true,
        };
        manager.flush()?;
        Ok(manager)
    }

    /// Grow both mappings so page `page_id` is addressable. `open`
    /// already provisions `MAX_PAGES * PAGE_SIZE` up front, so this is
    /// a defensive path rather than one normal operation relies on.
    fn ensure_capacity(&mut self, page_id: PageId) -> Result<()> {
        let needed = (page_id.value() as u64 + 1) * PAGE_SIZE as u64;
        let current = self.idx_mmap.len() as u64;
        if needed <= current {
            return Ok(());
        }
        let new_size = needed.max(current * 2);
        self.idx_file.set_len(new_size)?;
        self.dat_file.set_len(new_size)?;
        self.idx_mmap = unsafe { MmapMut::map_mut(&self.idx_file)? };
        self.dat_mmap = unsafe { MmapMut::map_mut(&self.dat_file)? };
        Ok(())
    }

    fn page_slice(&self, page_id: PageId) -> Result<&[u8]> {
        if page_id.value() >= MAX_PAGES {
            return Err(StorageError::OutOfSpace {
                max_pages: MAX_PAGES,
            });
        }
        let offset = page_id.file_offset(PAGE_SIZE) as usize;
        if offset + PAGE_SIZE > self.idx_mmap.len() {
            return Err(StorageError::PageNotFound(page_id));
        }
        Ok(&self.idx_mmap[offset..offset + PAGE_SIZE])
    }

    fn page_slice_mut(&mut self, page_id: PageId) -> Result<&mut [u8]> {
        if page_id.value() >= MAX_PAGES {
            return Err(StorageError::OutOfSpace {
                max_pages: MAX_PAGES,
            });
        }
        self.ensure_capacity(page_id)?;
        let offset = page_id.file_offset(PAGE_SIZE) as usize;
        Ok(&mut self.idx_mmap[offset..offset + PAGE_SIZE])
    }

    /// Write the header back and sync both mappings, releasing the
    /// mappings and file handles on drop. Kept as an explicit step
    /// (rather than relying solely on `Drop`) so a caller can observe
    /// the final flush's result.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl PageManager for MmapPageManager {
    fn alloc(&mut self) -> Result<PageId> {
        if self.header.free_list_head.is_some() {
            let page_id = self.header.free_list_head;
            let next = {
                let slice = self.page_slice(page_id)?;
                u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]])
            };
            self.header.free_list_head = PageId::new(next);
            self.page_slice_mut(page_id)?.fill(0);
            self.dirty = true;
            return Ok(page_id);
        }

        let page_id = PageId::new(self.header.page_count);
        if page_id.value() >= MAX_PAGES {
            return Err(StorageError::OutOfSpace {
                max_pages: MAX_PAGES,
            });
        }
        self.header.page_count += 1;
        self.page_slice_mut(page_id)?.fill(0);
        self.dirty = true;
        Ok(page_id)
    }

    fn free(&mut self, page_id: PageId) -> Result<()> {
        let previous_head = self.header.free_list_head;
        let slice = self.page_slice_mut(page_id)?;
        slice.fill(0);
        slice[0..4].copy_from_slice(&previous_head.value().to_le_bytes());
        self.header.free_list_head = page_id;
        self.dirty = true;
        Ok(())
    }

    fn read(&self, page_id: PageId) -> Result<PageBuf> {
        Ok(PageBuf::from_bytes(self.page_slice(page_id)?))
    }

    fn write(&mut self, page_id: PageId, data: &[u8]) -> Result<()> {
        self.page_slice_mut(page_id)?.copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.header.write(&mut self.idx_mmap[0..PAGE_SIZE]);
            self.idx_mmap.flush()?;
            self.dat_mmap.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn root_page(&self) -> PageId {
        self.header.root_page
    }

    fn set_root_page(&mut self, page_id: PageId) -> Result<()> {
        self.header.root_page = page_id;
        self.dirty = true;
        Ok(())
    }

    fn page_count(&self) -> u32 {
        self.header.page_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_both_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let _pm = MmapPageManager::open(&path).unwrap();
        assert!(dir.path().join("store.idx").exists());
        assert!(dir.path().join("store.dat").exists());
    }

    #[test]
    fn test_alloc_free_reuses_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let mut pm = MmapPageManager::open(&path).unwrap();

        let a = pm.alloc().unwrap();
        let b = pm.alloc().unwrap();
        assert_ne!(a, b);

        pm.free(b).unwrap();
        let c = pm.alloc().unwrap();
        assert_eq!(b, c);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let mut pm = MmapPageManager::open(&path).unwrap();

        let page_id = pm.alloc().unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[0..5].copy_from_slice(b"hello");
        pm.write(page_id, &data).unwrap();

        let read_back = pm.read(page_id).unwrap();
        assert_eq!(&read_back[0..5], b"hello");
    }

    #[test]
    fn test_reopen_preserves_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        {
            let mut pm = MmapPageManager::open(&path).unwrap();
            let page_id = pm.alloc().unwrap();
            pm.set_root_page(page_id).unwrap();
            pm.close().unwrap();
        }
        {
            let pm = MmapPageManager::open(&path).unwrap();
            assert_eq!(pm.root_page(), PageId::new(1));
            assert_eq!(pm.page_count(), 2);
        }
    }

    #[test]
    fn test_out_of_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let mut pm = MmapPageManager::open(&path).unwrap();
        for _ in 1..MAX_PAGES {
            pm.alloc().unwrap();
        }
        assert!(matches!(
            pm.alloc(),
            Err(StorageError::OutOfSpace { .. })
        ));
    }
}
