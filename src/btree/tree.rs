//! The B+ tree engine: descent, search, insert with full split
//! propagation, and delete with full underflow/merge propagation.
//!
//! Every operation reads a page into an owned [`PageBuf`], mutates that
//! copy with the node codec, and writes it back — no reference into the
//! page manager's memory map is ever held across a call that might
//! reallocate, so a split deep in the tree can never invalidate a
//! borrow a caller higher up is still holding.

use crate::error::{Result, StorageError};
use crate::page::{
    init_internal_page, init_leaf_page, internal_child, internal_child0, internal_delete_at,
    internal_descend_index, internal_entries, internal_entry_key, internal_insert_at,
    internal_key, internal_used_bytes, leaf_delete_at, leaf_entries, leaf_entry_key,
    leaf_entry_value, leaf_find, leaf_insert_at, leaf_overwrite_value, leaf_used_bytes,
    leaf_value, NodeHeader, PageBuf, PAYLOAD_CAPACITY,
};
use crate::storage::PageManager;
use crate::types::{PageId, MIN_KEYS_INTERNAL, MIN_KEYS_LEAF};

/// An explicit handle to the tree's root; the rest of the structure
/// lives entirely in the pages a [`PageManager`] hands out.
pub struct BTree {
    root_page: PageId,
}

fn set_parent(pm: &mut dyn PageManager, page_id: PageId, parent: PageId) -> Result<()> {
    let mut buf = pm.read(page_id)?;
    let mut header = NodeHeader::read(&buf);
    header.parent = parent;
    header.write(buf.as_bytes_mut());
    pm.write(page_id, buf.as_bytes())
}

fn merge_leaves(left: &PageBuf, right: &PageBuf) -> Result<PageBuf> {
    let left_header = NodeHeader::read(left);
    let right_header = NodeHeader::read(right);
    let mut merged = left.clone();
    let mut idx = left_header.key_count as usize;
    for entry in leaf_entries(right) {
        let key = leaf_entry_key(right, &entry).to_vec();
        let value = leaf_entry_value(right, &entry).to_vec();
        leaf_insert_at(merged.as_bytes_mut(), idx, &key, &value)?;
        idx += 1;
    }
    let mut header = NodeHeader::read(&merged);
    header.next_leaf = right_header.next_leaf;
    header.write(merged.as_bytes_mut());
    Ok(merged)
}

fn merge_internals(left: &PageBuf, separator: &[u8], right: &PageBuf) -> Result<PageBuf> {
    let left_header = NodeHeader::read(left);
    let mut merged = left.clone();
    let mut idx = left_header.key_count as usize;
    internal_insert_at(merged.as_bytes_mut(), idx, separator, internal_child0(right))?;
    idx += 1;
    for entry in internal_entries(right) {
        let key = internal_entry_key(right, &entry).to_vec();
        internal_insert_at(merged.as_bytes_mut(), idx, &key, entry.child)?;
        idx += 1;
    }
    Ok(merged)
}

fn reparent_all_children(pm: &mut dyn PageManager, node: &PageBuf, new_parent: PageId) -> Result<()> {
    set_parent(pm, internal_child0(node), new_parent)?;
    for entry in internal_entries(node) {
        set_parent(pm, entry.child, new_parent)?;
    }
    Ok(())
}

impl BTree {
    /// Load the tree's current root from the page manager's header.
    pub fn new(pm: &dyn PageManager) -> Self {
        Self {
            root_page: pm.root_page(),
        }
    }

    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    /// Depth of the tree, counting the root as level 1. Zero for an
    /// empty tree.
    pub fn height(&self, pm: &dyn PageManager) -> Result<usize> {
        if !self.root_page.is_some() {
            return Ok(0);
        }
        let mut depth = 1;
        let mut current = self.root_page;
        loop {
            let buf = pm.read(current)?;
            let header = NodeHeader::read(&buf);
            if header.is_leaf {
                return Ok(depth);
            }
            current = internal_child(&buf, 0)?;
            depth += 1;
        }
    }

    pub fn get(&self, pm: &dyn PageManager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.root_page.is_some() {
            return Ok(None);
        }
        let mut current = self.root_page;
        loop {
            let buf = pm.read(current)?;
            let header = NodeHeader::read(&buf);
            if header.is_leaf {
                let (found, idx) = leaf_find(&buf, key);
                return if found {
                    Ok(Some(leaf_value(&buf, idx)?.to_vec()))
                } else {
                    Ok(None)
                };
            }
            let idx = internal_descend_index(&buf, key);
            current = internal_child(&buf, idx)?;
        }
    }

    pub fn put(&mut self, pm: &mut dyn PageManager, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.root_page.is_some() {
            let root_id = pm.alloc()?;
            let mut buf = PageBuf::new();
            init_leaf_page(buf.as_bytes_mut(), PageId::NONE);
            leaf_insert_at(buf.as_bytes_mut(), 0, key, value)?;
            pm.write(root_id, buf.as_bytes())?;
            self.root_page = root_id;
            pm.set_root_page(root_id)?;
            return Ok(());
        }

        if let Some((separator, new_child)) = self.insert_recursive(pm, self.root_page, key, value)? {
            let new_root_id = pm.alloc()?;
            let mut buf = PageBuf::new();
            init_internal_page(buf.as_bytes_mut(), PageId::NONE, self.root_page);
            internal_insert_at(buf.as_bytes_mut(), 0, &separator, new_child)?;
            pm.write(new_root_id, buf.as_bytes())?;

            set_parent(pm, self.root_page, new_root_id)?;
            set_parent(pm, new_child, new_root_id)?;

            self.root_page = new_root_id;
            pm.set_root_page(new_root_id)?;
        }
        Ok(())
    }

    fn insert_recursive(
        &mut self,
        pm: &mut dyn PageManager,
        page_id: PageId,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let buf = pm.read(page_id)?;
        let header = NodeHeader::read(&buf);

        if header.is_leaf {
            return self.insert_into_leaf(pm, page_id, buf, key, value);
        }

        let idx = internal_descend_index(&buf, key);
        let child_id = internal_child(&buf, idx)?;
        let promoted = self.insert_recursive(pm, child_id, key, value)?;
        let Some((separator, new_child)) = promoted else {
            return Ok(None);
        };

        // The new sibling's parent is this node for now; if this node
        // itself splits below, whichever half keeps it is reparented
        // again by `split_internal_and_insert`.
        set_parent(pm, new_child, page_id)?;

        let buf = pm.read(page_id)?;
        let entry_size = separator.len() + 1 + 4;
        if internal_used_bytes(&buf) + entry_size <= PAYLOAD_CAPACITY {
            let mut buf = buf;
            let insert_idx = internal_descend_index(&buf, &separator);
            internal_insert_at(buf.as_bytes_mut(), insert_idx, &separator, new_child)?;
            pm.write(page_id, buf.as_bytes())?;
            return Ok(None);
        }

        self.split_internal_and_insert(pm, page_id, buf, separator, new_child)
    }

    fn insert_into_leaf(
        &mut self,
        pm: &mut dyn PageManager,
        page_id: PageId,
        mut buf: PageBuf,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let header = NodeHeader::read(&buf);
        let (found, idx) = leaf_find(&buf, key);
        if found {
            match leaf_overwrite_value(buf.as_bytes_mut(), idx, value) {
                Ok(()) => {
                    pm.write(page_id, buf.as_bytes())?;
                    return Ok(None);
                }
                Err(StorageError::PageFull { .. }) => {
                    // The new value no longer fits in place; fall through
                    // to the general insert (and possibly split) path.
                    leaf_delete_at(buf.as_bytes_mut(), idx)?;
                }
                Err(other) => return Err(other),
            }
        }

        let (_, insert_idx) = leaf_find(&buf, key);
        let entry_size = key.len() + 1 + 2 + value.len();
        if leaf_used_bytes(&buf) + entry_size <= PAYLOAD_CAPACITY {
            leaf_insert_at(buf.as_bytes_mut(), insert_idx, key, value)?;
            pm.write(page_id, buf.as_bytes())?;
            return Ok(None);
        }

        // Split: merge the existing entries with the new one into a
        // single ordered list, then divide it at a split point derived
        // from the pre-insertion key count.
        let entries = leaf_entries(&buf);
        let mid = entries.len() / 2;
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|e| (leaf_entry_key(&buf, e).to_vec(), leaf_entry_value(&buf, e).to_vec()))
            .collect();
        items.insert(insert_idx, (key.to_vec(), value.to_vec()));

        let new_id = pm.alloc()?;

        let mut old_buf = PageBuf::new();
        init_leaf_page(old_buf.as_bytes_mut(), header.parent);
        for (i, (k, v)) in items[..mid].iter().enumerate() {
            leaf_insert_at(old_buf.as_bytes_mut(), i, k, v)?;
        }
        let mut new_buf = PageBuf::new();
        init_leaf_page(new_buf.as_bytes_mut(), header.parent);
        for (i, (k, v)) in items[mid..].iter().enumerate() {
            leaf_insert_at(new_buf.as_bytes_mut(), i, k, v)?;
        }

        let mut new_header = NodeHeader::read(&new_buf);
        new_header.next_leaf = header.next_leaf;
        new_header.write(new_buf.as_bytes_mut());
        let mut old_header = NodeHeader::read(&old_buf);
        old_header.next_leaf = new_id;
        old_header.write(old_buf.as_bytes_mut());

        let promoted = items[mid].0.clone();

        pm.write(page_id, old_buf.as_bytes())?;
        pm.write(new_id, new_buf.as_bytes())?;

        Ok(Some((promoted, new_id)))
    }

    fn split_internal_and_insert(
        &mut self,
        pm: &mut dyn PageManager,
        page_id: PageId,
        buf: PageBuf,
        separator: Vec<u8>,
        new_child: PageId,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        let header = NodeHeader::read(&buf);
        let entries = internal_entries(&buf);
        let mid = entries.len() / 2;

        let mut children = Vec::with_capacity(entries.len() + 2);
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(entries.len() + 1);
        children.push(internal_child0(&buf));
        for entry in &entries {
            keys.push(internal_entry_key(&buf, entry).to_vec());
            children.push(entry.child);
        }

        let pos = keys.partition_point(|k| k.as_slice() <= separator.as_slice());
        keys.insert(pos, separator);
        children.insert(pos + 1, new_child);

        let promoted = keys[mid].clone();
        let new_internal_id = pm.alloc()?;

        let mut old_buf = PageBuf::new();
        init_internal_page(old_buf.as_bytes_mut(), header.parent, children[0]);
        for i in 0..mid {
            internal_insert_at(old_buf.as_bytes_mut(), i, &keys[i], children[i + 1])?;
        }

        let mut new_buf = PageBuf::new();
        init_internal_page(new_buf.as_bytes_mut(), header.parent, children[mid + 1]);
        for i in (mid + 1)..keys.len() {
            internal_insert_at(new_buf.as_bytes_mut(), i - (mid + 1), &keys[i], children[i + 1])?;
        }

        pm.write(page_id, old_buf.as_bytes())?;
        pm.write(new_internal_id, new_buf.as_bytes())?;

        for &child in &children[mid + 1..] {
            set_parent(pm, child, new_internal_id)?;
        }

        Ok(Some((promoted, new_internal_id)))
    }

    pub fn delete(&mut self, pm: &mut dyn PageManager, key: &[u8]) -> Result<bool> {
        if !self.root_page.is_some() {
            return Ok(false);
        }
        let found = self.delete_recursive(pm, self.root_page, key)?;
        if found {
            self.collapse_root_if_needed(pm)?;
        }
        Ok(found)
    }

    fn collapse_root_if_needed(&mut self, pm: &mut dyn PageManager) -> Result<()> {
        let buf = pm.read(self.root_page)?;
        let header = NodeHeader::read(&buf);
        if header.is_leaf || header.key_count > 0 {
            return Ok(());
        }
        let only_child = internal_child(&buf, 0)?;
        pm.free(self.root_page)?;
        set_parent(pm, only_child, PageId::NONE)?;
        self.root_page = only_child;
        pm.set_root_page(only_child)
    }

    fn delete_recursive(&mut self, pm: &mut dyn PageManager, page_id: PageId, key: &[u8]) -> Result<bool> {
        let buf = pm.read(page_id)?;
        let header = NodeHeader::read(&buf);

        if header.is_leaf {
            let (found, idx) = leaf_find(&buf, key);
            if !found {
                return Ok(false);
            }
            let mut buf = buf;
            leaf_delete_at(buf.as_bytes_mut(), idx)?;
            pm.write(page_id, buf.as_bytes())?;
            return Ok(true);
        }

        let child_pos = internal_descend_index(&buf, key);
        let child_id = internal_child(&buf, child_pos)?;
        if !self.delete_recursive(pm, child_id, key)? {
            return Ok(false);
        }

        self.repair_underflow(pm, page_id, child_pos)?;
        Ok(true)
    }

    /// Called by a node right after recursing into `child_pos`, to merge
    /// that child with a sibling if it fell below the minimum occupancy.
    /// Propagates upward for free: if this merge empties one of this
    /// node's own separators, the caller one level up performs the same
    /// check against this node the next time its own recursive call
    /// returns.
    fn repair_underflow(&mut self, pm: &mut dyn PageManager, parent_id: PageId, child_pos: usize) -> Result<()> {
        let parent_buf = pm.read(parent_id)?;
        let child_id = internal_child(&parent_buf, child_pos)?;
        let child_buf = pm.read(child_id)?;
        let child_header = NodeHeader::read(&child_buf);

        let min_keys = if child_header.is_leaf {
            MIN_KEYS_LEAF
        } else {
            MIN_KEYS_INTERNAL
        };
        if child_header.key_count as usize >= min_keys {
            return Ok(());
        }

        let parent_key_count = NodeHeader::read(&parent_buf).key_count as usize;
        let (left_pos, right_pos) = if child_pos > 0 {
            (child_pos - 1, child_pos)
        } else {
            (child_pos, child_pos + 1)
        };
        if right_pos > parent_key_count {
            // No sibling to merge with; a well-formed non-root internal
            // node always has at least two children, so this branch is
            // unreachable in practice.
            return Ok(());
        }

        let left_id = internal_child(&parent_buf, left_pos)?;
        let right_id = internal_child(&parent_buf, right_pos)?;
        let left_buf = pm.read(left_id)?;
        let right_buf = pm.read(right_id)?;
        let left_is_leaf = NodeHeader::read(&left_buf).is_leaf;

        if left_is_leaf {
            let merged = merge_leaves(&left_buf, &right_buf)?;
            pm.write(left_id, merged.as_bytes())?;
        } else {
            let separator = internal_key(&parent_buf, left_pos)?.to_vec();
            let merged = merge_internals(&left_buf, &separator, &right_buf)?;
            pm.write(left_id, merged.as_bytes())?;
            reparent_all_children(pm, &right_buf, left_id)?;
        }
        pm.free(right_id)?;

        let mut parent_buf = pm.read(parent_id)?;
        internal_delete_at(parent_buf.as_bytes_mut(), left_pos)?;
        pm.write(parent_id, parent_buf.as_bytes())?;
        Ok(())
    }
}
