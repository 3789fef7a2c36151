use crate::bins::SliceExt;
use crate::data::{DataItem, DataManager};
use crate::id::{Uid, SUPER_XID};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::sync::Arc;

// Node layout: [is_leaf:1][key_count:2][sibling_uid:8] then
// (child_or_record_uid:8, key:8) pairs. In an internal node each key is
// the exclusive upper bound of the child before it, and the rightmost
// spine carries u64::MAX as its bound, so descent never falls off the
// end. Every node is stored at a fixed size with one spare slot, so an
// overflowing insert happens in place before the split.
const OFF_LEAF: usize = 0;
const OFF_COUNT: usize = 1;
const OFF_SIBLING: usize = 3;
const NODE_HEADER: usize = 11;
const ENTRY_SIZE: usize = 16;

const BALANCE: usize = 32;
const CAPACITY: usize = 2 * BALANCE;
const NODE_SIZE: usize = NODE_HEADER + (CAPACITY + 1) * ENTRY_SIZE;

fn is_leaf(raw: &[u8]) -> bool {
    raw[OFF_LEAF] == 1
}

fn count(raw: &[u8]) -> usize {
    raw[OFF_COUNT..].read_u16() as usize
}

fn set_count(raw: &mut [u8], n: usize) {
    raw[OFF_COUNT..].write_u16(n as u16);
}

fn sibling(raw: &[u8]) -> u64 {
    raw[OFF_SIBLING..].read_u64()
}

fn set_sibling(raw: &mut [u8], uid: u64) {
    raw[OFF_SIBLING..].write_u64(uid);
}

fn son_at(raw: &[u8], i: usize) -> u64 {
    raw[NODE_HEADER + i * ENTRY_SIZE..].read_u64()
}

fn key_at(raw: &[u8], i: usize) -> u64 {
    raw[NODE_HEADER + i * ENTRY_SIZE + 8..].read_u64()
}

fn set_entry(raw: &mut [u8], i: usize, son: u64, key: u64) {
    raw[NODE_HEADER + i * ENTRY_SIZE..].write_u64(son);
    raw[NODE_HEADER + i * ENTRY_SIZE + 8..].write_u64(key);
}

fn set_key(raw: &mut [u8], i: usize, key: u64) {
    raw[NODE_HEADER + i * ENTRY_SIZE + 8..].write_u64(key);
}

fn insert_entry(raw: &mut [u8], i: usize, son: u64, key: u64) {
    let n = count(raw);
    let start = NODE_HEADER + i * ENTRY_SIZE;
    let end = NODE_HEADER + n * ENTRY_SIZE;
    raw.copy_within(start..end, start + ENTRY_SIZE);
    set_entry(raw, i, son, key);
    set_count(raw, n + 1);
}

fn remove_entry(raw: &mut [u8], i: usize) {
    let n = count(raw);
    let start = NODE_HEADER + (i + 1) * ENTRY_SIZE;
    let end = NODE_HEADER + n * ENTRY_SIZE;
    raw.copy_within(start..end, start - ENTRY_SIZE);
    set_count(raw, n - 1);
}

fn empty_leaf_raw() -> Vec<u8> {
    let mut raw = vec![0u8; NODE_SIZE];
    raw[OFF_LEAF] = 1;
    raw
}

fn root_raw(left: Uid, right: Uid, key: u64) -> Vec<u8> {
    let mut raw = vec![0u8; NODE_SIZE];
    set_count(&mut raw, 2);
    set_entry(&mut raw, 0, left.get(), key);
    set_entry(&mut raw, 1, right.get(), u64::MAX);
    raw
}

/// Persistent order-preserving index over 64-bit keys, built entirely
/// out of Data-Manager records. The tree is addressed through a boot
/// record holding the current root uid, so replacing the root on a
/// split or a height shrink is one atomic record update.
pub struct BPlusTree {
    dm: Arc<DataManager>,
    boot: Arc<DataItem>,
    boot_lock: Mutex<()>,
}

impl BPlusTree {
    /// Writes an empty leaf root and a boot record pointing at it;
    /// returns the boot uid, which the caller persists as metadata.
    pub fn create(dm: &Arc<DataManager>) -> anyhow::Result<Uid> {
        let root = dm.insert(SUPER_XID, &empty_leaf_raw())?;
        dm.insert(SUPER_XID, &root.to_be_bytes())
    }

    pub fn load(boot_uid: Uid, dm: Arc<DataManager>) -> anyhow::Result<Self> {
        let boot = dm
            .read(boot_uid)?
            .ok_or_else(|| anyhow!("index boot record {} does not exist", boot_uid.get()))?;
        Ok(Self {
            dm,
            boot,
            boot_lock: Mutex::new(()),
        })
    }

    /// Dropping the tree releases the pinned boot record.
    pub fn close(self) {}

    fn root_uid(&self) -> Uid {
        let _boot = self.boot_lock.lock();
        Uid::from_raw(self.boot.with_payload(|payload| payload.read_u64()))
    }

    fn set_root(&self, uid: Uid) -> anyhow::Result<()> {
        let _boot = self.boot_lock.lock();
        self.boot.modify(SUPER_XID, |payload| {
            payload.copy_from_slice(&uid.to_be_bytes());
        })
    }

    fn grow_root(&self, left: Uid, right: Uid, key: u64) -> anyhow::Result<()> {
        let _boot = self.boot_lock.lock();
        let new_root = self.dm.insert(SUPER_XID, &root_raw(left, right, key))?;
        self.boot.modify(SUPER_XID, |payload| {
            payload.copy_from_slice(&new_root.to_be_bytes());
        })
    }

    fn node(&self, uid: Uid) -> anyhow::Result<(Arc<DataItem>, Vec<u8>)> {
        let item = self
            .dm
            .read(uid)?
            .ok_or_else(|| anyhow!("index node {} does not exist", uid.get()))?;
        let raw = item.data();
        Ok((item, raw))
    }

    /// First child whose bound exceeds `key`, following sibling links
    /// when a split pushed the range right since the parent was read.
    fn search_next(&self, mut uid: Uid, key: u64) -> anyhow::Result<Uid> {
        loop {
            let (_item, raw) = self.node(uid)?;
            let next = (0..count(&raw))
                .find(|&i| key < key_at(&raw, i))
                .map(|i| son_at(&raw, i));
            if let Some(next) = next {
                return Ok(Uid::from_raw(next));
            }
            let sib = sibling(&raw);
            if sib == 0 {
                return Err(anyhow!("key {} ran off the index spine", key));
            }
            uid = Uid::from_raw(sib);
        }
    }

    fn search_leaf(&self, mut uid: Uid, key: u64) -> anyhow::Result<Uid> {
        loop {
            let (_item, raw) = self.node(uid)?;
            if is_leaf(&raw) {
                return Ok(uid);
            }
            uid = self.search_next(uid, key)?;
        }
    }

    pub fn search(&self, key: u64) -> anyhow::Result<Vec<Uid>> {
        self.search_range(key, key)
    }

    /// All record uids with `lo <= key <= hi`, in ascending key order.
    pub fn search_range(&self, lo: u64, hi: u64) -> anyhow::Result<Vec<Uid>> {
        let root = self.root_uid();
        let mut leaf = self.search_leaf(root, lo)?;
        let mut uids = Vec::new();
        loop {
            let (_item, raw) = self.node(leaf)?;
            let mut exhausted = true;
            for i in 0..count(&raw) {
                let key = key_at(&raw, i);
                if key < lo {
                    continue;
                }
                if key > hi {
                    exhausted = false;
                    break;
                }
                uids.push(Uid::from_raw(son_at(&raw, i)));
            }
            let sib = sibling(&raw);
            if !exhausted || sib == 0 {
                break;
            }
            leaf = Uid::from_raw(sib);
        }
        Ok(uids)
    }

    pub fn insert(&self, key: u64, uid: Uid) -> anyhow::Result<()> {
        if key == u64::MAX {
            return Err(anyhow!("key {} is reserved as the index bound", u64::MAX));
        }
        let root = self.root_uid();
        if let Some((new_node, new_key)) = self.insert_node(root, key, uid.get())? {
            self.grow_root(root, new_node, new_key)?;
        }
        Ok(())
    }

    fn insert_node(&self, uid: Uid, key: u64, son: u64) -> anyhow::Result<Option<(Uid, u64)>> {
        let (_item, raw) = self.node(uid)?;
        if is_leaf(&raw) {
            self.insert_and_split(uid, key, son)
        } else {
            let next = self.search_next(uid, key)?;
            match self.insert_node(next, key, son)? {
                Some((split_uid, split_key)) => {
                    self.insert_and_split(uid, split_key, split_uid.get())
                }
                None => Ok(None),
            }
        }
    }

    fn insert_and_split(
        &self,
        mut uid: Uid,
        key: u64,
        son: u64,
    ) -> anyhow::Result<Option<(Uid, u64)>> {
        loop {
            let (item, raw) = self.node(uid)?;

            let n = count(&raw);
            if n > 0 && sibling(&raw) != 0 && key > key_at(&raw, n - 1) {
                uid = Uid::from_raw(sibling(&raw));
                continue;
            }

            let mut work = raw.clone();
            node_insert(&mut work, key, son);

            if count(&work) <= CAPACITY {
                item.modify(SUPER_XID, |payload| payload.copy_from_slice(&work))?;
                return Ok(None);
            }

            // split: the right half moves into a fresh sibling first, so
            // a crash in between leaks a node but never loses a key
            let total = count(&work);
            let mut right = vec![0u8; NODE_SIZE];
            right[OFF_LEAF] = work[OFF_LEAF];
            set_count(&mut right, total - BALANCE);
            set_sibling(&mut right, sibling(&work));
            let moved = NODE_HEADER + BALANCE * ENTRY_SIZE..NODE_HEADER + total * ENTRY_SIZE;
            right[NODE_HEADER..NODE_HEADER + (total - BALANCE) * ENTRY_SIZE]
                .copy_from_slice(&work[moved]);
            let split_key = key_at(&right, 0);
            let right_uid = self.dm.insert(SUPER_XID, &right)?;

            set_count(&mut work, BALANCE);
            set_sibling(&mut work, right_uid.get());
            item.modify(SUPER_XID, |payload| payload.copy_from_slice(&work))?;

            return Ok(Some((right_uid, split_key)));
        }
    }

    /// Removes `key` from its owning leaf; `false` if the key is absent.
    pub fn delete(&self, key: u64) -> anyhow::Result<bool> {
        let root = self.root_uid();
        let removed = self.delete_node(root, key)?;
        if removed {
            self.shrink_root()?;
        }
        Ok(removed)
    }

    fn delete_node(&self, uid: Uid, key: u64) -> anyhow::Result<bool> {
        let (item, raw) = self.node(uid)?;
        if is_leaf(&raw) {
            let Some(pos) = (0..count(&raw)).find(|&i| key_at(&raw, i) == key) else {
                return Ok(false);
            };
            let mut work = raw.clone();
            remove_entry(&mut work, pos);
            item.modify(SUPER_XID, |payload| payload.copy_from_slice(&work))?;
            Ok(true)
        } else {
            let next = self.search_next(uid, key)?;
            let removed = self.delete_node(next, key)?;
            if removed {
                self.try_merge_child(uid, next)?;
            }
            Ok(removed)
        }
    }

    /// Folds an underflowing child into its right sibling's entries when
    /// both hang off `parent` and the union fits: the sibling pointer is
    /// rewritten, the parent entry collapsed, and the absorbed node
    /// physically removed.
    fn try_merge_child(&self, parent: Uid, child: Uid) -> anyhow::Result<()> {
        let (parent_item, parent_raw) = self.node(parent)?;
        let (child_item, child_raw) = self.node(child)?;
        if count(&child_raw) >= BALANCE {
            return Ok(());
        }

        let Some(pos) = (0..count(&parent_raw)).find(|&i| son_at(&parent_raw, i) == child.get())
        else {
            return Ok(());
        };
        if pos + 1 >= count(&parent_raw) {
            return Ok(());
        }
        let right_uid = son_at(&parent_raw, pos + 1);
        if sibling(&child_raw) != right_uid {
            return Ok(());
        }

        let (_right_item, right_raw) = self.node(Uid::from_raw(right_uid))?;
        let merged = count(&child_raw) + count(&right_raw);
        if merged > CAPACITY {
            return Ok(());
        }

        let mut work = child_raw.clone();
        for i in 0..count(&right_raw) {
            set_entry(
                &mut work,
                count(&child_raw) + i,
                son_at(&right_raw, i),
                key_at(&right_raw, i),
            );
        }
        set_count(&mut work, merged);
        set_sibling(&mut work, sibling(&right_raw));
        child_item.modify(SUPER_XID, |payload| payload.copy_from_slice(&work))?;

        let mut pwork = parent_raw.clone();
        set_key(&mut pwork, pos, key_at(&parent_raw, pos + 1));
        remove_entry(&mut pwork, pos + 1);
        parent_item.modify(SUPER_XID, |payload| payload.copy_from_slice(&pwork))?;

        self.dm.physical_delete(Uid::from_raw(right_uid))?;
        Ok(())
    }

    /// An internal root left with a single child stops earning its keep:
    /// the boot record is repointed straight at the child.
    fn shrink_root(&self) -> anyhow::Result<()> {
        let root = self.root_uid();
        let (_item, raw) = self.node(root)?;
        if is_leaf(&raw) || count(&raw) != 1 {
            return Ok(());
        }

        let only_child = Uid::from_raw(son_at(&raw, 0));
        self.set_root(only_child)?;
        self.dm.physical_delete(root)?;
        Ok(())
    }

    /// Insert refusing duplicate keys. The table layer keeps its own
    /// uniqueness metadata; this only guards the index itself.
    pub fn insert_unique(&self, key: u64, uid: Uid) -> anyhow::Result<()> {
        if !self.search(key)?.is_empty() {
            return Err(anyhow!("duplicate key {} violates unique constraint", key));
        }
        self.insert(key, uid)
    }

    /// Repoints an existing unique key at a new record.
    pub fn update(&self, key: u64, new_uid: Uid) -> anyhow::Result<()> {
        if self.search(key)?.is_empty() {
            return Err(anyhow!("key {} not found, cannot update", key));
        }
        self.delete(key)?;
        self.insert_unique(key, new_uid)
    }
}

fn node_insert(raw: &mut [u8], key: u64, son: u64) {
    let n = count(raw);
    if is_leaf(raw) {
        // after any equal keys, so duplicates keep insertion order
        let pos = (0..n).find(|&i| key_at(raw, i) > key).unwrap_or(n);
        insert_entry(raw, pos, son, key);
    } else {
        // a child split: the child keeps the range below the split key,
        // the new node takes the rest of the child's old bound
        let pos = (0..n)
            .find(|&i| key < key_at(raw, i))
            .expect("internal node bounds must cover the split key");
        let old_bound = key_at(raw, pos);
        set_key(raw, pos, key);
        insert_entry(raw, pos + 1, son, old_bound);
    }
}
