use crate::bins::SliceExt;
use crate::data::{DataItem, DataManager};
use crate::errors::EngineError;
use crate::id::{Uid, Xid, SUPER_XID};
use crate::locktable::LockTable;
use crate::status::StatusStore;
use crate::visibility::{is_version_skip, is_visible};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Bookkeeping for one live transaction. The error slot poisons the
/// transaction: once set, every later operation fails with the same
/// error without touching storage.
pub(crate) struct Transaction {
    pub(crate) xid: Xid,
    pub(crate) level: IsolationLevel,
    snapshot: Option<HashSet<u64>>,
    start_time: Instant,
    err: Mutex<Option<EngineError>>,
    // resources released and status recorded; guards double cleanup
    // when an auto-abort is followed by the caller's explicit abort
    auto_aborted: AtomicBool,
    holds_gate: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(
        xid: Xid,
        level: IsolationLevel,
        snapshot: Option<HashSet<u64>>,
        holds_gate: bool,
    ) -> Self {
        Self {
            xid,
            level,
            snapshot,
            start_time: Instant::now(),
            err: Mutex::new(None),
            auto_aborted: AtomicBool::new(false),
            holds_gate: AtomicBool::new(holds_gate),
        }
    }

    pub(crate) fn in_snapshot(&self, xid: Xid) -> bool {
        if xid.is_super() {
            return false;
        }
        self.snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.contains(&xid.get()))
    }

    fn check_poisoned(&self) -> anyhow::Result<()> {
        match *self.err.lock() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn poison(&self, err: EngineError) {
        self.err.lock().get_or_insert(err);
    }

    fn error(&self) -> Option<EngineError> {
        *self.err.lock()
    }
}

/// Binary semaphore held by a serializable transaction for its whole
/// lifetime. A plain mutex guard can't cross `begin`/`commit`, so the
/// held state lives in the semaphore itself.
struct SerialGate {
    busy: Mutex<bool>,
    cond: Condvar,
}

impl SerialGate {
    fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.cond.wait(&mut busy);
        }
        *busy = true;
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.cond.notify_one();
    }
}

const ENTRY_XMIN: usize = 0;
const ENTRY_XMAX: usize = 8;
const ENTRY_DATA: usize = 16;

/// An MVCC record: `[xmin:8][xmax:8][payload]` stored as one DataItem.
/// `xmin` is the creator, `xmax` the deleter (0 while alive). Entries
/// are logically deleted in place and only physically removed by an
/// explicit `physical_delete` once nothing can observe them.
pub(crate) struct Entry {
    item: Arc<DataItem>,
}

pub(crate) fn wrap_entry(xid: Xid, data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; ENTRY_DATA + data.len()];
    raw[ENTRY_XMIN..ENTRY_XMAX].copy_from_slice(&xid.to_be_bytes());
    raw[ENTRY_DATA..].copy_from_slice(data);
    raw
}

impl Entry {
    pub(crate) fn xmin(&self) -> Xid {
        self.item
            .with_payload(|payload| Xid::new(payload[ENTRY_XMIN..].read_u64()))
    }

    pub(crate) fn xmax(&self) -> Xid {
        self.item
            .with_payload(|payload| Xid::new(payload[ENTRY_XMAX..].read_u64()))
    }

    pub(crate) fn data(&self) -> Vec<u8> {
        self.item.with_payload(|payload| payload[ENTRY_DATA..].to_vec())
    }

    fn set_xmax(&self, xid: Xid) -> anyhow::Result<()> {
        self.item.modify(xid, |payload| {
            payload[ENTRY_XMAX..ENTRY_DATA].copy_from_slice(&xid.to_be_bytes());
        })
    }
}

/// MVCC layer over the Data Manager: entry wrapping, visibility, the
/// active-transaction table, and write-write conflict serialization
/// through the lock table.
pub struct VersionManager {
    tss: Arc<StatusStore>,
    dm: Arc<DataManager>,
    active: Mutex<IndexMap<u64, Arc<Transaction>>>,
    lock_table: LockTable,
    gate: SerialGate,
    entries: Mutex<HashMap<u64, Weak<Entry>>>,
}

impl VersionManager {
    pub fn new(tss: Arc<StatusStore>, dm: Arc<DataManager>) -> Self {
        let mut active = IndexMap::new();
        // the super transaction is always live so system writes made
        // through the VM resolve like everyone else's
        active.insert(
            SUPER_XID.get(),
            Arc::new(Transaction::new(
                SUPER_XID,
                IsolationLevel::ReadCommitted,
                None,
                false,
            )),
        );

        Self {
            tss,
            dm,
            active: Mutex::new(active),
            lock_table: LockTable::new(),
            gate: SerialGate::new(),
            entries: Mutex::new(HashMap::default()),
        }
    }

    pub fn begin(&self, level: IsolationLevel) -> anyhow::Result<Xid> {
        let holds_gate = level == IsolationLevel::Serializable;
        if holds_gate {
            self.gate.acquire();
        }

        let result = (|| -> anyhow::Result<Xid> {
            let mut active = self.active.lock();
            let xid = self.tss.begin()?;
            let snapshot = match level {
                IsolationLevel::RepeatableRead | IsolationLevel::Serializable => Some(
                    active
                        .keys()
                        .copied()
                        .filter(|&x| x != SUPER_XID.get())
                        .collect(),
                ),
                _ => None,
            };
            let t = Arc::new(Transaction::new(xid, level, snapshot, holds_gate));
            active.insert(xid.get(), t);
            Ok(xid)
        })();

        if result.is_err() && holds_gate {
            self.gate.release();
        }
        result
    }

    pub fn read(&self, xid: Xid, uid: Uid) -> anyhow::Result<Option<Vec<u8>>> {
        let t = self.transaction(xid)?;
        t.check_poisoned()?;

        let Some(entry) = self.load_entry(uid)? else {
            return Ok(None);
        };
        if is_visible(&self.tss, &t, entry.xmin(), entry.xmax())? {
            Ok(Some(entry.data()))
        } else {
            Ok(None)
        }
    }

    pub fn insert(&self, xid: Xid, data: &[u8]) -> anyhow::Result<Uid> {
        let t = self.transaction(xid)?;
        t.check_poisoned()?;

        self.dm.insert(xid, &wrap_entry(xid, data))
    }

    /// Logically deletes the entry. `false` means there was nothing this
    /// transaction could delete: the entry is invisible, gone, or
    /// already deleted by this same transaction.
    pub fn delete(&self, xid: Xid, uid: Uid) -> anyhow::Result<bool> {
        let t = self.transaction(xid)?;
        t.check_poisoned()?;

        let Some(entry) = self.load_entry(uid)? else {
            return Ok(false);
        };
        if !is_visible(&self.tss, &t, entry.xmin(), entry.xmax())? {
            return Ok(false);
        }

        match self.lock_table.add(xid, uid) {
            Ok(None) => {}
            Ok(Some(handle)) => handle.wait(),
            Err(err) => {
                t.poison(EngineError::Deadlock);
                self.intern_abort(xid, true)?;
                return Err(err);
            }
        }

        if entry.xmax() == xid {
            return Ok(false);
        }

        // the deleter we waited on may have committed a version this
        // isolation level is not allowed to overwrite
        if is_version_skip(&self.tss, &t, entry.xmax())? {
            t.poison(EngineError::ConcurrentUpdate);
            self.intern_abort(xid, true)?;
            return Err(EngineError::ConcurrentUpdate.into());
        }

        entry.set_xmax(xid)?;
        Ok(true)
    }

    /// Reclaims an entry no transaction can observe anymore. Not part of
    /// ordinary deletion; the higher layer calls this on table drop.
    pub fn physical_delete(&self, xid: Xid, uid: Uid) -> anyhow::Result<()> {
        let t = self.transaction(xid)?;
        t.check_poisoned()?;

        self.entries.lock().remove(&uid.get());
        self.dm.physical_delete(uid)
    }

    pub fn commit(&self, xid: Xid) -> anyhow::Result<()> {
        if xid.is_super() {
            return Err(EngineError::InvalidStatus.into());
        }
        let t = self.transaction(xid)?;
        if let Some(err) = t.error() {
            return Err(err.into());
        }

        self.active.lock().shift_remove(&xid.get());
        self.lock_table.remove(xid);
        self.tss.commit(xid)?;

        if t.holds_gate.swap(false, Ordering::AcqRel) {
            self.gate.release();
        }
        Ok(())
    }

    pub fn abort(&self, xid: Xid) -> anyhow::Result<()> {
        if xid.is_super() {
            return Err(EngineError::InvalidStatus.into());
        }
        self.intern_abort(xid, false)
    }

    /// Auto-abort (from a conflict inside `delete`) keeps the table
    /// entry so later operations fail fast on the poisoned error; the
    /// caller's explicit abort then only deregisters. Resource release
    /// and the status-store mark happen exactly once either way.
    fn intern_abort(&self, xid: Xid, auto: bool) -> anyhow::Result<()> {
        let t = {
            let mut active = self.active.lock();
            let t = active
                .get(&xid.get())
                .cloned()
                .ok_or(EngineError::UnknownTransaction)?;
            if !auto {
                active.shift_remove(&xid.get());
            }
            t
        };

        if t.holds_gate.swap(false, Ordering::AcqRel) {
            self.gate.release();
        }
        if t.auto_aborted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.lock_table.remove(xid);
        self.tss.abort(xid)?;
        Ok(())
    }

    /// Active transactions older than `max_age`, for a background sweep
    /// that aborts stragglers through the normal abort path.
    pub fn long_running(&self, max_age: Duration) -> Vec<Xid> {
        let active = self.active.lock();
        active
            .values()
            .filter(|t| !t.xid.is_super() && t.start_time.elapsed() > max_age)
            .map(|t| t.xid)
            .collect()
    }

    fn transaction(&self, xid: Xid) -> anyhow::Result<Arc<Transaction>> {
        self.active
            .lock()
            .get(&xid.get())
            .cloned()
            .ok_or_else(|| EngineError::UnknownTransaction.into())
    }

    fn load_entry(&self, uid: Uid) -> anyhow::Result<Option<Arc<Entry>>> {
        {
            let mut entries = self.entries.lock();
            match entries.get(&uid.get()).map(Weak::upgrade) {
                Some(Some(entry)) => return Ok(Some(entry)),
                Some(None) => {
                    entries.remove(&uid.get());
                }
                None => {}
            }
        }

        let Some(item) = self.dm.read(uid)? else {
            return Ok(None);
        };
        let entry = Arc::new(Entry { item });
        self.entries.lock().insert(uid.get(), Arc::downgrade(&entry));
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_engine_error;
    use crate::pager::PAGE_SIZE;
    use std::path::Path;
    use std::time::Duration;

    fn scratch(dir: &Path) -> Arc<VersionManager> {
        let tss = Arc::new(StatusStore::create(dir).unwrap());
        let dm = Arc::new(DataManager::create(dir, 64 * PAGE_SIZE, &tss).unwrap());
        Arc::new(VersionManager::new(tss, dm))
    }

    #[test]
    fn test_committed_insert_is_visible_to_later_reader() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x1, b"A").unwrap();
        // own write visible before commit, invisible to others
        assert_eq!(Some(b"A".to_vec()), vm.read(x1, uid).unwrap());
        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(None, vm.read(x2, uid).unwrap());
        vm.commit(x1).unwrap();

        assert_eq!(Some(b"A".to_vec()), vm.read(x2, uid).unwrap());
        vm.commit(x2).unwrap();
    }

    #[test]
    fn test_read_uncommitted_sees_everything() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let writer = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(writer, b"dirty").unwrap();

        let reader = vm.begin(IsolationLevel::ReadUncommitted).unwrap();
        assert_eq!(Some(b"dirty".to_vec()), vm.read(reader, uid).unwrap());
    }

    #[test]
    fn test_repeatable_read_snapshot_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let x1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(x2, b"late").unwrap();
        vm.commit(x2).unwrap();

        // x2 began after x1, so its insert stays invisible however
        // often x1 looks
        assert_eq!(None, vm.read(x1, uid).unwrap());
        assert_eq!(None, vm.read(x1, uid).unwrap());
        vm.commit(x1).unwrap();

        let x3 = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(Some(b"late".to_vec()), vm.read(x3, uid).unwrap());
    }

    #[test]
    fn test_snapshot_hides_transactions_active_at_begin() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let writer = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(writer, b"concurrent").unwrap();

        let reader = vm.begin(IsolationLevel::RepeatableRead).unwrap();
        // the writer was active when the reader began; committing now
        // must not leak the row into the reader's snapshot
        vm.commit(writer).unwrap();
        assert_eq!(None, vm.read(reader, uid).unwrap());
    }

    #[test]
    fn test_delete_blocks_until_holder_commits() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let setup = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(setup, b"contended").unwrap();
        vm.commit(setup).unwrap();

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x1, uid).unwrap());

        // read-uncommitted tolerates the committed prior deleter, so the
        // handed-over delete succeeds exactly once
        let x2 = vm.begin(IsolationLevel::ReadUncommitted).unwrap();
        let vm2 = vm.clone();
        let blocked = std::thread::spawn(move || vm2.delete(x2, uid));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!blocked.is_finished());

        vm.commit(x1).unwrap();
        assert!(blocked.join().unwrap().unwrap());
        assert!(!vm.delete(x2, uid).unwrap());
        vm.commit(x2).unwrap();
    }

    #[test]
    fn test_committed_deleter_conflicts_under_read_committed() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let setup = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(setup, b"contended").unwrap();
        vm.commit(setup).unwrap();

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x1, uid).unwrap());

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let vm2 = vm.clone();
        let blocked = std::thread::spawn(move || vm2.delete(x2, uid));
        std::thread::sleep(Duration::from_millis(50));
        vm.commit(x1).unwrap();

        let err = blocked.join().unwrap().unwrap_err();
        assert!(is_engine_error(&err, EngineError::ConcurrentUpdate));
        vm.abort(x2).unwrap();
    }

    #[test]
    fn test_delete_returns_false_when_repeated_by_same_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let setup = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(setup, b"once").unwrap();
        vm.commit(setup).unwrap();

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x1, uid).unwrap());
        assert!(!vm.delete(x1, uid).unwrap());
        vm.commit(x1).unwrap();
    }

    #[test]
    fn test_version_skip_aborts_snapshot_writer() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let setup = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let uid = vm.insert(setup, b"row").unwrap();
        vm.commit(setup).unwrap();

        let x1 = vm.begin(IsolationLevel::RepeatableRead).unwrap();

        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x2, uid).unwrap());
        vm.commit(x2).unwrap();

        // x2's committed delete is invisible to x1's snapshot, so x1
        // must abort rather than overwrite it
        let err = vm.delete(x1, uid).unwrap_err();
        assert!(is_engine_error(&err, EngineError::ConcurrentUpdate));

        // poisoned: every later operation fails the same way
        let err = vm.read(x1, uid).unwrap_err();
        assert!(is_engine_error(&err, EngineError::ConcurrentUpdate));
        let err = vm.commit(x1).unwrap_err();
        assert!(is_engine_error(&err, EngineError::ConcurrentUpdate));

        // the explicit abort after the auto-abort is a clean no-op
        vm.abort(x1).unwrap();
        assert!(vm.tss.is_aborted(x1).unwrap());
    }

    #[test]
    fn test_deadlock_poisons_one_victim() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let setup = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let u1 = vm.insert(setup, b"left").unwrap();
        let u2 = vm.insert(setup, b"right").unwrap();
        vm.commit(setup).unwrap();

        let x1 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        let x2 = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(vm.delete(x1, u1).unwrap());
        assert!(vm.delete(x2, u2).unwrap());

        let vm2 = vm.clone();
        let blocked = std::thread::spawn(move || vm2.delete(x1, u2));
        std::thread::sleep(Duration::from_millis(50));

        let err = vm.delete(x2, u1).unwrap_err();
        assert!(is_engine_error(&err, EngineError::Deadlock));
        vm.abort(x2).unwrap();

        // aborting the victim unblocks the survivor
        blocked.join().unwrap().unwrap();
        vm.commit(x1).unwrap();
    }

    #[test]
    fn test_serializable_gate_admits_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let x1 = vm.begin(IsolationLevel::Serializable).unwrap();

        let vm2 = vm.clone();
        let waiting = std::thread::spawn(move || {
            let x2 = vm2.begin(IsolationLevel::Serializable).unwrap();
            vm2.commit(x2).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiting.is_finished());

        vm.commit(x1).unwrap();
        waiting.join().unwrap();
    }

    #[test]
    fn test_long_running_reports_old_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let vm = scratch(dir.path());

        let old = vm.begin(IsolationLevel::ReadCommitted).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(vec![old], vm.long_running(Duration::from_millis(10)));
        assert!(vm.long_running(Duration::from_secs(60)).is_empty());

        // the sweep aborts stragglers through the ordinary path
        for xid in vm.long_running(Duration::from_millis(10)) {
            vm.abort(xid).unwrap();
        }
        assert!(vm.tss.is_aborted(old).unwrap());
    }
}
