use crate::id::Xid;
use crate::status::StatusStore;
use crate::vm::{IsolationLevel, Transaction};

/// Whether the entry `[xmin, xmax]` is visible to `t` under its
/// isolation level. `xmax == 0` (the super-xid) means no deleter.
pub(crate) fn is_visible(
    tss: &StatusStore,
    t: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> anyhow::Result<bool> {
    match t.level {
        IsolationLevel::ReadUncommitted => Ok(true),
        IsolationLevel::ReadCommitted => read_committed(tss, t, xmin, xmax),
        IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
            snapshot_read(tss, t, xmin, xmax)
        }
    }
}

fn read_committed(
    tss: &StatusStore,
    t: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> anyhow::Result<bool> {
    if xmin == t.xid && xmax.is_super() {
        return Ok(true);
    }

    if tss.is_committed(xmin)? {
        if xmax.is_super() {
            return Ok(true);
        }
        if xmax != t.xid && !tss.is_committed(xmax)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Shared by REPEATABLE_READ and SERIALIZABLE; the latter differs only
/// by the global gate, not by what it can see.
fn snapshot_read(
    tss: &StatusStore,
    t: &Transaction,
    xmin: Xid,
    xmax: Xid,
) -> anyhow::Result<bool> {
    if xmin == t.xid && xmax.is_super() {
        return Ok(true);
    }

    if tss.is_committed(xmin)? && xmin < t.xid && !t.in_snapshot(xmin) {
        if xmax.is_super() {
            return Ok(true);
        }
        if xmax != t.xid
            && (!tss.is_committed(xmax)? || xmax > t.xid || t.in_snapshot(xmax))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether a delete by `t` must abort instead of overwriting: the entry
/// was deleted by a transaction `t` is not allowed to stomp on.
/// READ_UNCOMMITTED never conflicts, READ_COMMITTED conflicts with any
/// committed deleter, and the snapshot levels only with a deleter
/// invisible to the snapshot. The asymmetry is intended.
pub(crate) fn is_version_skip(
    tss: &StatusStore,
    t: &Transaction,
    xmax: Xid,
) -> anyhow::Result<bool> {
    if xmax.is_super() {
        return Ok(false);
    }
    match t.level {
        IsolationLevel::ReadUncommitted => Ok(false),
        IsolationLevel::ReadCommitted => tss.is_committed(xmax),
        IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
            Ok(tss.is_committed(xmax)? && (xmax > t.xid || t.in_snapshot(xmax)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SUPER_XID;
    use std::collections::HashSet;

    fn store_with(committed: &[u64], aborted: &[u64], active_up_to: u64) -> StatusStore {
        // the open fd outlives the unlinked scratch directory
        let dir = tempfile::tempdir().unwrap();
        let store = StatusStore::create(dir.path()).unwrap();
        for x in 1..=active_up_to {
            let xid = store.begin().unwrap();
            if committed.contains(&x) {
                store.commit(xid).unwrap();
            } else if aborted.contains(&x) {
                store.abort(xid).unwrap();
            }
        }
        store
    }

    fn txn(xid: u64, level: IsolationLevel, snapshot: &[u64]) -> Transaction {
        let snapshot = match level {
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                Some(snapshot.iter().copied().collect::<HashSet<_>>())
            }
            _ => None,
        };
        Transaction::new(Xid::new(xid), level, snapshot, false)
    }

    #[test]
    fn test_read_uncommitted_sees_everything() {
        let tss = store_with(&[], &[], 3);
        let t = txn(3, IsolationLevel::ReadUncommitted, &[]);
        assert!(is_visible(&tss, &t, Xid::new(1), Xid::new(2)).unwrap());
    }

    #[test]
    fn test_read_committed() {
        let tss = store_with(&[1], &[], 4);
        let t = txn(3, IsolationLevel::ReadCommitted, &[]);

        // committed creator, no deleter
        assert!(is_visible(&tss, &t, Xid::new(1), SUPER_XID).unwrap());
        // own insert, not yet deleted
        assert!(is_visible(&tss, &t, Xid::new(3), SUPER_XID).unwrap());
        // uncommitted foreign creator
        assert!(!is_visible(&tss, &t, Xid::new(2), SUPER_XID).unwrap());
        // deleted by an uncommitted foreign transaction: still visible
        assert!(is_visible(&tss, &t, Xid::new(1), Xid::new(4)).unwrap());
        // deleted by self
        assert!(!is_visible(&tss, &t, Xid::new(1), Xid::new(3)).unwrap());

        let tss = store_with(&[1, 2], &[], 3);
        let t = txn(3, IsolationLevel::ReadCommitted, &[]);
        // deleted by a committed transaction
        assert!(!is_visible(&tss, &t, Xid::new(1), Xid::new(2)).unwrap());
    }

    #[test]
    fn test_snapshot_read() {
        // xid 2 was active when t began; xid 1 committed before
        let tss = store_with(&[1, 2], &[], 4);
        let t = txn(3, IsolationLevel::RepeatableRead, &[2]);

        assert!(is_visible(&tss, &t, Xid::new(1), SUPER_XID).unwrap());
        // creator committed, but was active at t's begin
        assert!(!is_visible(&tss, &t, Xid::new(2), SUPER_XID).unwrap());
        // creator began after t
        assert!(!is_visible(&tss, &t, Xid::new(4), SUPER_XID).unwrap());
        // deleter committed, but began after t: the old version stays
        assert!(is_visible(&tss, &t, Xid::new(1), Xid::new(4)).unwrap());
        // deleter committed, but was in t's snapshot
        assert!(is_visible(&tss, &t, Xid::new(1), Xid::new(2)).unwrap());
        // system records written by the super-xid are always visible
        assert!(is_visible(&tss, &t, SUPER_XID, SUPER_XID).unwrap());
    }

    #[test]
    fn test_version_skip_asymmetry() {
        let tss = store_with(&[1], &[], 4);

        // no deleter never conflicts
        let t = txn(3, IsolationLevel::ReadCommitted, &[]);
        assert!(!is_version_skip(&tss, &t, SUPER_XID).unwrap());

        // read-uncommitted overwrites anything
        let t = txn(3, IsolationLevel::ReadUncommitted, &[]);
        assert!(!is_version_skip(&tss, &t, Xid::new(1)).unwrap());
        // read-committed conflicts with any committed deleter
        let t = txn(3, IsolationLevel::ReadCommitted, &[]);
        assert!(is_version_skip(&tss, &t, Xid::new(1)).unwrap());
        assert!(!is_version_skip(&tss, &t, Xid::new(2)).unwrap());

        // the snapshot levels tolerate a deleter their snapshot saw commit
        let t = txn(3, IsolationLevel::RepeatableRead, &[2]);
        assert!(!is_version_skip(&tss, &t, Xid::new(1)).unwrap());
        let tss2 = store_with(&[1, 2, 4], &[], 4);
        let t = txn(3, IsolationLevel::RepeatableRead, &[2]);
        // deleter in the snapshot
        assert!(is_version_skip(&tss2, &t, Xid::new(2)).unwrap());
        // deleter began after t
        assert!(is_version_skip(&tss2, &t, Xid::new(4)).unwrap());
    }
}
