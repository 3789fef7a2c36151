use crate::data::set_raw_invalid;
use crate::pager::{datapage, PageCache, CONTROL_PGNO};
use crate::status::StatusStore;
use crate::wal::LogRecord;
use std::collections::HashSet;
use std::sync::Arc;

/// Replays the log against the page file after an unclean shutdown.
///
/// Forward pass: re-apply every record of a committed or still-active
/// transaction, in log order, since the crash may have happened between
/// the log append and the page write. Backward pass: revert every record
/// of a transaction left active (inserts get their valid flag cleared,
/// updates get their old image back) and mark those transactions aborted.
/// Records of transactions aborted before the crash are replayed neither
/// way: their versions are masked by the status store, and rewriting
/// their old images could clobber a later committed write to the same
/// record.
pub(crate) fn recover(
    tss: &StatusStore,
    records: &[LogRecord],
    pool: &Arc<PageCache>,
) -> anyhow::Result<()> {
    log::debug!("recovering from {} log records", records.len());

    let max_pgno = records
        .iter()
        .map(LogRecord::pgno)
        .max()
        .unwrap_or(CONTROL_PGNO);
    if pool.page_count() < max_pgno {
        pool.truncate(max_pgno)?;
    }

    let mut committed = HashSet::new();
    let mut active = HashSet::new();
    for record in records {
        let xid = record.xid();
        if committed.contains(&xid) || active.contains(&xid) {
            continue;
        }
        if tss.is_committed(xid)? {
            committed.insert(xid);
        } else if tss.is_active(xid)? {
            active.insert(xid);
        }
    }

    for record in records {
        let xid = record.xid();
        if !committed.contains(&xid) && !active.contains(&xid) {
            continue;
        }
        match record {
            LogRecord::Insert {
                pgno, offset, raw, ..
            } => {
                let page = pool.get(*pgno)?;
                datapage::recover_insert(&mut page.data_mut(), raw, *offset);
            }
            LogRecord::Update { uid, new, .. } => {
                let page = pool.get(uid.pgno())?;
                datapage::recover_write(&mut page.data_mut(), new, uid.offset());
            }
        }
    }

    for record in records.iter().rev() {
        if !active.contains(&record.xid()) {
            continue;
        }
        match record {
            LogRecord::Insert { pgno, offset, .. } => {
                let page = pool.get(*pgno)?;
                set_raw_invalid(&mut page.data_mut(), *offset);
            }
            LogRecord::Update { uid, old, .. } => {
                let page = pool.get(uid.pgno())?;
                datapage::recover_write(&mut page.data_mut(), old, uid.offset());
            }
        }
    }

    for xid in &active {
        log::debug!("aborting transaction {} left active by the crash", xid.get());
        tss.abort(*xid)?;
    }

    pool.flush_all()?;
    Ok(())
}
