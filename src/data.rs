use crate::bins::SliceExt;
use crate::errors::EngineError;
use crate::file_lock::FileLock;
use crate::id::{Uid, Xid};
use crate::pager::{control, datapage, PageCache, PageHandle, CONTROL_PGNO, PAGE_SIZE};
use crate::recovery::recover;
use crate::status::StatusStore;
use crate::wal::{LogRecord, Wal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Weak};

const STORE_FILE: &str = "store";

const OFF_VALID: usize = 0;
const OFF_SIZE: usize = 1;
const OFF_DATA: usize = 3;

const ALLOC_ATTEMPTS: usize = 5;

/// Wraps a payload as a raw stored record: `[valid=1][len:2][payload]`.
pub(crate) fn wrap_raw(data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; OFF_DATA + data.len()];
    raw[OFF_VALID] = 1;
    raw[OFF_SIZE..OFF_DATA].write_u16(data.len() as u16);
    raw[OFF_DATA..].copy_from_slice(data);
    raw
}

/// Clears a stored record's valid flag in place. Recovery uses this to
/// revert an insert whose transaction never committed.
pub(crate) fn set_raw_invalid(page_data: &mut [u8], offset: u16) {
    page_data[offset as usize + OFF_VALID] = 0;
}

/// A parsed record handle. Holding one pins the owning page; dropping
/// the last handle for a uid releases it. All mutation goes through
/// [`DataItem::modify`], which brackets the change between an old-image
/// snapshot and the update log record with the page locked throughout.
pub struct DataItem {
    uid: Uid,
    page: PageHandle,
    offset: u16,
    len: u16,
    wal: Arc<Wal>,
}

impl DataItem {
    pub fn uid(&self) -> Uid {
        self.uid
    }

    /// Copies the payload out.
    pub fn data(&self) -> Vec<u8> {
        self.with_payload(|payload| payload.to_vec())
    }

    pub(crate) fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.page.data();
        let start = self.offset as usize + OFF_DATA;
        f(&data[start..start + self.len as usize])
    }

    /// The before/after mutation bracket: with the page write-locked,
    /// snapshot the old raw bytes, let `f` rewrite the payload, then
    /// append the update record. A failed log append restores the old
    /// bytes so the page never carries an unlogged mutation.
    pub(crate) fn modify(&self, xid: Xid, f: impl FnOnce(&mut [u8])) -> anyhow::Result<()> {
        let mut data = self.page.data_mut();
        let start = self.offset as usize;
        let end = start + OFF_DATA + self.len as usize;

        let old = data[start..end].to_vec();
        f(&mut data[start + OFF_DATA..end]);
        let new = data[start..end].to_vec();

        let result = self.wal.log(&LogRecord::Update {
            xid,
            uid: self.uid,
            old: old.clone(),
            new,
        });
        if result.is_err() {
            data[start..end].copy_from_slice(&old);
        }
        result
    }
}

/// In-memory map from coarse free-space buckets to candidate pages.
/// `select` removes its pick so two inserts never fill the same page at
/// once; the page is re-added once the insert settles. Rebuilt from page
/// contents on every open, never persisted.
pub(crate) struct FreeSpaceIndex {
    buckets: Mutex<Vec<Vec<u32>>>,
}

const BUCKETS: usize = 40;
const BUCKET_WIDTH: usize = PAGE_SIZE / BUCKETS;

impl FreeSpaceIndex {
    pub(crate) fn new() -> Self {
        Self {
            buckets: Mutex::new(vec![Vec::new(); BUCKETS + 1]),
        }
    }

    pub(crate) fn add(&self, pgno: u32, free_space: usize) {
        let bucket = free_space / BUCKET_WIDTH;
        self.buckets.lock()[bucket].push(pgno);
    }

    pub(crate) fn select(&self, size: usize) -> Option<u32> {
        let mut bucket = size / BUCKET_WIDTH;
        if bucket < BUCKETS {
            bucket += 1;
        }
        let mut buckets = self.buckets.lock();
        for candidates in &mut buckets[bucket..] {
            if let Some(pgno) = candidates.pop() {
                return Some(pgno);
            }
        }
        None
    }
}

/// Record-level storage over the page file: byte payloads in, stable
/// uids out, durability through the write-ahead log.
pub struct DataManager {
    pool: Arc<PageCache>,
    wal: Arc<Wal>,
    free: FreeSpaceIndex,
    items: Mutex<HashMap<u64, Weak<DataItem>>>,
    control: PageHandle,
}

impl DataManager {
    pub fn create(dir: &Path, mem: usize, _tss: &StatusStore) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join(STORE_FILE))?
            .lock_exclusive()?;
        let pool = Arc::new(PageCache::new(f, mem)?);
        let wal = Arc::new(Wal::create(dir)?);

        let pgno = pool.new_page(&control::init_raw())?;
        assert_eq!(CONTROL_PGNO, pgno);
        let control_page = pool.get(pgno)?;
        control::stamp_open(&control_page);
        pool.flush_page(&control_page)?;

        Ok(Self {
            pool,
            wal,
            free: FreeSpaceIndex::new(),
            items: Mutex::new(HashMap::default()),
            control: control_page,
        })
    }

    pub fn open(dir: &Path, mem: usize, tss: &StatusStore) -> anyhow::Result<Self> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(STORE_FILE))?
            .lock_exclusive()?;
        let pool = Arc::new(PageCache::new(f, mem)?);
        let (wal, records) = Wal::open(dir)?;

        let control_page = pool.get(CONTROL_PGNO)?;
        if !control::is_clean(&control_page) {
            log::debug!("previous shutdown was not clean, replaying the log");
            recover(tss, &records, &pool)?;
        }
        drop(records);

        let free = FreeSpaceIndex::new();
        for pgno in CONTROL_PGNO + 1..=pool.page_count() {
            let page = pool.get(pgno)?;
            let space = datapage::free_space(&page.data());
            free.add(pgno, space);
        }

        control::stamp_open(&control_page);
        pool.flush_page(&control_page)?;

        Ok(Self {
            pool,
            wal: Arc::new(wal),
            free,
            items: Mutex::new(HashMap::default()),
            control: control_page,
        })
    }

    /// Loads the record at `uid`, or `None` if its slot is dead.
    pub fn read(&self, uid: Uid) -> anyhow::Result<Option<Arc<DataItem>>> {
        {
            let mut items = self.items.lock();
            match items.get(&uid.get()).map(Weak::upgrade) {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => {
                    items.remove(&uid.get());
                }
                None => {}
            }
        }

        let page = self.pool.get(uid.pgno())?;
        let (valid, len) = {
            let data = page.data();
            let off = uid.offset() as usize;
            (data[off + OFF_VALID] == 1, data[off + OFF_SIZE..].read_u16())
        };
        if !valid {
            return Ok(None);
        }

        let item = Arc::new(DataItem {
            uid,
            page,
            offset: uid.offset(),
            len,
            wal: self.wal.clone(),
        });
        self.items.lock().insert(uid.get(), Arc::downgrade(&item));
        Ok(Some(item))
    }

    /// Stores a payload on behalf of `xid` and returns its uid. The
    /// selected page returns to the free-space index on every path, so
    /// a failed insert never loses a page from circulation.
    pub fn insert(&self, xid: Xid, data: &[u8]) -> anyhow::Result<Uid> {
        let raw = wrap_raw(data);
        if raw.len() > datapage::MAX_FREE_SPACE {
            return Err(EngineError::DataTooLarge.into());
        }

        for _ in 0..ALLOC_ATTEMPTS {
            let Some(pgno) = self.free.select(raw.len()) else {
                let pgno = self.pool.new_page(&datapage::init_raw())?;
                self.free.add(pgno, datapage::MAX_FREE_SPACE);
                continue;
            };

            let page = self.pool.get(pgno)?;
            let mut data = page.data_mut();

            // re-registration on physical delete can leave stale index
            // entries that overstate a page's room; verify under the
            // page lock, refile and retry
            let space = datapage::free_space(&data);
            if space < raw.len() {
                drop(data);
                drop(page);
                self.free.add(pgno, space);
                continue;
            }

            let offset = datapage::fso(&data);
            let logged = self.wal.log(&LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw: raw.clone(),
            });
            if let Err(err) = logged {
                drop(data);
                self.free.add(pgno, 0);
                return Err(err);
            }

            let offset = datapage::insert(&mut data, &raw);
            let space = datapage::free_space(&data);
            drop(data);
            self.free.add(pgno, space);
            return Ok(Uid::new(pgno, offset));
        }

        Err(EngineError::Busy.into())
    }

    /// Zero-fills the record's bytes in place, without logging. Only for
    /// records that are already logically dead and unreachable.
    pub fn physical_delete(&self, uid: Uid) -> anyhow::Result<()> {
        self.items.lock().remove(&uid.get());

        let page = self.pool.get(uid.pgno())?;
        let free_space = {
            let mut data = page.data_mut();
            let off = uid.offset() as usize;
            let len = data[off + OFF_SIZE..].read_u16() as usize;
            data[off..off + OFF_DATA + len].fill(0);
            datapage::free_space(&data)
        };
        self.free.add(uid.pgno(), free_space);
        Ok(())
    }

    /// Flushes everything and stamps the control page clean, in that
    /// order; the clean marker must be the last write to hit disk.
    pub fn close(&self) -> anyhow::Result<()> {
        self.wal.sync()?;
        self.pool.flush_all()?;
        control::stamp_clean(&self.control);
        self.pool.flush_page(&self.control)?;
        Ok(())
    }
}
