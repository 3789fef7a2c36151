use crate::bins::SliceExt;
use crate::errors::EngineError;
use anyhow::anyhow;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) const PAGE_SIZE: usize = 8192;

/// Page 1 carries the clean-shutdown marker and no records.
pub(crate) const CONTROL_PGNO: u32 = 1;

const MINIMUM_CACHED_PAGES: usize = 10;

/// A fixed-size page pinned in the buffer pool. The byte buffer sits
/// behind its own lock so a mutation bracket can hold the page for the
/// whole snapshot-apply-log sequence; taking the write guard marks the
/// page dirty.
pub(crate) struct Page {
    pgno: u32,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

impl Page {
    fn new(pgno: u32, data: Box<[u8]>) -> Self {
        Self {
            pgno,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn pgno(&self) -> u32 {
        self.pgno
    }

    pub(crate) fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }

    pub(crate) fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.dirty.store(true, Ordering::Release);
        self.data.write()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Reference-counted page guard. Constructing one is the only way to
/// reach page bytes; dropping it releases the frame, so every exit path
/// unpins deterministically.
pub(crate) struct PageHandle {
    pool: Arc<PageCache>,
    page: Arc<Page>,
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle").finish_non_exhaustive()
    }
}

impl std::ops::Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pool.release(self.page.pgno);
    }
}

/// Fixed-capacity cache of pages backed by the single page file. Frames
/// stay cached after their reference count drops to zero and are only
/// evicted under capacity pressure; if every frame is pinned the pool
/// reports busy instead of silently dropping anything.
pub(crate) struct PageCache {
    f: Mutex<File>,
    capacity: usize,
    inner: Mutex<PoolInner>,
    loaded: Condvar,
}

struct PoolInner {
    frames: HashMap<u32, Frame>,
    loading: HashSet<u32>,
    page_count: u32,
}

struct Frame {
    page: Arc<Page>,
    refs: usize,
}

impl PageCache {
    pub(crate) fn new(f: File, mem: usize) -> anyhow::Result<Self> {
        let capacity = mem / PAGE_SIZE;
        if capacity < MINIMUM_CACHED_PAGES {
            return Err(anyhow!(
                "memory budget must cover at least {} pages, but covers {}",
                MINIMUM_CACHED_PAGES,
                capacity
            ));
        }

        let len = f.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(anyhow!("page file length {} is not page aligned", len));
        }
        let page_count = (len / PAGE_SIZE as u64) as u32;

        Ok(Self {
            f: Mutex::new(f),
            capacity,
            inner: Mutex::new(PoolInner {
                frames: HashMap::default(),
                loading: HashSet::default(),
                page_count,
            }),
            loaded: Condvar::new(),
        })
    }

    pub(crate) fn page_count(&self) -> u32 {
        self.inner.lock().page_count
    }

    /// Appends a page initialized with `init` and writes it to disk
    /// immediately; the new page is not cached until first `get`.
    pub(crate) fn new_page(&self, init: &[u8]) -> anyhow::Result<u32> {
        assert_eq!(PAGE_SIZE, init.len());

        let pgno = {
            let mut inner = self.inner.lock();
            inner.page_count += 1;
            inner.page_count
        };

        let mut f = self.f.lock();
        write_page(&mut f, pgno, init)?;
        f.sync_all()?;
        Ok(pgno)
    }

    pub(crate) fn get(self: &Arc<Self>, pgno: u32) -> anyhow::Result<PageHandle> {
        let mut inner = self.inner.lock();
        loop {
            if inner.loading.contains(&pgno) {
                self.loaded.wait(&mut inner);
                continue;
            }

            if let Some(frame) = inner.frames.get_mut(&pgno) {
                frame.refs += 1;
                return Ok(PageHandle {
                    pool: self.clone(),
                    page: frame.page.clone(),
                });
            }

            if pgno == 0 || pgno > inner.page_count {
                return Err(anyhow!("page {} does not exist", pgno));
            }

            if inner.frames.len() >= self.capacity {
                self.evict(&mut inner)?;
            }
            inner.loading.insert(pgno);
            break;
        }
        drop(inner);

        let loaded = self.read_page(pgno);

        let mut inner = self.inner.lock();
        inner.loading.remove(&pgno);
        self.loaded.notify_all();

        let data = loaded?;
        let page = Arc::new(Page::new(pgno, data));
        inner.frames.insert(
            pgno,
            Frame {
                page: page.clone(),
                refs: 1,
            },
        );
        Ok(PageHandle {
            pool: self.clone(),
            page,
        })
    }

    // TODO: prefer clean frames when picking a victim so the miss path
    // doesn't pay for a flush.
    fn evict(&self, inner: &mut PoolInner) -> anyhow::Result<()> {
        let Some(victim) = inner
            .frames
            .iter()
            .find(|(_, frame)| frame.refs == 0)
            .map(|(pgno, _)| *pgno)
        else {
            return Err(EngineError::Busy.into());
        };

        let frame = inner.frames.remove(&victim).unwrap();
        if frame.page.is_dirty() {
            self.flush_page(&frame.page)?;
        }
        Ok(())
    }

    fn release(&self, pgno: u32) {
        let mut inner = self.inner.lock();
        let frame = inner
            .frames
            .get_mut(&pgno)
            .expect("released page must be cached");
        assert!(frame.refs > 0);
        frame.refs -= 1;
    }

    fn read_page(&self, pgno: u32) -> anyhow::Result<Box<[u8]>> {
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let mut f = self.f.lock();
        f.seek(SeekFrom::Start((pgno as u64 - 1) * PAGE_SIZE as u64))?;
        f.read_exact(&mut data)?;
        Ok(data)
    }

    pub(crate) fn flush_page(&self, page: &Page) -> anyhow::Result<()> {
        let data = page.data();
        let mut f = self.f.lock();
        write_page(&mut f, page.pgno, &data)?;
        f.sync_all()?;
        page.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub(crate) fn flush_all(&self) -> anyhow::Result<()> {
        let pages = {
            let inner = self.inner.lock();
            inner
                .frames
                .values()
                .filter(|frame| frame.page.is_dirty())
                .map(|frame| frame.page.clone())
                .collect::<Vec<_>>()
        };
        for page in pages {
            self.flush_page(&page)?;
        }
        Ok(())
    }

    /// Grows or shrinks the file to exactly `page_count` pages. Recovery
    /// uses this to make every page the log mentions addressable.
    pub(crate) fn truncate(&self, page_count: u32) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.page_count = page_count;
        let f = self.f.lock();
        f.set_len(page_count as u64 * PAGE_SIZE as u64)?;
        f.sync_all()?;
        Ok(())
    }

    pub(crate) fn close(&self) -> anyhow::Result<()> {
        self.flush_all()
    }
}

fn write_page(f: &mut File, pgno: u32, data: &[u8]) -> anyhow::Result<()> {
    f.seek(SeekFrom::Start((pgno as u64 - 1) * PAGE_SIZE as u64))?;
    f.write_all(data)?;
    Ok(())
}

/// Control page: bytes 100..108 are stamped with fresh random bytes on
/// every open and copied to 108..116 on clean close. A mismatch at open
/// means the previous shutdown never finished and recovery must run.
pub(crate) mod control {
    use super::{Page, PAGE_SIZE};
    use rand::RngCore;
    use std::ops::Range;

    const VC_OPEN: Range<usize> = 100..108;
    const VC_CLEAN: Range<usize> = 108..116;

    pub(crate) fn init_raw() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    pub(crate) fn stamp_open(page: &Page) {
        let mut stamp = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut stamp);
        page.data_mut()[VC_OPEN].copy_from_slice(&stamp);
    }

    pub(crate) fn stamp_clean(page: &Page) {
        let mut data = page.data_mut();
        let stamp: [u8; 8] = data[VC_OPEN].try_into().unwrap();
        data[VC_CLEAN].copy_from_slice(&stamp);
    }

    pub(crate) fn is_clean(page: &Page) -> bool {
        let data = page.data();
        data[VC_OPEN] == data[VC_CLEAN]
    }
}

/// Data pages: a 2-byte big-endian free-space offset (the first unused
/// byte) followed by packed records. Records are never moved once
/// written, so an in-page offset is stable for the record's lifetime.
pub(crate) mod datapage {
    use super::{SliceExt, PAGE_SIZE};
    use std::ops::Range;

    const FSO: Range<usize> = 0..2;
    pub(crate) const HEADER_SIZE: usize = 2;
    pub(crate) const MAX_FREE_SPACE: usize = PAGE_SIZE - HEADER_SIZE;

    pub(crate) fn init_raw() -> Vec<u8> {
        let mut raw = vec![0u8; PAGE_SIZE];
        raw[FSO].write_u16(HEADER_SIZE as u16);
        raw
    }

    pub(crate) fn fso(data: &[u8]) -> u16 {
        data[FSO].read_u16()
    }

    fn set_fso(data: &mut [u8], offset: u16) {
        data[FSO].write_u16(offset);
    }

    pub(crate) fn free_space(data: &[u8]) -> usize {
        PAGE_SIZE - fso(data) as usize
    }

    /// Appends `raw` at the free-space offset, returns where it landed.
    pub(crate) fn insert(data: &mut [u8], raw: &[u8]) -> u16 {
        let offset = fso(data);
        data[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        set_fso(data, offset + raw.len() as u16);
        offset
    }

    /// Redo of an insert: the record goes back to its logged offset and
    /// the free-space offset only ever moves forward.
    pub(crate) fn recover_insert(data: &mut [u8], raw: &[u8], offset: u16) {
        data[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
        let end = offset + raw.len() as u16;
        if fso(data) < end {
            set_fso(data, end);
        }
    }

    /// Redo/undo of an update: rewrite an image in place.
    pub(crate) fn recover_write(data: &mut [u8], raw: &[u8], offset: u16) {
        data[offset as usize..offset as usize + raw.len()].copy_from_slice(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::is_engine_error;
    use std::fs::OpenOptions;

    fn scratch_pool(dir: &std::path::Path, mem: usize) -> Arc<PageCache> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join("store"))
            .unwrap();
        Arc::new(PageCache::new(f, mem).unwrap())
    }

    #[test]
    fn test_page_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = scratch_pool(dir.path(), 32 * PAGE_SIZE);

        let mut init = datapage::init_raw();
        init[100] = 0xab;
        let pgno = pool.new_page(&init).unwrap();
        assert_eq!(1, pgno);

        let page = pool.get(pgno).unwrap();
        assert_eq!(0xab, page.data()[100]);
        page.data_mut()[101] = 0xcd;
        assert!(page.is_dirty());
        drop(page);

        pool.flush_all().unwrap();
        let page = pool.get(pgno).unwrap();
        assert_eq!(0xcd, page.data()[101]);
    }

    #[test]
    fn test_all_pinned_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let pool = scratch_pool(dir.path(), 10 * PAGE_SIZE);

        for _ in 0..11 {
            pool.new_page(&datapage::init_raw()).unwrap();
        }

        let mut pinned = Vec::new();
        for pgno in 1..=10 {
            pinned.push(pool.get(pgno).unwrap());
        }

        let err = pool.get(11).unwrap_err();
        assert!(is_engine_error(&err, EngineError::Busy));

        // releasing one frame makes room again
        pinned.pop();
        pool.get(11).unwrap();
    }

    #[test]
    fn test_eviction_flushes_dirty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pool = scratch_pool(dir.path(), 10 * PAGE_SIZE);

        for _ in 0..12 {
            pool.new_page(&datapage::init_raw()).unwrap();
        }

        {
            let page = pool.get(3).unwrap();
            page.data_mut()[50] = 0x77;
        }
        // churn through enough pages to force page 3 out
        for pgno in [1, 2, 4, 5, 6, 7, 8, 9, 10, 11, 12] {
            drop(pool.get(pgno).unwrap());
        }

        let page = pool.get(3).unwrap();
        assert_eq!(0x77, page.data()[50]);
    }

    #[test]
    fn test_datapage_layout() {
        let mut raw = datapage::init_raw();
        assert_eq!(datapage::MAX_FREE_SPACE, datapage::free_space(&raw));

        let off = datapage::insert(&mut raw, b"hello");
        assert_eq!(datapage::HEADER_SIZE as u16, off);
        assert_eq!(datapage::MAX_FREE_SPACE - 5, datapage::free_space(&raw));
        assert_eq!(b"hello", &raw[off as usize..off as usize + 5]);

        // recover_insert past the current end moves the offset forward
        let mut fresh = datapage::init_raw();
        datapage::recover_insert(&mut fresh, b"hello", off);
        assert_eq!(datapage::fso(&raw), datapage::fso(&fresh));
    }

    #[test]
    fn test_control_page_stamps() {
        let page = Page::new(CONTROL_PGNO, control::init_raw().into_boxed_slice());
        assert!(control::is_clean(&page));

        control::stamp_open(&page);
        assert!(!control::is_clean(&page));

        control::stamp_clean(&page);
        assert!(control::is_clean(&page));
    }
}
