use crate::bins::SliceExt;
use crate::errors::EngineError;
use crate::id::Xid;
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const STATUS_FILE: &str = "status";

const HEADER_SIZE: u64 = 8;

const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

/// Append-only record of every transaction's final status. An 8-byte
/// big-endian counter of allocated xids, then one status byte per xid;
/// xid `n` lives at offset `8 + n - 1`. The file length must equal
/// `8 + counter` exactly, which is how torn writes are caught at open.
pub struct StatusStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    f: File,
    xid_count: u64,
}

impl StatusStore {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join(STATUS_FILE))?;

        f.write_all(&0u64.to_be_bytes())?;
        f.sync_all()?;

        Ok(Self {
            inner: Mutex::new(StoreInner { f, xid_count: 0 }),
        })
    }

    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(STATUS_FILE))?;

        let len = f.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(anyhow!("status file is truncated"));
        }

        let mut header = [0u8; 8];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut header)?;
        let xid_count = header.as_slice().read_u64();

        if len != HEADER_SIZE + xid_count {
            return Err(anyhow!(
                "status file is corrupted: {} xids recorded but file length is {}",
                xid_count,
                len
            ));
        }

        Ok(Self {
            inner: Mutex::new(StoreInner { f, xid_count }),
        })
    }

    /// Allocates the next xid and records it as active.
    pub fn begin(&self) -> anyhow::Result<Xid> {
        let mut inner = self.inner.lock();

        let xid = inner.xid_count + 1;
        inner
            .f
            .seek(SeekFrom::Start(HEADER_SIZE + xid - 1))?;
        inner.f.write_all(&[STATUS_ACTIVE])?;

        inner.xid_count = xid;
        inner.f.seek(SeekFrom::Start(0))?;
        let count = inner.xid_count;
        inner.f.write_all(&count.to_be_bytes())?;
        inner.f.sync_all()?;

        Ok(Xid::new(xid))
    }

    pub fn commit(&self, xid: Xid) -> anyhow::Result<()> {
        self.transition(xid, STATUS_COMMITTED)
    }

    pub fn abort(&self, xid: Xid) -> anyhow::Result<()> {
        self.transition(xid, STATUS_ABORTED)
    }

    fn transition(&self, xid: Xid, status: u8) -> anyhow::Result<()> {
        // the super transaction's status is immutable
        if xid.is_super() {
            return Err(EngineError::InvalidStatus.into());
        }

        let mut inner = self.inner.lock();
        if Self::read_status(&mut inner, xid)? != STATUS_ACTIVE {
            return Err(EngineError::InvalidStatus.into());
        }

        inner
            .f
            .seek(SeekFrom::Start(HEADER_SIZE + xid.get() - 1))?;
        inner.f.write_all(&[status])?;
        inner.f.sync_all()?;
        Ok(())
    }

    pub fn is_active(&self, xid: Xid) -> anyhow::Result<bool> {
        if xid.is_super() {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        Ok(Self::read_status(&mut inner, xid)? == STATUS_ACTIVE)
    }

    pub fn is_committed(&self, xid: Xid) -> anyhow::Result<bool> {
        if xid.is_super() {
            return Ok(true);
        }
        let mut inner = self.inner.lock();
        Ok(Self::read_status(&mut inner, xid)? == STATUS_COMMITTED)
    }

    pub fn is_aborted(&self, xid: Xid) -> anyhow::Result<bool> {
        if xid.is_super() {
            return Ok(false);
        }
        let mut inner = self.inner.lock();
        Ok(Self::read_status(&mut inner, xid)? == STATUS_ABORTED)
    }

    fn read_status(inner: &mut StoreInner, xid: Xid) -> anyhow::Result<u8> {
        if xid.get() == 0 || xid.get() > inner.xid_count {
            return Err(anyhow!("xid {} was never allocated", xid.get()));
        }

        inner
            .f
            .seek(SeekFrom::Start(HEADER_SIZE + xid.get() - 1))?;
        let mut status = [0u8; 1];
        inner.f.read_exact(&mut status)?;
        Ok(status[0])
    }

    pub fn close(self) -> anyhow::Result<()> {
        let inner = self.inner.into_inner();
        inner.f.sync_all()?;
        Ok(())
    }
}
