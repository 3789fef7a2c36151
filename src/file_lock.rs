use anyhow::anyhow;
use std::fs::File;
use syscalls::{syscall2, Sysno};

/// Exclusive advisory lock on the page file so two processes can't open
/// the same database directory. Held for the life of the file handle.
pub(crate) trait FileLock: Sized {
    fn lock_exclusive(self) -> anyhow::Result<Self>;
}

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
impl FileLock for File {
    fn lock_exclusive(self) -> anyhow::Result<Self> {
        let fd = self.as_raw_fd();
        const LOCK_EX: usize = 0x2;
        const LOCK_NB: usize = 0x4;
        let result = unsafe { syscall2(Sysno::flock, fd as usize, LOCK_EX | LOCK_NB) };
        if let Err(err) = result {
            Err(anyhow!(
                "database is locked by another process (fd={fd} errno={err})"
            ))
        } else {
            Ok(self)
        }
    }
}
