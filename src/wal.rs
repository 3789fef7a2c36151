use crate::bins::SliceExt;
use crate::id::{Uid, Xid};
use anyhow::anyhow;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::Path;

const WAL_FILE: &str = "wal";

const MAGIC: &[u8; 8] = b"wtip_wal";

const HEADER_SIZE: usize = 32;
const HEADER_MAGIC: Range<usize> = 0..8;
const HEADER_VERSION: Range<usize> = 8..10;
const HEADER_XCHECKSUM: Range<usize> = 10..18;
const HEADER_CRC: Range<usize> = 18..26;

const RECORD_HEAD_SIZE: usize = 12;

const KIND_INSERT: u8 = 0;
const KIND_UPDATE: u8 = 1;

/// One page mutation. Inserts carry the inserted raw record and where it
/// lands; updates carry both byte images so recovery can roll either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LogRecord {
    Insert {
        xid: Xid,
        pgno: u32,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: Uid,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

impl LogRecord {
    pub(crate) fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } => *xid,
            LogRecord::Update { xid, .. } => *xid,
        }
    }

    pub(crate) fn pgno(&self) -> u32 {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => uid.pgno(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                let mut buff = vec![0u8; 1 + 8 + 4 + 2 + raw.len()];
                buff[0] = KIND_INSERT;
                buff[1..9].copy_from_slice(&xid.to_be_bytes());
                buff[9..13].write_u32(*pgno);
                buff[13..15].write_u16(*offset);
                buff[15..].copy_from_slice(raw);
                buff
            }
            LogRecord::Update { xid, uid, old, new } => {
                assert_eq!(old.len(), new.len());
                let mut buff = vec![0u8; 1 + 8 + 8 + 2 + old.len() * 2];
                buff[0] = KIND_UPDATE;
                buff[1..9].copy_from_slice(&xid.to_be_bytes());
                buff[9..17].copy_from_slice(&uid.to_be_bytes());
                buff[17..19].write_u16(old.len() as u16);
                buff[19..19 + old.len()].copy_from_slice(old);
                buff[19 + old.len()..].copy_from_slice(new);
                buff
            }
        }
    }

    fn decode(buff: &[u8]) -> anyhow::Result<Self> {
        match buff.first() {
            Some(&KIND_INSERT) => {
                if buff.len() < 15 {
                    return Err(anyhow!("insert log record is truncated"));
                }
                Ok(LogRecord::Insert {
                    xid: Xid::from_be_bytes(buff[1..9].try_into().unwrap()),
                    pgno: buff[9..].read_u32(),
                    offset: buff[13..].read_u16(),
                    raw: buff[15..].to_vec(),
                })
            }
            Some(&KIND_UPDATE) => {
                if buff.len() < 19 {
                    return Err(anyhow!("update log record is truncated"));
                }
                let len = buff[17..].read_u16() as usize;
                if buff.len() != 19 + len * 2 {
                    return Err(anyhow!("update log record has inconsistent length"));
                }
                Ok(LogRecord::Update {
                    xid: Xid::from_be_bytes(buff[1..9].try_into().unwrap()),
                    uid: Uid::from_be_bytes(buff[9..17].try_into().unwrap()),
                    old: buff[19..19 + len].to_vec(),
                    new: buff[19 + len..].to_vec(),
                })
            }
            _ => Err(anyhow!("unknown log record kind")),
        }
    }
}

struct WalHeader {
    version: u16,
    xchecksum: u64,
}

impl WalHeader {
    fn encode(&self, buff: &mut [u8]) {
        buff[HEADER_MAGIC].copy_from_slice(MAGIC);
        buff[HEADER_VERSION].write_u16(self.version);
        buff[HEADER_XCHECKSUM].write_u64(self.xchecksum);
        let crc = crc64::crc64(0, &buff[..HEADER_CRC.start]);
        buff[HEADER_CRC].write_u64(crc);
    }

    fn decode(buff: &[u8]) -> Option<Self> {
        let crc = crc64::crc64(0, &buff[..HEADER_CRC.start]);
        if crc != buff[HEADER_CRC.start..].read_u64() {
            return None;
        }
        Some(Self {
            version: buff[HEADER_VERSION].read_u16(),
            xchecksum: buff[HEADER_XCHECKSUM].read_u64(),
        })
    }
}

/// Sequential write-ahead log. Every record is `[len:4][crc64:8][payload]`;
/// the header keeps a running checksum over all acknowledged payloads and
/// is written in two copies after each append, so the acknowledged prefix
/// of the log is always recoverable and an unacknowledged tail is
/// truncated at open.
// TODO: reset the log on a clean close; it currently grows for the
// lifetime of the database and recovery replays it from the start.
pub(crate) struct Wal {
    inner: Mutex<WalInner>,
}

struct WalInner {
    f: File,
    xchecksum: u64,
    end: u64,
}

impl Wal {
    pub(crate) fn create(dir: &Path) -> anyhow::Result<Self> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join(WAL_FILE))?;

        let header = WalHeader {
            version: 0,
            xchecksum: 0,
        };
        let mut buff = vec![0u8; 2 * HEADER_SIZE];
        header.encode(&mut buff[..HEADER_SIZE]);
        header.encode(&mut buff[HEADER_SIZE..]);
        f.write_all(&buff)?;
        f.sync_all()?;

        Ok(Self {
            inner: Mutex::new(WalInner {
                f,
                xchecksum: 0,
                end: 2 * HEADER_SIZE as u64,
            }),
        })
    }

    /// Opens the log, truncating any unacknowledged tail, and returns the
    /// acknowledged records in log order for recovery.
    pub(crate) fn open(dir: &Path) -> anyhow::Result<(Self, Vec<LogRecord>)> {
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join(WAL_FILE))?;

        let len = f.metadata()?.len();
        if len < 2 * HEADER_SIZE as u64 {
            return Err(anyhow!("wal file is truncated"));
        }

        let mut header_buff = vec![0u8; 2 * HEADER_SIZE];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut header_buff)?;
        if &header_buff[HEADER_MAGIC] != MAGIC {
            return Err(anyhow!("the file is not a wal file"));
        }
        let header = WalHeader::decode(&header_buff[..HEADER_SIZE])
            .or_else(|| WalHeader::decode(&header_buff[HEADER_SIZE..]))
            .ok_or_else(|| anyhow!("corrupted wal file, both headers are broken"))?;
        if header.version != 0 {
            return Err(anyhow!("unsupported wal version: {}", header.version));
        }

        let mut records = Vec::new();
        let mut running = 0u64;
        let mut pos = 2 * HEADER_SIZE as u64;
        // last record boundary whose running checksum the header vouches for
        let mut acked = if header.xchecksum == 0 {
            Some((0usize, pos))
        } else {
            None
        };

        loop {
            if pos + RECORD_HEAD_SIZE as u64 > len {
                break;
            }
            let mut head = [0u8; RECORD_HEAD_SIZE];
            f.seek(SeekFrom::Start(pos))?;
            f.read_exact(&mut head)?;

            let size = head.as_slice().read_u32() as u64;
            if size == 0 || pos + RECORD_HEAD_SIZE as u64 + size > len {
                break;
            }
            let checksum = head[4..].read_u64();

            let mut payload = vec![0u8; size as usize];
            f.read_exact(&mut payload)?;
            if crc64::crc64(0, &payload) != checksum {
                break;
            }
            let Ok(record) = LogRecord::decode(&payload) else {
                break;
            };

            running = crc64::crc64(running, &payload);
            pos += RECORD_HEAD_SIZE as u64 + size;
            records.push(record);
            if running == header.xchecksum {
                acked = Some((records.len(), pos));
            }
        }

        let Some((count, end)) = acked else {
            return Err(anyhow!("wal running checksum never matches the header"));
        };
        records.truncate(count);

        if end < len {
            log::debug!("truncating {} bytes of unacknowledged wal tail", len - end);
            f.set_len(end)?;
            f.sync_all()?;
        }

        Ok((
            Self {
                inner: Mutex::new(WalInner {
                    f,
                    xchecksum: header.xchecksum,
                    end,
                }),
            },
            records,
        ))
    }

    /// Appends the record and fsyncs before returning; the caller may
    /// only mutate the page after this comes back.
    pub(crate) fn log(&self, record: &LogRecord) -> anyhow::Result<()> {
        let payload = record.encode();
        let checksum = crc64::crc64(0, &payload);

        let mut inner = self.inner.lock();

        let mut buff = vec![0u8; RECORD_HEAD_SIZE + payload.len()];
        buff[0..4].write_u32(payload.len() as u32);
        buff[4..12].write_u64(checksum);
        buff[12..].copy_from_slice(&payload);

        let end = inner.end;
        inner.f.seek(SeekFrom::Start(end))?;
        inner.f.write_all(&buff)?;

        inner.xchecksum = crc64::crc64(inner.xchecksum, &payload);
        let header = WalHeader {
            version: 0,
            xchecksum: inner.xchecksum,
        };
        let mut header_buff = vec![0u8; 2 * HEADER_SIZE];
        header.encode(&mut header_buff[..HEADER_SIZE]);
        header.encode(&mut header_buff[HEADER_SIZE..]);
        inner.f.seek(SeekFrom::Start(0))?;
        inner.f.write_all(&header_buff)?;
        inner.f.sync_all()?;

        inner.end = end + buff.len() as u64;
        Ok(())
    }

    pub(crate) fn sync(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner.f.sync_all()?;
        Ok(())
    }
}
