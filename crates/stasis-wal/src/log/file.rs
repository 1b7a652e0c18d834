//! File-backed log.
//!
//! Layout:
//!
//! ```text
//! +--------------+-------------+----------------+---------+---------+-----
//! | magic (u32)  | version u32 | base LSN (u64) | frame 0 | frame 1 | ...
//! +--------------+-------------+----------------+---------+---------+-----
//! ```
//!
//! The frame at file offset `HEADER_SIZE + n` has LSN `base + n`. Entries
//! are staged in an in-memory tail and written out when the tail grows past
//! the write buffer size or when the log is forced.
//!
//! Forces are grouped: one caller becomes the leader, writes the whole tail
//! and syncs it with no lock held, while later callers wait for that sync
//! and return without one of their own if it covered their LSN. Reads of
//! entries already in the file use positioned reads outside the lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Condvar, Mutex};
use stasis_common::types::Lsn;
use tracing::{debug, info, trace, warn};

use super::LogHandle;
use crate::config::LogConfig;
use crate::entry::codec::{self, FRAME_HEADER_SIZE};
use crate::entry::LogEntry;
use crate::error::{WalError, WalResult};

const LOG_MAGIC: u32 = 0x5354_4C47; // "STLG"
const LOG_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 16;

struct FileLogInner {
    /// Swapped out whole on truncation; readers keep the old handle alive.
    file: Arc<File>,
    /// LSN of the first byte after the header.
    base_lsn: Lsn,
    /// Everything below this LSN is in the file.
    written_lsn: Lsn,
    /// Frames from `written_lsn` up to `next_lsn`, not yet in the file.
    pending: BytesMut,
    next_lsn: Lsn,
}

impl FileLogInner {
    fn offset_of(&self, lsn: Lsn) -> u64 {
        HEADER_SIZE + (lsn.as_u64() - self.base_lsn.as_u64())
    }

    fn write_pending(&mut self) -> WalResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let offset = self.offset_of(self.written_lsn);
        write_all_at(&self.file, &self.pending, offset)?;
        self.written_lsn = self.next_lsn;
        self.pending.clear();
        Ok(())
    }
}

/// Durability state, kept apart from the append lock so appends continue
/// while a sync is in flight.
struct SyncState {
    /// Everything below this LSN has been synced.
    flushed_lsn: Lsn,
    /// A leader is writing and syncing the tail.
    syncing: bool,
    /// Completed leader rounds.
    syncs: u64,
}

/// A log stored in a single file.
pub struct FileLog {
    path: PathBuf,
    config: LogConfig,
    inner: Mutex<FileLogInner>,
    sync: Mutex<SyncState>,
    synced: Condvar,
}

impl FileLog {
    /// Opens the log at `path`, creating it if it does not exist.
    ///
    /// A partially written final frame (from a crash mid-append) is cut off.
    pub fn open(path: impl AsRef<Path>, config: LogConfig) -> WalResult<Self> {
        config.validate().map_err(WalError::config)?;
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let base_lsn = if file.metadata()?.len() == 0 {
            write_header(&mut file, Lsn::FIRST)?;
            file.sync_all()?;
            Lsn::FIRST
        } else {
            read_header(&mut file, &path)?
        };

        let valid = scan_valid_bytes(&mut file, base_lsn, config.max_entry_size)?;
        let file_len = file.metadata()?.len();
        if HEADER_SIZE + valid < file_len {
            warn!(
                path = %path.display(),
                discarded = file_len - HEADER_SIZE - valid,
                "cutting torn log tail"
            );
            file.set_len(HEADER_SIZE + valid)?;
            file.sync_all()?;
        }

        let end = base_lsn.advance(valid);
        info!(path = %path.display(), base = %base_lsn, end = %end, "log opened");

        Ok(Self {
            path,
            config,
            inner: Mutex::new(FileLogInner {
                file: Arc::new(file),
                base_lsn,
                written_lsn: end,
                pending: BytesMut::new(),
                next_lsn: end,
            }),
            sync: Mutex::new(SyncState {
                flushed_lsn: end,
                syncing: false,
                syncs: 0,
            }),
            synced: Condvar::new(),
        })
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of forces that wrote out the tail themselves. A force covered
    /// by another caller's round is not counted.
    pub fn sync_count(&self) -> u64 {
        self.sync.lock().syncs
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".truncating");
        self.path.with_file_name(name)
    }

    /// Writes the tail and syncs it. Only the leader calls this.
    fn write_and_sync(&self) -> WalResult<Lsn> {
        let (file, target) = {
            let mut inner = self.inner.lock();
            inner.write_pending()?;
            (Arc::clone(&inner.file), inner.next_lsn)
        };
        if self.config.sync_on_force {
            file.sync_data()?;
        }
        Ok(target)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

fn write_header(file: &mut File, base_lsn: Lsn) -> WalResult<()> {
    let mut header = BytesMut::with_capacity(HEADER_SIZE as usize);
    header.put_u32_le(LOG_MAGIC);
    header.put_u32_le(LOG_VERSION);
    header.put_u64_le(base_lsn.as_u64());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

fn read_header(file: &mut File, path: &Path) -> WalResult<Lsn> {
    let invalid = |reason: String| WalError::InvalidHeader {
        path: path.to_path_buf(),
        reason,
    };
    let mut raw = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut raw)
        .map_err(|e| invalid(format!("short header: {e}")))?;
    let mut header = &raw[..];
    let magic = header.get_u32_le();
    if magic != LOG_MAGIC {
        return Err(invalid(format!("bad magic {magic:#010x}")));
    }
    let version = header.get_u32_le();
    if version != LOG_VERSION {
        return Err(invalid(format!("unsupported version {version}")));
    }
    let base = Lsn::new(header.get_u64_le());
    if !base.is_valid() {
        return Err(invalid("base LSN is zero".to_string()));
    }
    Ok(base)
}

/// Walks the frames after the header and returns how many bytes of intact
/// frames precede the first damaged or incomplete one.
fn scan_valid_bytes(file: &mut File, base_lsn: Lsn, max_entry_size: usize) -> WalResult<u64> {
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(HEADER_SIZE))?;
    file.read_to_end(&mut contents)?;

    let mut pos = 0usize;
    while let Some((len, crc)) = codec::frame_header(&contents[pos..]) {
        let end = pos + FRAME_HEADER_SIZE + len;
        if FRAME_HEADER_SIZE + len > max_entry_size || end > contents.len() {
            break;
        }
        let lsn = base_lsn.advance(pos as u64);
        if codec::decode_checked(lsn, crc, &contents[pos + FRAME_HEADER_SIZE..end]).is_err() {
            break;
        }
        pos = end;
    }
    Ok(pos as u64)
}

impl LogHandle for FileLog {
    fn write_entry(&self, entry: &mut LogEntry) -> WalResult<Lsn> {
        let frame_len = codec::frame_len(entry);
        if frame_len > self.config.max_entry_size {
            return Err(WalError::EntryTooLarge {
                size: frame_len,
                max: self.config.max_entry_size,
            });
        }

        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        codec::encode_frame(entry, &mut inner.pending);
        inner.next_lsn = lsn.advance(frame_len as u64);
        entry.lsn = lsn;

        if inner.pending.len() >= self.config.write_buffer_size {
            inner.write_pending()?;
        }
        Ok(lsn)
    }

    fn read_entry(&self, lsn: Lsn) -> WalResult<Option<LogEntry>> {
        let (file, offset, written) = {
            let inner = self.inner.lock();
            if lsn < inner.base_lsn {
                return Err(WalError::Truncated {
                    lsn,
                    truncation_point: inner.base_lsn,
                });
            }
            if lsn >= inner.next_lsn {
                return Ok(None);
            }
            if lsn >= inner.written_lsn {
                let start = (lsn.as_u64() - inner.written_lsn.as_u64()) as usize;
                return codec::decode_frame(lsn, &inner.pending[start..]).map(Some);
            }
            (Arc::clone(&inner.file), inner.offset_of(lsn), inner.written_lsn)
        };

        // Bytes below `written` never change, so the read needs no lock.
        let mut header = [0u8; FRAME_HEADER_SIZE];
        read_exact_at(&file, &mut header, offset)?;
        let (len, crc) = codec::frame_header(&header)
            .ok_or_else(|| WalError::corrupted(lsn, "truncated frame header"))?;
        if FRAME_HEADER_SIZE + len > self.config.max_entry_size
            || lsn.advance((FRAME_HEADER_SIZE + len) as u64) > written
        {
            return Err(WalError::NotAnEntry { lsn });
        }
        let mut body = vec![0u8; len];
        read_exact_at(&file, &mut body, offset + FRAME_HEADER_SIZE as u64)?;
        codec::decode_checked(lsn, crc, &body).map(Some)
    }

    fn force(&self, lsn: Lsn) -> WalResult<()> {
        let mut sync = self.sync.lock();
        loop {
            if lsn < sync.flushed_lsn {
                return Ok(());
            }
            if !sync.syncing {
                break;
            }
            self.synced.wait(&mut sync);
        }
        sync.syncing = true;
        drop(sync);

        let result = self.write_and_sync();

        let mut sync = self.sync.lock();
        sync.syncing = false;
        if let Ok(target) = result {
            sync.flushed_lsn = sync.flushed_lsn.max(target);
            sync.syncs += 1;
            trace!(flushed = %sync.flushed_lsn, "log forced");
        }
        drop(sync);
        self.synced.notify_all();
        result.map(|_| ())
    }

    fn flushed_lsn(&self) -> Lsn {
        self.sync.lock().flushed_lsn
    }

    fn truncate(&self, lsn: Lsn) -> WalResult<()> {
        let mut inner = self.inner.lock();
        if lsn <= inner.base_lsn {
            return Ok(());
        }
        let flushed = self.flushed_lsn();
        if lsn > flushed {
            return Err(WalError::TruncateBeyondFlushed { lsn, flushed });
        }

        // Copy the surviving suffix behind a new header, then swap files.
        inner.write_pending()?;
        let mut suffix = vec![0u8; (inner.written_lsn.as_u64() - lsn.as_u64()) as usize];
        read_exact_at(&inner.file, &mut suffix, inner.offset_of(lsn))?;
        if !suffix.is_empty() && codec::frame_header(&suffix).is_none() {
            return Err(WalError::NotAnEntry { lsn });
        }

        let tmp_path = self.tmp_path();
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_header(&mut tmp, lsn)?;
        tmp.write_all(&suffix)?;
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        let discarded = lsn.as_u64() - inner.base_lsn.as_u64();
        inner.file = Arc::new(tmp);
        inner.base_lsn = lsn;
        debug!(truncation_point = %lsn, discarded, "log truncated");
        Ok(())
    }

    fn truncation_point(&self) -> Lsn {
        self.inner.lock().base_lsn
    }

    fn next_available_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    fn discard_unforced(&self) -> WalResult<()> {
        let mut inner = self.inner.lock();
        let flushed = self.flushed_lsn();
        let lost = inner.next_lsn.as_u64() - flushed.as_u64();
        inner.pending.clear();
        let len = inner.offset_of(flushed);
        inner.file.set_len(len)?;
        inner.written_lsn = flushed;
        inner.next_lsn = flushed;
        warn!(lost, flushed = %flushed, "discarded unforced log tail");
        Ok(())
    }
}

impl std::fmt::Debug for FileLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (base_lsn, next_lsn) = {
            let inner = self.inner.lock();
            (inner.base_lsn, inner.next_lsn)
        };
        f.debug_struct("FileLog")
            .field("path", &self.path)
            .field("base_lsn", &base_lsn)
            .field("flushed_lsn", &self.flushed_lsn())
            .field("next_lsn", &next_lsn)
            .finish()
    }
}
