//! Buffer pool implementation.
//!
//! The pool owns a fixed array of frames. The page table, the free list and
//! the LRU-2S queue live together behind one mutex. A miss reserves its
//! frame under that mutex and then does the victim write-back and the page
//! read without it; pages with I/O in flight are listed in the state so a
//! second loader of the same page waits instead of reading a stale image.
//! Queue and table entries are only published once the I/O for a
//! transition has succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use stasis_common::types::{Lsn, PageId};
use tracing::{debug, trace, warn};

use super::config::BufferPoolConfig;
use super::error::{BufferError, BufferResult};
use super::frame::{BufferFrame, FrameId};
use super::latch::PageHandle;
use super::replacer::Lru2sReplacer;
use super::{BufferPoolStats, ForceLog};
use crate::file::PageFile;
use crate::page::PageHeader;

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    replacer: Lru2sReplacer,
    free_frames: Vec<FrameId>,
    /// Pages being read in or written out by a miss.
    in_flight: HashSet<PageId>,
}

/// The buffer pool caches pages of one page file.
///
/// It provides:
/// - Pinned access through [`PageHandle`], with per-page read/write latches
/// - LRU-2S replacement that never evicts a pinned page
/// - Write-ahead ordering: the log is forced to a page's LSN before the page
///   is written back
pub struct BufferPool {
    config: BufferPoolConfig,
    frames: Vec<Arc<BufferFrame>>,
    state: Mutex<PoolState>,
    /// Signalled whenever a miss finishes its I/O.
    io_done: Condvar,
    page_file: Arc<dyn PageFile>,
    log: RwLock<Option<Arc<dyn ForceLog>>>,
    fetch_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    eviction_count: AtomicU64,
    flush_count: AtomicU64,
    shutdown: AtomicBool,
}

impl BufferPool {
    /// Creates a new buffer pool over `page_file`.
    pub fn new(config: BufferPoolConfig, page_file: Arc<dyn PageFile>) -> BufferResult<Self> {
        config.validate().map_err(BufferError::config)?;

        let num_frames = config.num_frames;
        let frames: Vec<Arc<BufferFrame>> = (0..num_frames)
            .map(|i| Arc::new(BufferFrame::new(FrameId::new(i))))
            .collect();
        // Popped from the back, so frame 0 is handed out first.
        let free_frames = (0..num_frames).rev().map(FrameId::new).collect();
        let replacer = Lru2sReplacer::new(num_frames, config.protected_capacity());

        debug!(
            frames = num_frames,
            probationary_ratio = config.probationary_ratio,
            "buffer pool created"
        );

        Ok(Self {
            config,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(num_frames),
                replacer,
                free_frames,
                in_flight: HashSet::new(),
            }),
            io_done: Condvar::new(),
            page_file,
            log: RwLock::new(None),
            fetch_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Installs the log that dirty pages are forced against before
    /// write-back.
    pub fn set_log_forcer(&self, log: Arc<dyn ForceLog>) {
        *self.log.write() = Some(log);
    }

    /// Returns the underlying page file.
    pub fn page_file(&self) -> &Arc<dyn PageFile> {
        &self.page_file
    }

    /// Pins `page_id`, reading it from the page file on a miss.
    ///
    /// On a miss with no free frame, the coldest unpinned frame is written
    /// back (if dirty) and reused. Neither the write-back nor the read
    /// holds the pool mutex, so hits on other pages proceed meanwhile.
    pub fn load_page(&self, page_id: PageId) -> BufferResult<PageHandle> {
        self.check_shutdown()?;
        if !page_id.is_valid() {
            return Err(BufferError::InvalidPageId { page_id });
        }
        self.fetch_count.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        loop {
            if let Some(&frame_id) = state.page_table.get(&page_id) {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                let frame = &self.frames[frame_id.index()];
                frame.pin();
                state.replacer.hit(frame_id);
                return Ok(PageHandle::new(Arc::clone(frame), page_id));
            }
            if !state.in_flight.contains(&page_id) {
                break;
            }
            self.io_done.wait(&mut state);
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let (frame_id, victim) = match state.free_frames.pop() {
            Some(frame_id) => (frame_id, None),
            None => {
                let (frame_id, old_page) = self.detach_victim(&mut state)?;
                (frame_id, Some(old_page))
            }
        };
        state.in_flight.insert(page_id);
        drop(state);

        let frame = &self.frames[frame_id.index()];
        let result = self.swap_in(frame, victim, page_id);

        let mut state = self.state.lock();
        state.in_flight.remove(&page_id);
        if let Some(old_page) = victim {
            state.in_flight.remove(&old_page);
        }
        let outcome = match result {
            Ok(()) => {
                frame.rekey(page_id);
                frame.pin();
                state.page_table.insert(page_id, frame_id);
                state.replacer.insert(frame_id);
                trace!(page = %page_id, frame = frame_id.index(), "page loaded");
                Ok(PageHandle::new(Arc::clone(frame), page_id))
            }
            Err(SwapError::WriteBack(err)) => {
                // The victim keeps its page and stays cached.
                if let Some(old_page) = victim {
                    state.page_table.insert(old_page, frame_id);
                    state.replacer.insert(frame_id);
                }
                Err(err)
            }
            Err(SwapError::Read(err)) => {
                state.free_frames.push(frame_id);
                Err(err)
            }
        };
        drop(state);
        self.io_done.notify_all();
        outcome
    }

    /// Releases a pin. Equivalent to dropping the handle.
    pub fn release_page(&self, handle: PageHandle) {
        drop(handle);
    }

    /// Writes `page_id` back if it is cached and dirty.
    pub fn flush_page(&self, page_id: PageId) -> BufferResult<()> {
        let Some(handle) = self.pin_cached(page_id) else {
            return Ok(());
        };
        let frame = &self.frames[handle.frame_id().index()];
        if frame.is_dirty() {
            self.write_back(frame)?;
        }
        Ok(())
    }

    /// Writes back every dirty page. Returns how many were written.
    pub fn flush_all(&self) -> BufferResult<usize> {
        let cached: Vec<PageId> = self.state.lock().page_table.keys().copied().collect();
        let mut flushed = 0;
        for page_id in cached {
            let Some(handle) = self.pin_cached(page_id) else {
                continue;
            };
            let frame = &self.frames[handle.frame_id().index()];
            if frame.is_dirty() {
                self.write_back(frame)?;
                flushed += 1;
            }
        }
        debug!(flushed, "flushed dirty pages");
        Ok(flushed)
    }

    /// Flushes every dirty page and syncs the page file.
    pub fn force_page_file(&self) -> BufferResult<()> {
        self.flush_all()?;
        self.page_file.force()?;
        Ok(())
    }

    /// Returns the oldest recovery LSN among dirty frames.
    ///
    /// Log entries before it are not needed to redo any cached page.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        self.frames
            .iter()
            .filter(|frame| frame.is_dirty())
            .map(|frame| frame.rec_lsn())
            .filter(|lsn| lsn.is_valid())
            .min()
    }

    /// Returns cached dirty pages with their recovery LSNs.
    pub fn dirty_pages(&self) -> Vec<(PageId, Lsn)> {
        self.frames
            .iter()
            .filter(|frame| frame.is_dirty() && !frame.is_empty())
            .map(|frame| (frame.page_id(), frame.rec_lsn()))
            .collect()
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned = 0;
        let mut dirty = 0;

        for frame in &self.frames {
            if frame.is_pinned() {
                pinned += 1;
            }
            if frame.is_dirty() {
                dirty += 1;
            }
        }

        BufferPoolStats {
            fetches: self.fetch_count.load(Ordering::Relaxed),
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            evictions: self.eviction_count.load(Ordering::Relaxed),
            flushes: self.flush_count.load(Ordering::Relaxed),
            pinned_frames: pinned,
            dirty_frames: dirty,
        }
    }

    /// Returns the number of frames in the buffer pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns true if a page is in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    /// Flushes everything and refuses further loads.
    pub fn shutdown(&self) -> BufferResult<()> {
        self.force_page_file()?;
        self.shutdown.store(true, Ordering::Release);
        Ok(())
    }

    /// Drops every cached page without writing it back.
    ///
    /// Models a crash: whatever reached the page file stays, everything else
    /// is lost. Outstanding handles must already be released.
    pub fn discard_all(&self) {
        let mut state = self.state.lock();
        let discarded = self.frames.iter().filter(|f| f.is_dirty()).count();
        for frame in &self.frames {
            if frame.is_pinned() {
                warn!(frame = frame.frame_id().index(), "discarding a pinned frame");
            }
            state.replacer.remove(frame.frame_id());
            frame.reset();
        }
        state.page_table.clear();
        state.in_flight.clear();
        state.free_frames = (0..self.frames.len()).rev().map(FrameId::new).collect();
        self.shutdown.store(true, Ordering::Release);
        debug!(discarded, "buffer pool discarded without write-back");
    }

    // -------------------------------------------------------------------------
    // Private helpers
    // -------------------------------------------------------------------------

    fn check_shutdown(&self) -> BufferResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            Err(BufferError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Pins a page only if it is already cached.
    fn pin_cached(&self, page_id: PageId) -> Option<PageHandle> {
        let state = self.state.lock();
        state.page_table.get(&page_id).map(|frame_id| {
            let frame = &self.frames[frame_id.index()];
            frame.pin();
            PageHandle::new(Arc::clone(frame), page_id)
        })
    }

    /// Picks a victim and takes it out of the page table and the queue.
    ///
    /// The victim's page is marked in flight until its write-back is done,
    /// so nobody reloads it from the page file in the meantime.
    fn detach_victim(&self, state: &mut PoolState) -> BufferResult<(FrameId, PageId)> {
        let victim = state
            .replacer
            .victim(|id| self.frames[id.index()].is_evictable())
            .ok_or(BufferError::NoFreeFrames {
                frames: self.frames.len(),
            })?;
        let old_page = self.frames[victim.index()].page_id();
        state.page_table.remove(&old_page);
        state.replacer.remove(victim);
        state.in_flight.insert(old_page);
        Ok((victim, old_page))
    }

    /// Writes back the detached victim, if any, then reads `page_id` into
    /// the frame. Runs without the pool mutex.
    fn swap_in(
        &self,
        frame: &BufferFrame,
        victim: Option<PageId>,
        page_id: PageId,
    ) -> Result<(), SwapError> {
        if let Some(old_page) = victim {
            if frame.is_dirty() {
                self.write_back(frame).map_err(SwapError::WriteBack)?;
            }
            frame.reset();
            self.eviction_count.fetch_add(1, Ordering::Relaxed);
            trace!(page = %old_page, frame = frame.frame_id().index(), "page evicted");
        }
        let mut data = frame.write_data();
        self.page_file
            .read_page(page_id, &mut data[..])
            .map_err(|err| SwapError::Read(err.into()))
    }

    /// Writes a frame's page to the page file after forcing the log to the
    /// page LSN.
    ///
    /// The latch is held only while copying the bytes. The frame is marked
    /// clean under that latch, so a writer that slips in afterwards dirties
    /// it again.
    fn write_back(&self, frame: &BufferFrame) -> BufferResult<()> {
        let page_id = frame.page_id();
        let rec_lsn = frame.rec_lsn();
        let image = {
            let data = frame.read_data();
            frame.mark_clean();
            data.clone()
        };
        let page_lsn = PageHeader::new(&image[..]).lsn();

        let result = self
            .force_log(page_lsn)
            .and_then(|()| Ok(self.page_file.write_page(page_id, &image)?));
        if let Err(err) = result {
            frame.note_update(rec_lsn);
            return Err(err);
        }

        self.flush_count.fetch_add(1, Ordering::Relaxed);
        trace!(page = %page_id, lsn = %page_lsn, "page written back");
        Ok(())
    }

    fn force_log(&self, lsn: Lsn) -> BufferResult<()> {
        if !lsn.is_valid() {
            return Ok(());
        }
        match self.log.read().as_ref() {
            Some(log) => log
                .force_to(lsn)
                .map_err(|source| BufferError::LogForce { lsn, source }),
            None => Ok(()),
        }
    }
}

/// Which half of a miss failed.
enum SwapError {
    WriteBack(BufferError),
    Read(BufferError),
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("num_frames", &self.config.num_frames)
            .field("pages_cached", &self.state.lock().page_table.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
