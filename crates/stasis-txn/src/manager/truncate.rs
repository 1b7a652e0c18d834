//! Log truncation and the background worker that runs it.
//!
//! Truncation forces the log, writes every dirty page back and syncs the
//! page file before cutting the log at the oldest LSN still needed by a
//! dirty page or an active transaction. Commits that find the log past its
//! threshold only post a request; the worker thread does the flushing.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use stasis_common::types::Lsn;
use stasis_storage::buffer::BufferPool;
use stasis_storage::file::IoError;
use stasis_wal::LogHandle;

use super::table::TransactionTable;
use crate::error::TxnResult;

#[derive(Debug, Default)]
struct WorkerState {
    requested: bool,
    stopping: bool,
}

/// Everything a truncation touches, shared with the worker thread.
pub(crate) struct Truncator {
    pool: Arc<BufferPool>,
    log: Arc<dyn LogHandle>,
    table: Arc<Mutex<TransactionTable>>,
    /// Serializes foreground and background runs.
    running: Mutex<()>,
    state: Mutex<WorkerState>,
    wake: Condvar,
    completed: Mutex<u64>,
    finished: Condvar,
}

impl Truncator {
    pub(crate) fn new(
        pool: Arc<BufferPool>,
        log: Arc<dyn LogHandle>,
        table: Arc<Mutex<TransactionTable>>,
    ) -> Self {
        Self {
            pool,
            log,
            table,
            running: Mutex::new(()),
            state: Mutex::new(WorkerState::default()),
            wake: Condvar::new(),
            completed: Mutex::new(0),
            finished: Condvar::new(),
        }
    }

    /// Truncates the log on the calling thread. Returns the new truncation
    /// point.
    pub(crate) fn truncate(&self) -> TxnResult<Lsn> {
        let _running = self.running.lock();
        let result = self.truncate_locked();
        *self.completed.lock() += 1;
        self.finished.notify_all();
        result
    }

    fn truncate_locked(&self) -> TxnResult<Lsn> {
        self.log.force_all()?;
        self.pool.force_page_file()?;

        let mut point = self.log.next_available_lsn();
        if let Some(lsn) = self.pool.min_rec_lsn() {
            point = point.min(lsn);
        }
        if let Some(lsn) = self.table.lock().min_rec_lsn() {
            point = point.min(lsn);
        }
        if point > self.log.truncation_point() {
            self.log.truncate(point)?;
            info!(lsn = %point, "Truncated log");
        }
        Ok(point)
    }

    /// Asks the worker for a truncation. Requests that arrive while one is
    /// pending fold into it.
    pub(crate) fn request(&self) {
        let mut state = self.state.lock();
        if !state.requested {
            state.requested = true;
            self.wake.notify_one();
        }
    }

    /// Number of truncations that have finished, failed ones included.
    pub(crate) fn completed(&self) -> u64 {
        *self.completed.lock()
    }

    /// Blocks until at least `count` truncations have run.
    pub(crate) fn wait_for(&self, count: u64) {
        let mut completed = self.completed.lock();
        while *completed < count {
            self.finished.wait(&mut completed);
        }
    }

    fn run(&self) {
        loop {
            {
                let mut state = self.state.lock();
                while !state.requested && !state.stopping {
                    self.wake.wait(&mut state);
                }
                if state.stopping {
                    return;
                }
                state.requested = false;
            }
            if let Err(err) = self.truncate() {
                warn!(error = %err, "Background log truncation failed");
            }
        }
    }
}

/// Handle on the truncation thread. Stopping is idempotent.
pub(crate) struct TruncationWorker {
    truncator: Arc<Truncator>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TruncationWorker {
    pub(crate) fn new(truncator: Arc<Truncator>) -> Self {
        Self {
            truncator,
            thread: Mutex::new(None),
        }
    }

    /// Starts the thread. Requests posted before this are served first.
    pub(crate) fn start(&self) -> TxnResult<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.truncator);
        let thread = thread::Builder::new()
            .name("stasis-truncate".into())
            .spawn(move || shared.run())
            .map_err(IoError::from)?;
        *slot = Some(thread);
        debug!("Started log truncation worker");
        Ok(())
    }

    pub(crate) fn truncator(&self) -> &Arc<Truncator> {
        &self.truncator
    }

    /// Stops the thread after any truncation in progress. Pending requests
    /// are dropped.
    pub(crate) fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        {
            let mut state = self.truncator.state.lock();
            state.stopping = true;
            self.truncator.wake.notify_all();
        }
        if thread.join().is_err() {
            warn!("Log truncation worker panicked");
        }
        debug!("Stopped log truncation worker");
    }
}

impl Drop for TruncationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use stasis_common::config::StasisConfig;

    use super::*;
    use crate::manager::TransactionManager;

    fn open_eager() -> TransactionManager {
        let mut config = StasisConfig::for_testing();
        config.log.truncation_threshold = 1;
        TransactionManager::open(config).unwrap()
    }

    fn commit_one(tm: &TransactionManager) {
        let xid = tm.begin().unwrap();
        tm.alloc(xid, 16).unwrap();
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_commit_leaves_truncation_to_worker() {
        let tm = open_eager();
        let truncator = Arc::clone(tm.truncation.truncator());

        // With a truncation stuck in progress, commits still return.
        let busy = truncator.running.lock();
        commit_one(&tm);
        commit_one(&tm);
        assert_eq!(truncator.completed(), 0);
        assert_eq!(tm.log().truncation_point(), Lsn::FIRST);
        drop(busy);

        truncator.wait_for(1);
        assert!(tm.log().truncation_point() > Lsn::FIRST);
        tm.shutdown().unwrap();
    }

    #[test]
    fn test_requests_fold_while_pending() {
        let tm = open_eager();
        let truncator = Arc::clone(tm.truncation.truncator());
        let busy = truncator.running.lock();
        for _ in 0..5 {
            commit_one(&tm);
        }
        drop(busy);
        truncator.wait_for(1);
        // At most the run already started plus one folded request.
        tm.truncation.stop();
        assert!(truncator.completed() <= 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let tm = open_eager();
        tm.truncation.stop();
        tm.truncation.stop();
        assert!(tm.truncation.thread.lock().is_none());

        // Explicit truncation still runs on the caller's thread.
        commit_one(&tm);
        assert!(tm.truncate_log().unwrap() > Lsn::FIRST);
        assert_eq!(tm.truncation.truncator().completed(), 1);
    }
}
