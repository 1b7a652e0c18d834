use std::sync::Arc;

use tempfile::TempDir;

use stasis_common::config::{Backend, StasisConfig};
use stasis_storage::file::{MemoryPageFile, PageFile};
use stasis_txn::{TransactionManager, TxnResult};
use stasis_wal::{LogHandle, MemoryLog};

/// An in-memory page file and log that outlive the engines opened on
/// them.
///
/// [`CrashableStore::crash`] stops an engine without flushing; the next
/// [`CrashableStore::open`] sees only what was forced and runs recovery.
#[derive(Debug)]
pub struct CrashableStore {
    config: StasisConfig,
    pages: Arc<MemoryPageFile>,
    log: Arc<MemoryLog>,
}

impl CrashableStore {
    /// Creates an empty store with the test configuration.
    pub fn new() -> Self {
        Self::with_config(StasisConfig::for_testing())
    }

    /// Creates an empty store opened with `config`.
    pub fn with_config(config: StasisConfig) -> Self {
        Self {
            config,
            pages: Arc::new(MemoryPageFile::new()),
            log: Arc::new(MemoryLog::new()),
        }
    }

    /// Opens an engine, recovering whatever the last one left behind.
    pub fn open(&self) -> TxnResult<TransactionManager> {
        crate::init_tracing();
        let pages: Arc<dyn PageFile> = self.pages.clone();
        let log: Arc<dyn LogHandle> = self.log.clone();
        TransactionManager::open_with(self.config.clone(), pages, log)
    }

    /// Stops `tm` as if the process died.
    pub fn crash(&self, tm: TransactionManager) -> TxnResult<()> {
        tm.unclean_shutdown()?;
        drop(tm);
        Ok(())
    }

    /// Crashes `tm` and opens a fresh engine.
    pub fn restart(&self, tm: TransactionManager) -> TxnResult<TransactionManager> {
        self.crash(tm)?;
        self.open()
    }

    /// The page file.
    pub fn pages(&self) -> &Arc<MemoryPageFile> {
        &self.pages
    }

    /// The log.
    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.log
    }
}

impl Default for CrashableStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A file-backed engine directory that is removed on drop.
#[derive(Debug)]
pub struct FileStore {
    dir: TempDir,
}

impl FileStore {
    /// Creates an empty directory.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    /// Configuration that keeps the page file and log in this directory.
    pub fn config(&self) -> StasisConfig {
        let mut config = StasisConfig::with_data_dir(self.dir.path()).with_buffer_frames(64);
        config.storage.backend = Backend::File;
        config.log.backend = Backend::File;
        config
    }

    /// Opens an engine over the directory.
    pub fn open(&self) -> TxnResult<TransactionManager> {
        crate::init_tracing();
        TransactionManager::open(self.config())
    }
}
