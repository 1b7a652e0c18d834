//! # stasis-test
//!
//! Integration tests for the Stasis storage engine.
//!
//! This crate contains:
//! - Crash harnesses that reopen an engine over the same page file and log
//! - An I/O trace that checks the write-ahead rule on every page write
//! - Scenario and property tests under `tests/`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Stores that survive a simulated crash.
pub mod harness;

/// Instrumented page file and log.
pub mod trace;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub use harness::{CrashableStore, FileStore};
pub use trace::{IoEvent, IoTrace, TracedLog, TracedPageFile};

static TRACING: Once = Once::new();

/// Installs a test subscriber once per process. `RUST_LOG` selects levels.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
