//! Type definitions for Stasis.
//!
//! Identifiers shared by every layer of the engine.

mod ids;
mod record;

pub use ids::{Lsn, PageId, TxnId};
pub use record::{RecordId, SlotId};
