//! Out-of-line storage for large records.
//!
//! A record of at least [`stasis_common::BLOB_THRESHOLD_SIZE`] bytes keeps a
//! [`BlobRef`] in its slot and its contents in a [`BlobStore`]. The slot is
//! logged like any other record. Blob contents are not: a store is
//! responsible for its own durability.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use stasis_storage::page::BlobRef;

use crate::error::{TxnError, TxnResult};

/// Storage for blob contents.
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Reserves a zero-filled blob of `size` bytes.
    fn alloc_blob(&self, size: u64) -> TxnResult<BlobRef>;

    /// Copies the blob into `buf`, which must be exactly `blob.size` bytes.
    fn read_blob(&self, blob: BlobRef, buf: &mut [u8]) -> TxnResult<()>;

    /// Overwrites the blob with `data`, which must be exactly `blob.size`
    /// bytes.
    fn write_blob(&self, blob: BlobRef, data: &[u8]) -> TxnResult<()>;

    /// Releases the blob.
    fn dealloc_blob(&self, blob: BlobRef) -> TxnResult<()>;
}

/// Blob store backed by process memory.
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: AtomicU64,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Returns true if the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_len(blob: BlobRef, len: usize) -> TxnResult<()> {
    if len as u64 != blob.size {
        return Err(TxnError::blob(format!(
            "blob {} holds {} bytes, buffer has {len}",
            blob.id, blob.size
        )));
    }
    Ok(())
}

impl BlobStore for MemoryBlobStore {
    fn alloc_blob(&self, size: u64) -> TxnResult<BlobRef> {
        let len = usize::try_from(size)
            .map_err(|_| TxnError::blob(format!("blob of {size} bytes is too large")))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.blobs.lock().insert(id, vec![0u8; len]);
        Ok(BlobRef { id, size })
    }

    fn read_blob(&self, blob: BlobRef, buf: &mut [u8]) -> TxnResult<()> {
        check_len(blob, buf.len())?;
        let blobs = self.blobs.lock();
        let data = blobs
            .get(&blob.id)
            .ok_or_else(|| TxnError::blob(format!("no blob {}", blob.id)))?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_blob(&self, blob: BlobRef, data: &[u8]) -> TxnResult<()> {
        check_len(blob, data.len())?;
        let mut blobs = self.blobs.lock();
        let stored = blobs
            .get_mut(&blob.id)
            .ok_or_else(|| TxnError::blob(format!("no blob {}", blob.id)))?;
        stored.copy_from_slice(data);
        Ok(())
    }

    fn dealloc_blob(&self, blob: BlobRef) -> TxnResult<()> {
        self.blobs
            .lock()
            .remove(&blob.id)
            .map(|_| ())
            .ok_or_else(|| TxnError::blob(format!("no blob {}", blob.id)))
    }
}
