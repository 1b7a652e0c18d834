//! Record reads and writes.

use bytes::Bytes;

use stasis_common::types::{Lsn, RecordId, TxnId};
use stasis_storage::page::{format_of, BlobRef, RecordKind, SlotType};

use super::TransactionManager;
use crate::error::{TxnError, TxnResult};
use crate::operations::physical::{delta_arg, set_arg};
use crate::operations::OperationId;

impl TransactionManager {
    /// Reads a record into `buf`, which must be exactly `rid.size` bytes.
    pub fn read_into(&self, xid: TxnId, rid: RecordId, buf: &mut [u8]) -> TxnResult<()> {
        if buf.len() != rid.size as usize {
            return Err(TxnError::bad_record(
                rid,
                format!("buffer of {} bytes for a {}-byte record", buf.len(), rid.size),
            ));
        }
        self.check_open()?;
        self.read_lock(xid, rid)?;

        let blob = {
            let handle = self.pool.load_page(rid.page)?;
            let page = handle.read();
            let format = format_of(&page)?;
            let stored = format.record(&page, rid.slot)?;
            match RecordKind::resolve(format.record_type(&page, rid.slot), stored)? {
                RecordKind::Inline(len) if len == buf.len() => {
                    buf.copy_from_slice(stored);
                    return Ok(());
                }
                RecordKind::Blob(blob) if blob.size == u64::from(rid.size) => blob,
                kind => {
                    return Err(TxnError::bad_record(
                        rid,
                        format!("record holds {} bytes", kind.len()),
                    ))
                }
            }
        };
        self.blobs.read_blob(blob, buf)
    }

    /// Reads a record.
    pub fn read(&self, xid: TxnId, rid: RecordId) -> TxnResult<Vec<u8>> {
        let mut buf = vec![0u8; rid.size as usize];
        self.read_into(xid, rid, &mut buf)?;
        Ok(buf)
    }

    /// Overwrites a record. `value` must be exactly `rid.size` bytes.
    ///
    /// Inline records are changed with a logged SET. Blob contents are
    /// written to the blob store in place and are not logged.
    pub fn set(&self, xid: TxnId, rid: RecordId, value: &[u8]) -> TxnResult<Lsn> {
        if value.len() != rid.size as usize {
            return Err(TxnError::bad_record(
                rid,
                format!("value of {} bytes for a {}-byte record", value.len(), rid.size),
            ));
        }
        self.check_writable(xid)?;
        self.write_lock(xid, rid)?;

        if let Some(blob) = self.blob_of(rid)? {
            self.blobs.write_blob(blob, value)?;
            return Ok(self.pool.load_page(rid.page)?.lsn());
        }
        self.update_with(xid, rid, OperationId::SET, false, |page| {
            let format = format_of(page)?;
            match format.record_type(page, rid.slot) {
                SlotType::Normal(len) if usize::from(len) == value.len() => {
                    Ok(set_arg(value, format.record(page, rid.slot)?))
                }
                other => Err(TxnError::bad_record(
                    rid,
                    format!("cannot overwrite a slot of type {other:?}"),
                )),
            }
        })
    }

    /// Reads a record's stored bytes without resolving blob references.
    pub fn read_raw(&self, xid: TxnId, rid: RecordId) -> TxnResult<Vec<u8>> {
        self.check_open()?;
        self.read_lock(xid, rid)?;
        let handle = self.pool.load_page(rid.page)?;
        let page = handle.read();
        Ok(format_of(&page)?.record(&page, rid.slot)?.to_vec())
    }

    /// Overwrites a record's stored bytes with a logged SET.
    pub fn write_raw(&self, xid: TxnId, rid: RecordId, value: &[u8]) -> TxnResult<Lsn> {
        self.update_with(xid, rid, OperationId::SET, true, |page| {
            let old = format_of(page)?.record(page, rid.slot)?;
            if old.len() != value.len() {
                return Err(TxnError::bad_record(
                    rid,
                    format!("slot stores {} bytes, got {}", old.len(), value.len()),
                ));
            }
            Ok(set_arg(value, old))
        })
    }

    /// Adds `delta` to a 4-byte counter record.
    pub fn increment(&self, xid: TxnId, rid: RecordId, delta: i32) -> TxnResult<Lsn> {
        self.update_with(xid, rid, OperationId::INCREMENT, true, |_| Ok(delta_arg(delta)))
    }

    /// Subtracts `delta` from a 4-byte counter record.
    pub fn decrement(&self, xid: TxnId, rid: RecordId, delta: i32) -> TxnResult<Lsn> {
        self.update_with(xid, rid, OperationId::DECREMENT, true, |_| Ok(delta_arg(delta)))
    }

    /// Type of the slot `rid` names.
    pub fn record_type(&self, xid: TxnId, rid: RecordId) -> TxnResult<SlotType> {
        self.check_open()?;
        self.read_lock(xid, rid)?;
        let handle = self.pool.load_page(rid.page)?;
        let page = handle.read();
        Ok(format_of(&page)?.record_type(&page, rid.slot))
    }

    /// Caller-visible size of the record at `rid`, or `None` if the slot is
    /// free.
    pub fn record_size(&self, xid: TxnId, rid: RecordId) -> TxnResult<Option<usize>> {
        self.check_open()?;
        self.read_lock(xid, rid)?;
        let handle = self.pool.load_page(rid.page)?;
        let page = handle.read();
        let format = format_of(&page)?;
        let slot_type = format.record_type(&page, rid.slot);
        if !slot_type.is_live() {
            return Ok(None);
        }
        let stored = format.record(&page, rid.slot)?;
        Ok(Some(RecordKind::resolve(slot_type, stored)?.len()))
    }

    /// The blob a record points at, if it is stored out of line.
    pub(crate) fn blob_of(&self, rid: RecordId) -> TxnResult<Option<BlobRef>> {
        let handle = self.pool.load_page(rid.page)?;
        let page = handle.read();
        let format = format_of(&page)?;
        match format.record_type(&page, rid.slot) {
            SlotType::Blob => Ok(Some(BlobRef::from_bytes(format.record(&page, rid.slot)?)?)),
            _ => Ok(None),
        }
    }

    /// Stores `blob`'s reference in a freshly allocated blob slot.
    pub(crate) fn write_blob_ref(
        &self,
        xid: TxnId,
        rid: RecordId,
        blob: BlobRef,
    ) -> TxnResult<Lsn> {
        let new = Bytes::copy_from_slice(&blob.to_bytes());
        self.update_with(xid, rid, OperationId::SET, false, |page| {
            let old = format_of(page)?.record(page, rid.slot)?;
            Ok(set_arg(&new, old))
        })
    }
}

#[cfg(test)]
mod tests {
    use stasis_common::config::StasisConfig;
    use stasis_common::constants::BLOB_THRESHOLD_SIZE;

    use super::*;

    fn open() -> TransactionManager {
        TransactionManager::open(StasisConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_set_and_read() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 5).unwrap();
        tm.set(xid, rid, b"hello").unwrap();
        assert_eq!(tm.read(xid, rid).unwrap(), b"hello");
        assert_eq!(tm.record_size(xid, rid).unwrap(), Some(5));
        assert_eq!(tm.record_type(xid, rid).unwrap(), SlotType::Normal(5));
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 5).unwrap();
        assert!(matches!(
            tm.set(xid, rid, b"toolong"),
            Err(TxnError::BadRecord { .. })
        ));
        let wrong = RecordId { size: 3, ..rid };
        assert!(matches!(tm.read(xid, wrong), Err(TxnError::BadRecord { .. })));
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_counters() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let rid = tm.alloc(xid, 4).unwrap();
        tm.set(xid, rid, &0i32.to_le_bytes()).unwrap();
        tm.increment(xid, rid, 10).unwrap();
        tm.decrement(xid, rid, 3).unwrap();
        assert_eq!(tm.read(xid, rid).unwrap(), 7i32.to_le_bytes());
        tm.commit(xid).unwrap();
    }

    #[test]
    fn test_blob_record_round_trip() {
        let tm = open();
        let xid = tm.begin().unwrap();
        let size = BLOB_THRESHOLD_SIZE + 100;
        let rid = tm.alloc(xid, size).unwrap();
        assert_eq!(tm.record_type(xid, rid).unwrap(), SlotType::Blob);

        let value: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        tm.set(xid, rid, &value).unwrap();
        assert_eq!(tm.read(xid, rid).unwrap(), value);
        assert_eq!(tm.record_size(xid, rid).unwrap(), Some(size));
        assert_eq!(tm.read_raw(xid, rid).unwrap().len(), 16);
        tm.commit(xid).unwrap();
    }
}
