//! Binary encoding of log entries.
//!
//! Every entry is stored as a frame:
//!
//! ```text
//! +-----------+-----------+----------------------------------------+
//! | len (u32) | crc (u32) | body (len bytes)                       |
//! +-----------+-----------+----------------------------------------+
//!
//! body:
//! +------+-------+----------+----------+---------------+-------------------+
//! | type | flags | reserved | xid (8)  | prev LSN (8)  | type-specific ... |
//! +------+-------+----------+----------+---------------+-------------------+
//! ```
//!
//! Integers are little endian. The CRC32 covers the body only.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use stasis_common::types::{Lsn, PageId, RecordId, TxnId};

use super::types::{ClrEntry, EntryBody, EntryFlags, EntryType, LogEntry, UpdateEntry};
use crate::error::{WalError, WalResult};

/// Bytes preceding each body: length and checksum.
pub const FRAME_HEADER_SIZE: usize = 8;

const COMMON_SIZE: usize = 1 + 1 + 2 + 8 + 8;
const UPDATE_FIXED_SIZE: usize = 2 + 8 + 4 + 4 + 4;

fn update_len(update: &UpdateEntry) -> usize {
    UPDATE_FIXED_SIZE + update.arg.len()
}

/// Encoded body length of `entry`.
pub fn body_len(entry: &LogEntry) -> usize {
    COMMON_SIZE
        + match &entry.body {
            EntryBody::Begin | EntryBody::Commit | EntryBody::Abort | EntryBody::End => 0,
            EntryBody::Prepare { .. } => 8,
            EntryBody::Update(update) => update_len(update),
            EntryBody::Clr(clr) => 16 + update_len(&clr.update),
        }
}

/// Encoded frame length of `entry`; the distance to the next LSN.
pub fn frame_len(entry: &LogEntry) -> usize {
    FRAME_HEADER_SIZE + body_len(entry)
}

fn put_update(buf: &mut impl BufMut, update: &UpdateEntry) {
    buf.put_u16_le(update.op);
    buf.put_u64_le(update.rid.page.as_u64());
    buf.put_u32_le(update.rid.slot);
    buf.put_u32_le(update.rid.size);
    // Entry size is capped far below u32::MAX.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(update.arg.len() as u32);
    buf.put_slice(&update.arg);
}

/// Appends the body of `entry` to `buf`.
pub fn encode_body(entry: &LogEntry, buf: &mut impl BufMut) {
    buf.put_u8(entry.entry_type().as_u8());
    buf.put_u8(entry.flags.bits());
    buf.put_u16_le(0);
    buf.put_u64_le(entry.xid.as_u64());
    buf.put_u64_le(entry.prev_lsn.as_u64());
    match &entry.body {
        EntryBody::Begin | EntryBody::Commit | EntryBody::Abort | EntryBody::End => {}
        EntryBody::Prepare { rec_lsn } => buf.put_u64_le(rec_lsn.as_u64()),
        EntryBody::Update(update) => put_update(buf, update),
        EntryBody::Clr(clr) => {
            buf.put_u64_le(clr.compensated.as_u64());
            buf.put_u64_le(clr.undo_next.as_u64());
            put_update(buf, &clr.update);
        }
    }
}

/// Appends the full frame of `entry` to `buf`.
pub fn encode_frame(entry: &LogEntry, buf: &mut BytesMut) {
    let len = body_len(entry);
    buf.reserve(FRAME_HEADER_SIZE + len);
    let mut body = BytesMut::with_capacity(len);
    encode_body(entry, &mut body);
    debug_assert_eq!(body.len(), len);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(len as u32);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_slice(&body);
}

fn need(buf: &impl Buf, bytes: usize, what: &str) -> WalResult<()> {
    if buf.remaining() < bytes {
        return Err(WalError::decode(format!(
            "truncated {what}: {} < {bytes} bytes",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_update(buf: &mut impl Buf) -> WalResult<UpdateEntry> {
    need(&*buf, UPDATE_FIXED_SIZE, "update")?;
    let op = buf.get_u16_le();
    let page = PageId::new(buf.get_u64_le());
    let slot = buf.get_u32_le();
    let size = buf.get_u32_le();
    let arg_len = buf.get_u32_le() as usize;
    need(&*buf, arg_len, "update argument")?;
    let arg = buf.copy_to_bytes(arg_len);
    Ok(UpdateEntry {
        op,
        rid: RecordId::new(page, slot, size),
        arg,
    })
}

/// Decodes an entry body written at `lsn`.
pub fn decode_body(lsn: Lsn, body: &[u8]) -> WalResult<LogEntry> {
    let mut buf = Bytes::copy_from_slice(body);
    need(&buf, COMMON_SIZE, "entry header")?;
    let entry_type = EntryType::from_u8(buf.get_u8())?;
    let flags = EntryFlags::from_bits_truncate(buf.get_u8());
    let _reserved = buf.get_u16_le();
    let xid = TxnId::new(buf.get_u64_le());
    let prev_lsn = Lsn::new(buf.get_u64_le());

    let body = match entry_type {
        EntryType::Begin => EntryBody::Begin,
        EntryType::Commit => EntryBody::Commit,
        EntryType::Abort => EntryBody::Abort,
        EntryType::End => EntryBody::End,
        EntryType::Prepare => {
            need(&buf, 8, "prepare")?;
            EntryBody::Prepare {
                rec_lsn: Lsn::new(buf.get_u64_le()),
            }
        }
        EntryType::Update => EntryBody::Update(get_update(&mut buf)?),
        EntryType::Clr => {
            need(&buf, 16, "compensation")?;
            let compensated = Lsn::new(buf.get_u64_le());
            let undo_next = Lsn::new(buf.get_u64_le());
            EntryBody::Clr(ClrEntry {
                compensated,
                undo_next,
                update: get_update(&mut buf)?,
            })
        }
    };

    if buf.has_remaining() {
        return Err(WalError::corrupted(
            lsn,
            format!("{} trailing bytes after entry", buf.remaining()),
        ));
    }

    Ok(LogEntry {
        lsn,
        prev_lsn,
        xid,
        flags,
        body,
    })
}

/// Reads the `(body length, checksum)` pair at the start of a frame.
pub fn frame_header(bytes: &[u8]) -> Option<(usize, u32)> {
    let mut header = bytes.get(..FRAME_HEADER_SIZE)?;
    Some((header.get_u32_le() as usize, header.get_u32_le()))
}

/// Verifies `body` against `crc` and decodes it.
pub fn decode_checked(lsn: Lsn, crc: u32, body: &[u8]) -> WalResult<LogEntry> {
    let computed = crc32fast::hash(body);
    if computed != crc {
        return Err(WalError::checksum_mismatch(lsn, crc, computed));
    }
    decode_body(lsn, body)
}

/// Decodes the frame at the start of `bytes`.
pub fn decode_frame(lsn: Lsn, bytes: &[u8]) -> WalResult<LogEntry> {
    let (len, crc) =
        frame_header(bytes).ok_or_else(|| WalError::corrupted(lsn, "truncated frame header"))?;
    let body = bytes
        .get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len)
        .ok_or_else(|| WalError::corrupted(lsn, "truncated frame body"))?;
    decode_checked(lsn, crc, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_clr() -> LogEntry {
        let rid = RecordId::new(PageId::new(12), 3, 4);
        LogEntry::clr(
            TxnId::new(9),
            Lsn::new(300),
            ClrEntry {
                compensated: Lsn::new(200),
                undo_next: Lsn::new(100),
                update: UpdateEntry::new(1, rid, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            },
        )
    }

    #[test]
    fn test_frame_len_matches_encoding() {
        let entries = [
            LogEntry::new(TxnId::new(1), Lsn::INVALID, EntryBody::Begin),
            LogEntry::new(
                TxnId::new(1),
                Lsn::new(5),
                EntryBody::Prepare {
                    rec_lsn: Lsn::new(1),
                },
            ),
            sample_clr(),
        ];
        for entry in &entries {
            let mut buf = BytesMut::new();
            encode_frame(entry, &mut buf);
            assert_eq!(buf.len(), frame_len(entry));
        }
    }

    #[test]
    fn test_decode_preserves_clr_fields() {
        let entry = sample_clr();
        let mut buf = BytesMut::new();
        encode_frame(&entry, &mut buf);

        let decoded = decode_frame(Lsn::new(400), &buf).unwrap();
        assert_eq!(decoded.lsn, Lsn::new(400));
        assert_eq!(decoded.body, entry.body);
        assert_eq!(decoded.prev_lsn, Lsn::new(300));
        assert_eq!(decoded.xid, TxnId::new(9));
    }

    #[test]
    fn test_logical_update_keeps_invalid_page() {
        let entry = LogEntry::update(
            TxnId::new(2),
            Lsn::new(1),
            UpdateEntry::logical(37, vec![0xAA; 16]),
        )
        .with_flags(EntryFlags::NESTED_TOP);
        let mut buf = BytesMut::new();
        encode_frame(&entry, &mut buf);

        let decoded = decode_frame(Lsn::new(1), &buf).unwrap();
        assert!(decoded.as_update().unwrap().is_logical());
        assert!(decoded.flags.contains(EntryFlags::LOGICAL | EntryFlags::NESTED_TOP));
    }

    #[test]
    fn test_checksum_detects_flipped_bit() {
        let mut buf = BytesMut::new();
        encode_frame(&sample_clr(), &mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;

        let err = decode_frame(Lsn::new(1), &buf).unwrap_err();
        assert!(matches!(err, WalError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = BytesMut::new();
        encode_frame(&sample_clr(), &mut buf);
        assert!(decode_frame(Lsn::new(1), &buf[..buf.len() - 3]).is_err());
        assert!(decode_frame(Lsn::new(1), &buf[..4]).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut body = BytesMut::new();
        encode_body(
            &LogEntry::new(TxnId::new(1), Lsn::INVALID, EntryBody::Commit),
            &mut body,
        );
        body[0] = 42;
        assert!(decode_body(Lsn::new(1), &body).is_err());
    }
}
