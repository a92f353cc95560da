//! Byte layout of an entry packed into a page chain.
//!
//! ```text
//! [file_id: 4][total_size: 4][epoch: 8][offset: 8][timestamp: 4][next: 4][key_size: 4][key: key_size]
//! ```
//!
//! Every fixed field sits at an offset in `{0, 4, 8, 16, 24, 28, 32}` and is
//! at most 8 bytes wide, so given that every entry starts at an 8-aligned
//! chain offset, no fixed field ever straddles a page boundary. Only the key
//! (offset 36, arbitrary length) can.

use crate::config::{MAX_FILE_ID, MAX_OFFSET};

pub const FILE_ID_OFFSET: u32 = 0;
pub const TOTAL_SIZE_OFFSET: u32 = 4;
pub const EPOCH_OFFSET: u32 = 8;
pub const OFFSET_OFFSET: u32 = 16;
pub const TIMESTAMP_OFFSET: u32 = 24;
pub const NEXT_OFFSET: u32 = 28;
pub const KEY_SIZE_OFFSET: u32 = 32;
pub const KEY_OFFSET: u32 = 36;

/// Rounds `n` up to the next multiple of 8, wrapping rather than panicking
/// if `n` is within 7 of `u32::MAX` — callers that care detect the wrap
/// themselves (see `checked_append`).
pub fn round_up_to_8(n: u32) -> u32 {
    n.wrapping_add(7) & !7
}

/// Total on-chain size of an entry whose key is `key_size` bytes. Version
/// records (which omit the key) pass `key_size = 0`.
pub fn entry_size_for_key(key_size: u32) -> u32 {
    round_up_to_8(KEY_OFFSET + key_size)
}

/// Computes `(append_offset, wanted_size)` for appending an entry with
/// `key_size` bytes of key onto a chain currently `chain_size` bytes long.
/// Returns `None` if the arithmetic would wrap a `u32` — the chain-offset
/// address space is exhausted, which this crate treats the same as
/// out-of-memory rather than silently wrapping.
pub fn checked_append(chain_size: u32, key_size: u32) -> Option<(u32, u32)> {
    let append_offset = round_up_to_8(chain_size);
    if append_offset < chain_size {
        return None;
    }
    let wanted_size = (append_offset as u64) + (entry_size_for_key(key_size) as u64);
    if wanted_size > u32::MAX as u64 || (wanted_size as u32) < chain_size {
        return None;
    }
    Some((append_offset, wanted_size as u32))
}

/// The fixed-size, page-resident form of an entry: everything but the key
/// bytes themselves. `next` is a chain-relative byte offset to the next
/// (newer) version of the same key, or `0` if this is the newest version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub file_id: u32,
    pub total_size: u32,
    pub epoch: u64,
    pub offset: u64,
    pub timestamp: u32,
    pub next: u32,
    pub key_size: u32,
}

impl RawHeader {
    /// Reads the 36-byte fixed header starting at `buf[at..]`. Callers must
    /// ensure the header does not straddle a page boundary; only the key
    /// payload that may follow it is allowed to.
    pub fn read(buf: &[u8], at: usize) -> Self {
        let u32_at = |o: u32| {
            let o = at + o as usize;
            u32::from_le_bytes(buf[o..o + 4].try_into().unwrap())
        };
        let u64_at = |o: u32| {
            let o = at + o as usize;
            u64::from_le_bytes(buf[o..o + 8].try_into().unwrap())
        };
        RawHeader {
            file_id: u32_at(FILE_ID_OFFSET),
            total_size: u32_at(TOTAL_SIZE_OFFSET),
            epoch: u64_at(EPOCH_OFFSET),
            offset: u64_at(OFFSET_OFFSET),
            timestamp: u32_at(TIMESTAMP_OFFSET),
            next: u32_at(NEXT_OFFSET),
            key_size: u32_at(KEY_SIZE_OFFSET),
        }
    }

    pub fn write(&self, buf: &mut [u8], at: usize) {
        let put_u32 = |buf: &mut [u8], o: u32, v: u32| {
            let o = at + o as usize;
            buf[o..o + 4].copy_from_slice(&v.to_le_bytes());
        };
        let put_u64 = |buf: &mut [u8], o: u32, v: u64| {
            let o = at + o as usize;
            buf[o..o + 8].copy_from_slice(&v.to_le_bytes());
        };
        put_u32(buf, FILE_ID_OFFSET, self.file_id);
        put_u32(buf, TOTAL_SIZE_OFFSET, self.total_size);
        put_u64(buf, EPOCH_OFFSET, self.epoch);
        put_u64(buf, OFFSET_OFFSET, self.offset);
        put_u32(buf, TIMESTAMP_OFFSET, self.timestamp);
        put_u32(buf, NEXT_OFFSET, self.next);
        put_u32(buf, KEY_SIZE_OFFSET, self.key_size);
    }

    pub fn to_entry(&self) -> Entry {
        Entry {
            file_id: self.file_id,
            total_size: self.total_size,
            epoch: self.epoch,
            offset: self.offset,
            timestamp: self.timestamp,
        }
    }
}

/// A fully resolved entry as returned by [`crate::Keydir::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub file_id: u32,
    pub total_size: u32,
    pub epoch: u64,
    pub offset: u64,
    pub timestamp: u32,
}

impl Entry {
    pub fn is_tombstone(&self) -> bool {
        self.offset == MAX_OFFSET
    }
}

/// The payload a caller wants installed for a key via `put`.
#[derive(Debug, Clone)]
pub struct PutEntry {
    pub key: Vec<u8>,
    pub file_id: u32,
    pub total_size: u32,
    pub offset: u64,
    pub timestamp: u32,
}

impl PutEntry {
    pub(crate) fn tombstone(key: Vec<u8>) -> Self {
        PutEntry {
            key,
            file_id: MAX_FILE_ID,
            total_size: 0,
            offset: MAX_OFFSET,
            timestamp: 0,
        }
    }

    pub(crate) fn is_tombstone(&self) -> bool {
        self.offset == MAX_OFFSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_8() {
        assert_eq!(round_up_to_8(0), 0);
        assert_eq!(round_up_to_8(1), 8);
        assert_eq!(round_up_to_8(8), 8);
        assert_eq!(round_up_to_8(9), 16);
    }

    #[test]
    fn entry_size_includes_header_and_key() {
        assert_eq!(entry_size_for_key(0), 40); // round_up_8(36)
        assert_eq!(entry_size_for_key(4), 40); // round_up_8(40)
        assert_eq!(entry_size_for_key(5), 48); // round_up_8(41)
    }
}
