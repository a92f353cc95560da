//! Per-file aggregate statistics, updated by external collaborators (the log
//! writer, a merge/compaction pass) as entries move between "live" and
//! "dead" or new files come into existence. The keydir itself never computes
//! these from its own chains; it only stores what it's told.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub live_keys: u64,
    pub total_keys: u64,
    pub live_bytes: u64,
    pub total_bytes: u64,
    /// 0 means unset.
    pub oldest_timestamp: u32,
    /// 0 means unset.
    pub newest_timestamp: u32,
    /// 0 means "no expiration known yet"; otherwise the minimum expiration
    /// epoch reported for any entry in this file.
    pub expiration_epoch: u64,
}

/// A relative update applied to one file's [`FileStats`]. Counters are
/// signed so a merge can report entries leaving the live set (negative) in
/// the same call shape as entries arriving (positive).
#[derive(Debug, Clone, Copy, Default)]
pub struct FstatsDelta {
    pub live_keys: i64,
    pub total_keys: i64,
    pub live_bytes: i64,
    pub total_bytes: i64,
    pub timestamp: u32,
    pub expiration_epoch: u64,
}

pub struct FstatsTable {
    inner: Mutex<HashMap<u32, FileStats>>,
}

impl FstatsTable {
    pub fn new() -> Self {
        FstatsTable {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Applies `delta` to `file_id`'s entry, creating it on first use.
    pub fn update(&self, file_id: u32, delta: FstatsDelta) {
        let mut table = self.inner.lock().unwrap();
        let stats = table.entry(file_id).or_default();
        stats.live_keys = (stats.live_keys as i64 + delta.live_keys).max(0) as u64;
        stats.total_keys = (stats.total_keys as i64 + delta.total_keys).max(0) as u64;
        stats.live_bytes = (stats.live_bytes as i64 + delta.live_bytes).max(0) as u64;
        stats.total_bytes = (stats.total_bytes as i64 + delta.total_bytes).max(0) as u64;
        if delta.timestamp != 0 {
            if stats.oldest_timestamp == 0 || delta.timestamp < stats.oldest_timestamp {
                stats.oldest_timestamp = delta.timestamp;
            }
            if delta.timestamp > stats.newest_timestamp {
                stats.newest_timestamp = delta.timestamp;
            }
        }
        if delta.expiration_epoch != 0
            && (stats.expiration_epoch == 0 || delta.expiration_epoch < stats.expiration_epoch)
        {
            stats.expiration_epoch = delta.expiration_epoch;
        }
    }

    pub fn get(&self, file_id: u32) -> Option<FileStats> {
        self.inner.lock().unwrap().get(&file_id).copied()
    }

    pub fn remove(&self, file_id: u32) -> Option<FileStats> {
        self.inner.lock().unwrap().remove(&file_id)
    }
}

impl Default for FstatsTable {
    fn default() -> Self {
        Self::new()
    }
}
