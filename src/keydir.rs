//! The concurrent in-memory key directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::common::KeydirResult;
use crate::config::{MAX_EPOCH, MAX_PAGE_IDX};
use crate::entry::{self, Entry, PutEntry, RawHeader};
use crate::fstats::{FileStats, FstatsDelta, FstatsTable};
use crate::hash::base_page_idx;
use crate::iter::ScanIter;
use crate::page::{PageMeta, PageStore};

/// Construction-time options for [`Keydir::open`].
#[derive(Debug, Clone)]
pub struct KeydirOptions {
    pub basedir: PathBuf,
    pub num_pages: u32,
    pub initial_num_swap_pages: u32,
}

impl KeydirOptions {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        KeydirOptions {
            basedir: basedir.into(),
            num_pages: 1024,
            initial_num_swap_pages: 64,
        }
    }

    pub fn num_pages(mut self, n: u32) -> Self {
        self.num_pages = n;
        self
    }

    pub fn initial_num_swap_pages(mut self, n: u32) -> Self {
        self.initial_num_swap_pages = n;
        self
    }
}

/// Result of [`Keydir::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    Found(Entry),
    NotFound,
}

/// Result of [`Keydir::put`] and [`Keydir::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Ok { epoch: u64 },
    /// A CAS precondition was supplied and the key's current on-disk
    /// location didn't match it.
    Modified,
    /// No page could be allocated, even after growing swap.
    OutOfMemory,
}

enum WritePrepOutcome {
    Ok,
    Restart,
    NoMem,
}

pub struct Keydir {
    store: PageStore,
    epoch: AtomicU64,
    min_epoch: AtomicU64,
    fstats: FstatsTable,
}

impl Keydir {
    pub fn open(options: KeydirOptions) -> KeydirResult<Self> {
        std::fs::create_dir_all(&options.basedir)?;
        let store = PageStore::open(
            &options.basedir,
            options.num_pages,
            options.initial_num_swap_pages,
        )?;
        debug!(
            num_pages = options.num_pages,
            initial_num_swap_pages = options.initial_num_swap_pages,
            basedir = %options.basedir.display(),
            "keydir opened"
        );
        Ok(Keydir {
            store,
            epoch: AtomicU64::new(1),
            min_epoch: AtomicU64::new(MAX_EPOCH),
            fstats: FstatsTable::new(),
        })
    }

    pub fn swap_path(&self) -> &Path {
        self.store.swap_path()
    }

    /// Returns the largest epoch currently installed by any completed write.
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Pins the oldest epoch a concurrent reader may still be observing.
    /// Pass `None` to release the pin (no snapshot floor).
    pub fn set_min_epoch(&self, epoch: Option<u64>) {
        self.min_epoch.store(epoch.unwrap_or(MAX_EPOCH), Ordering::Release);
    }

    pub fn min_epoch(&self) -> Option<u64> {
        match self.min_epoch.load(Ordering::Acquire) {
            MAX_EPOCH => None,
            e => Some(e),
        }
    }

    pub fn update_fstats(&self, file_id: u32, delta: FstatsDelta) {
        self.fstats.update(file_id, delta);
    }

    pub fn fstats(&self, file_id: u32) -> Option<FileStats> {
        self.fstats.get(file_id)
    }

    /// Looks up `key` as of `epoch` (pass [`Keydir::current_epoch`] for the
    /// latest committed state). Returns the newest version with
    /// `version.epoch <= epoch`; the caller is responsible for treating a
    /// tombstone result ([`Entry::is_tombstone`]) as absence.
    pub fn get(&self, key: &[u8], epoch: u64) -> GetOutcome {
        let home = self.resolve_home(base_page_idx(key, self.store.num_memory_pages()));
        let mut iter = ScanIter::open(&self.store, home);
        match find_key(&mut iter, key) {
            Some(key_offset) => match resolve_version(&mut iter, key_offset, epoch) {
                Some(header) => GetOutcome::Found(header.to_entry()),
                None => GetOutcome::NotFound,
            },
            None => GetOutcome::NotFound,
        }
    }

    /// Installs `entry` for its key. If `cas` is `Some((file_id, offset))`,
    /// the write only applies when the key's current newest version matches
    /// exactly that location; a mismatch (including the key being absent
    /// when a CAS was requested) yields [`PutOutcome::Modified`].
    pub fn put(&self, entry: PutEntry, cas: Option<(u32, u64)>) -> PutOutcome {
        loop {
            let base_idx = base_page_idx(&entry.key, self.store.num_memory_pages());
            match self.try_put(base_idx, &entry, cas) {
                WritePrepResult::Done(outcome) => return outcome,
                WritePrepResult::Restart => continue,
            }
        }
    }

    pub fn remove(&self, key: &[u8], cas: Option<(u32, u64)>) -> PutOutcome {
        self.put(PutEntry::tombstone(key.to_vec()), cas)
    }

    fn try_put(&self, base_idx: u32, entry: &PutEntry, cas: Option<(u32, u64)>) -> WritePrepResult {
        match self.write_prep(base_idx) {
            WritePrepOutcome::Restart => return WritePrepResult::Restart,
            WritePrepOutcome::NoMem => return WritePrepResult::Done(PutOutcome::OutOfMemory),
            WritePrepOutcome::Ok => {}
        }

        let home = self.resolve_home(base_idx);
        let mut iter = ScanIter::open(&self.store, home);
        let existing_key_offset = find_key(&mut iter, &entry.key);
        let tail = existing_key_offset.map(|key_offset| {
            let tail_offset = find_version_tail(&mut iter, key_offset);
            (tail_offset, iter.read_header(tail_offset))
        });

        if let Some((want_file_id, want_offset)) = cas {
            let matches = match &tail {
                Some((_, h)) => h.file_id == want_file_id && h.offset == want_offset,
                None => false,
            };
            if !matches {
                return WritePrepResult::Done(PutOutcome::Modified);
            }
        }

        let new_epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let chain_size = iter.chain_size();
        let is_tombstone = entry.is_tombstone();

        match tail {
            Some((tail_offset, tail_header)) if self.min_epoch.load(Ordering::Acquire) > new_epoch => {
                // No pinned snapshot can still be resolving to the version at
                // `tail_offset`, so there's nothing to preserve by appending
                // a new one: overwrite its payload fields in place. `next`
                // (always 0, this is the tail) and `key_size` are untouched.
                // A tombstone only ever replaces `offset`/`epoch`, preserving
                // the last live location for anything inspecting the record.
                let overwritten = if is_tombstone {
                    RawHeader {
                        offset: entry.offset,
                        epoch: new_epoch,
                        ..tail_header
                    }
                } else {
                    RawHeader {
                        file_id: entry.file_id,
                        total_size: entry.total_size,
                        epoch: new_epoch,
                        offset: entry.offset,
                        timestamp: entry.timestamp,
                        next: tail_header.next,
                        key_size: tail_header.key_size,
                    }
                };
                iter.write_header(tail_offset, &overwritten);
            }
            Some((tail_offset, _)) => {
                let (new_offset, write_end) = match entry::checked_append(chain_size, 0) {
                    Some(v) => v,
                    None => return WritePrepResult::Done(PutOutcome::OutOfMemory),
                };
                if !iter.extend_for_write(write_end) {
                    return WritePrepResult::Done(PutOutcome::OutOfMemory);
                }
                let version = RawHeader {
                    file_id: entry.file_id,
                    total_size: entry.total_size,
                    epoch: new_epoch,
                    offset: entry.offset,
                    timestamp: entry.timestamp,
                    next: 0,
                    key_size: 0,
                };
                iter.write_header(new_offset, &version);
                let mut tail_header = iter.read_header(tail_offset);
                tail_header.next = new_offset;
                iter.write_header(tail_offset, &tail_header);
                iter.base_mut().meta.size = write_end;
            }
            None => {
                let (key_offset, write_end) = match entry::checked_append(chain_size, entry.key.len() as u32) {
                    Some(v) => v,
                    None => return WritePrepResult::Done(PutOutcome::OutOfMemory),
                };
                if !iter.extend_for_write(write_end) {
                    return WritePrepResult::Done(PutOutcome::OutOfMemory);
                }
                let header = RawHeader {
                    file_id: entry.file_id,
                    total_size: entry.total_size,
                    epoch: new_epoch,
                    offset: entry.offset,
                    timestamp: entry.timestamp,
                    next: 0,
                    key_size: entry.key.len() as u32,
                };
                iter.write_header(key_offset, &header);
                iter.write_key(key_offset, &entry.key);
                iter.base_mut().meta.size = write_end;
            }
        }

        trace!(epoch = new_epoch, base_idx, "put installed");
        WritePrepResult::Done(PutOutcome::Ok { epoch: new_epoch })
    }

    /// Follows a base page's `alt_idx` redirect, if its chain has been
    /// relocated to swap by an external rebalance pass.
    fn resolve_home(&self, base_idx: u32) -> u32 {
        let alt = self.store.get(base_idx).lock().meta.alt_idx;
        if alt == MAX_PAGE_IDX {
            base_idx
        } else {
            alt
        }
    }

    /// Ensures `base_idx`'s memory page is claimed and ready to receive
    /// writes: clears a lazy free-list tombstone, or evicts a borrower that
    /// has been using this slot as overflow capacity for another chain.
    fn write_prep(&self, base_idx: u32) -> WritePrepOutcome {
        loop {
            let mut guard = self.store.get(base_idx).lock();
            if guard.meta.is_free {
                guard.meta.is_free = false;
                guard.meta.is_borrowed = false;
                guard.meta.prev = MAX_PAGE_IDX;
                guard.meta.next = MAX_PAGE_IDX;
                guard.meta.size = 0;
                return WritePrepOutcome::Ok;
            }
            if !guard.meta.is_borrowed {
                return WritePrepOutcome::Ok;
            }
            // A borrowed page never gets its `size` set by anyone but its
            // true home chain, so this must still be 0 here.
            debug_assert_eq!(guard.meta.size, 0);
            drop(guard);
            match self.reclaim_borrowed_page(base_idx) {
                WritePrepOutcome::Ok => continue,
                other => return other,
            }
        }
    }

    /// Evicts whatever chain is currently borrowing `idx`, relocating its
    /// page content to a freshly allocated page and splicing the neighbors
    /// around it. Locks are taken in chain order (prev, this, next); if the
    /// chain shape changed underneath us the caller restarts.
    fn reclaim_borrowed_page(&self, idx: u32) -> WritePrepOutcome {
        let prev_idx = self.store.get(idx).lock().meta.prev;

        let mut prev_guard = if prev_idx != MAX_PAGE_IDX {
            Some(self.store.get(prev_idx).lock())
        } else {
            None
        };
        let mut this_guard = self.store.get(idx).lock();

        if !this_guard.meta.is_borrowed {
            return WritePrepOutcome::Ok;
        }
        if let Some(pg) = prev_guard.as_ref() {
            if pg.meta.next != idx {
                return WritePrepOutcome::Restart;
            }
        }

        let next_idx = this_guard.meta.next;
        let mut next_guard = if next_idx != MAX_PAGE_IDX {
            Some(self.store.get(next_idx).lock())
        } else {
            None
        };

        let new_idx = match self.store.allocate_page() {
            Ok(Some(i)) => i,
            Ok(None) => return WritePrepOutcome::NoMem,
            Err(e) => {
                warn!(error = %e, "failed to allocate page while reclaiming a borrowed slot");
                return WritePrepOutcome::NoMem;
            }
        };
        let mut new_guard = self.store.get(new_idx).lock();

        std::mem::swap(&mut new_guard.data, &mut this_guard.data);
        new_guard.meta = this_guard.meta;
        new_guard.meta.prev = prev_idx;
        new_guard.meta.next = next_idx;

        if let Some(pg) = prev_guard.as_mut() {
            pg.meta.next = new_idx;
        }
        if let Some(ng) = next_guard.as_mut() {
            ng.meta.prev = new_idx;
        }

        this_guard.meta = PageMeta::fresh();
        this_guard.meta.is_free = false;
        WritePrepOutcome::Ok
    }
}

enum WritePrepResult {
    Done(PutOutcome),
    Restart,
}

/// Scans the flat chain stream for a key record matching `key`, returning
/// its chain offset.
fn find_key(iter: &mut ScanIter<'_>, key: &[u8]) -> Option<u32> {
    let size = iter.chain_size();
    let mut offset = 0u32;
    while offset < size {
        let header = iter.read_header(offset);
        if header.key_size > 0 && iter.key_matches(offset, header.key_size, key) {
            return Some(offset);
        }
        let entry_len = entry::entry_size_for_key(header.key_size);
        offset += entry_len;
    }
    None
}

/// Walks a key's version list (oldest first, chained by `next`), returning
/// the newest version whose epoch is visible at `query_epoch`.
fn resolve_version(iter: &mut ScanIter<'_>, key_offset: u32, query_epoch: u64) -> Option<RawHeader> {
    let mut best: Option<RawHeader> = None;
    let mut offset = key_offset;
    loop {
        let header = iter.read_header(offset);
        if header.epoch <= query_epoch && best.map(|b| header.epoch > b.epoch).unwrap_or(true) {
            best = Some(header);
        }
        if header.next == 0 {
            break;
        }
        offset = header.next;
    }
    best
}

/// Returns the chain offset of the newest (tail) version record for a key,
/// i.e. the one whose `next` field is still `0`.
fn find_version_tail(iter: &mut ScanIter<'_>, key_offset: u32) -> u32 {
    let mut offset = key_offset;
    loop {
        let header = iter.read_header(offset);
        if header.next == 0 {
            return offset;
        }
        offset = header.next;
    }
}

impl Drop for Keydir {
    fn drop(&mut self) {
        if let Err(e) = self.store.truncate_swap_file() {
            warn!(error = %e, "failed to truncate swap file on keydir shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn open_small() -> (tempfile::TempDir, Keydir) {
        let dir = tempfile::tempdir().unwrap();
        let options = KeydirOptions::new(dir.path())
            .num_pages(8)
            .initial_num_swap_pages(2);
        (dir, Keydir::open(options).unwrap())
    }

    fn entry(key: &str, file_id: u32, offset: u64) -> PutEntry {
        PutEntry {
            key: key.as_bytes().to_vec(),
            file_id,
            total_size: 42,
            offset,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn single_key_round_trip() {
        let (_dir, kd) = open_small();
        assert_eq!(kd.put(entry("alpha", 1, 0), None), PutOutcome::Ok { epoch: 2 });
        let epoch = kd.current_epoch();
        match kd.get(b"alpha", epoch) {
            GetOutcome::Found(e) => {
                assert_eq!(e.file_id, 1);
                assert_eq!(e.offset, 0);
                assert!(!e.is_tombstone());
            }
            GetOutcome::NotFound => panic!("expected alpha to be found"),
        }
        assert_eq!(kd.get(b"missing", epoch), GetOutcome::NotFound);
    }

    #[test]
    fn snapshot_isolation_across_epochs() {
        let (_dir, kd) = open_small();
        kd.put(entry("k", 1, 0), None);
        let epoch_after_first = kd.current_epoch();
        // A reader holding epoch_after_first must be protected by a pin, or
        // the second put is free to overwrite that version in place.
        kd.set_min_epoch(Some(epoch_after_first));
        kd.put(entry("k", 2, 100), None);
        let epoch_after_second = kd.current_epoch();

        match kd.get(b"k", epoch_after_first) {
            GetOutcome::Found(e) => assert_eq!(e.file_id, 1),
            GetOutcome::NotFound => panic!("first version must be visible at its own epoch"),
        }
        match kd.get(b"k", epoch_after_second) {
            GetOutcome::Found(e) => assert_eq!(e.file_id, 2),
            GetOutcome::NotFound => panic!("second version must be visible at its own epoch"),
        }
    }

    #[test]
    fn update_appends_a_new_version_when_a_snapshot_is_pinned() {
        let (_dir, kd) = open_small();
        kd.put(entry("k", 1, 0), None);
        let epoch_after_first = kd.current_epoch();
        // Pin a reader at the first version's epoch so the second put cannot
        // safely overwrite it in place.
        kd.set_min_epoch(Some(epoch_after_first));
        let size_after_first = {
            let base = base_page_idx(b"k", kd.store.num_memory_pages());
            kd.store.get(base).lock().meta.size
        };
        kd.put(entry("k", 2, 64), None);
        let size_after_second = {
            let base = base_page_idx(b"k", kd.store.num_memory_pages());
            kd.store.get(base).lock().meta.size
        };
        assert!(size_after_second > size_after_first, "a pinned snapshot must force a version append");
        match kd.get(b"k", epoch_after_first) {
            GetOutcome::Found(e) => assert_eq!(e.file_id, 1, "the pinned version must survive unmodified"),
            GetOutcome::NotFound => panic!("pinned version must remain reachable"),
        }
    }

    #[test]
    fn update_overwrites_in_place_with_no_pinned_snapshot() {
        let (_dir, kd) = open_small();
        kd.put(entry("k", 1, 0), None);
        assert_eq!(kd.min_epoch(), None);
        let size_after_first = {
            let base = base_page_idx(b"k", kd.store.num_memory_pages());
            kd.store.get(base).lock().meta.size
        };
        kd.put(entry("k", 2, 64), None);
        let size_after_second = {
            let base = base_page_idx(b"k", kd.store.num_memory_pages());
            kd.store.get(base).lock().meta.size
        };
        assert_eq!(size_after_second, size_after_first, "with no pin, an update may overwrite in place");
        let epoch = kd.current_epoch();
        match kd.get(b"k", epoch) {
            GetOutcome::Found(e) => assert_eq!(e.file_id, 2),
            GetOutcome::NotFound => panic!("expected k to be found"),
        }
    }

    #[test]
    fn cas_rejects_stale_precondition() {
        let (_dir, kd) = open_small();
        kd.put(entry("k", 1, 0), None);
        let outcome = kd.put(entry("k", 2, 64), Some((99, 999)));
        assert_eq!(outcome, PutOutcome::Modified);

        let outcome = kd.put(entry("k", 2, 64), Some((1, 0)));
        assert!(matches!(outcome, PutOutcome::Ok { .. }));
    }

    #[test]
    fn cas_on_absent_key_is_modified() {
        let (_dir, kd) = open_small();
        let outcome = kd.put(entry("ghost", 1, 0), Some((1, 0)));
        assert_eq!(outcome, PutOutcome::Modified);
    }

    #[test]
    fn remove_installs_a_tombstone() {
        let (_dir, kd) = open_small();
        kd.put(entry("k", 1, 0), None);
        kd.remove(b"k", None);
        let epoch = kd.current_epoch();
        match kd.get(b"k", epoch) {
            GetOutcome::Found(e) => assert!(e.is_tombstone()),
            GetOutcome::NotFound => panic!("a tombstone is still a version, not absence"),
        }
    }

    #[test]
    fn hash_collision_chain_keeps_every_key_reachable() {
        let (_dir, kd) = open_small();
        // num_pages = 8 guarantees repeats quickly; insert enough keys that
        // several must share a base page.
        let keys: Vec<String> = (0..64).map(|i| format!("key-{i}")).collect();
        for (i, k) in keys.iter().enumerate() {
            kd.put(entry(k, 1, i as u64 * 16), None);
        }
        let epoch = kd.current_epoch();
        for (i, k) in keys.iter().enumerate() {
            match kd.get(k.as_bytes(), epoch) {
                GetOutcome::Found(e) => assert_eq!(e.offset, i as u64 * 16),
                GetOutcome::NotFound => panic!("key {k} lost in its collision chain"),
            }
        }
    }

    #[test]
    fn spills_into_swap_once_memory_pages_are_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let options = KeydirOptions::new(dir.path())
            .num_pages(2)
            .initial_num_swap_pages(1);
        let kd = Keydir::open(options).unwrap();
        for i in 0..200 {
            let k = format!("key-{i}");
            assert!(matches!(kd.put(entry(&k, 1, i as u64), None), PutOutcome::Ok { .. }));
        }
        assert!(kd.store.num_swap_pages() >= 1);
        let epoch = kd.current_epoch();
        for i in 0..200 {
            let k = format!("key-{i}");
            match kd.get(k.as_bytes(), epoch) {
                GetOutcome::Found(e) => assert_eq!(e.offset, i as u64),
                GetOutcome::NotFound => panic!("key {k} should have spilled into swap, not vanished"),
            }
        }
    }

    #[test]
    fn fstats_round_trip() {
        let (_dir, kd) = open_small();
        kd.update_fstats(
            3,
            FstatsDelta {
                live_keys: 5,
                total_keys: 5,
                live_bytes: 512,
                total_bytes: 512,
                timestamp: 1_700_000_000,
                expiration_epoch: 0,
            },
        );
        let stats = kd.fstats(3).expect("stats must exist after an update");
        assert_eq!(stats.live_keys, 5);
        assert_eq!(kd.fstats(4), None);
    }

    #[test]
    fn min_epoch_pin_round_trips() {
        let (_dir, kd) = open_small();
        assert_eq!(kd.min_epoch(), None);
        kd.set_min_epoch(Some(7));
        assert_eq!(kd.min_epoch(), Some(7));
        kd.set_min_epoch(None);
        assert_eq!(kd.min_epoch(), None);
    }

    #[test]
    fn concurrent_puts_to_overlapping_keys_lose_no_writer() {
        let (_dir, kd) = open_small();
        let kd = Arc::new(kd);
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let kd = Arc::clone(&kd);
            handles.push(thread::spawn(move || {
                for i in 0..50u32 {
                    let key = format!("shared-{}", i % 5);
                    kd.put(entry(&key, t, (t * 1000 + i) as u64), None);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let epoch = kd.current_epoch();
        for i in 0..5u32 {
            let key = format!("shared-{i}");
            match kd.get(key.as_bytes(), epoch) {
                GetOutcome::Found(_) => {}
                GetOutcome::NotFound => panic!("key {key} vanished under concurrent writers"),
            }
        }
    }
}
