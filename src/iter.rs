//! Locked cursor over a single hash chain.
//!
//! A chain is the linked list of pages reachable from one base page via
//! `meta.next`. Byte positions inside a chain are expressed as a single
//! cumulative `chain_offset`: page `chain_offset / PAGE_SIZE` (counting from
//! the base page as page 0), byte `chain_offset % PAGE_SIZE` within it. This
//! is also exactly the page's position in the `next` linked list, so
//! "extend the chain to cover this offset" and "lock the next physical page"
//! are the same operation.
//!
//! `ScanIter` never crosses a public API boundary: it is built, used, and
//! dropped entirely within one [`crate::Keydir`] operation. Locks are
//! acquired base-first (chain order) and released tail-first, enforced by
//! an explicit `Drop` rather than relying on `Vec`'s front-to-back drop order.

use crate::config::{MAX_PAGE_IDX, PAGE_SIZE};
use crate::entry::{self, RawHeader};
use crate::page::{PageGuard, PageStore};

pub struct ScanIter<'s> {
    store: &'s PageStore,
    locked: Vec<(u32, PageGuard<'s>)>,
}

impl<'s> ScanIter<'s> {
    /// Locks just the base page of the chain at `base_idx`.
    pub fn open(store: &'s PageStore, base_idx: u32) -> Self {
        let guard = store.get(base_idx).lock();
        ScanIter {
            store,
            locked: vec![(base_idx, guard)],
        }
    }

    pub fn base_idx(&self) -> u32 {
        self.locked[0].0
    }

    pub fn base(&self) -> &PageGuard<'s> {
        &self.locked[0].1
    }

    pub fn base_mut(&mut self) -> &mut PageGuard<'s> {
        &mut self.locked[0].1
    }

    pub fn chain_size(&self) -> u32 {
        self.locked[0].1.meta.size
    }

    fn pages_needed_for(end: u32) -> u32 {
        (end + PAGE_SIZE as u32 - 1) / PAGE_SIZE as u32
    }

    fn locate(chain_offset: u32) -> (usize, u32) {
        let pos = (chain_offset / PAGE_SIZE as u32) as usize;
        let in_page = chain_offset % PAGE_SIZE as u32;
        (pos, in_page)
    }

    /// Locks chain pages, following already-linked `next` pointers, through
    /// the page containing byte `end`. Callers must only request offsets
    /// within the chain's current `size` (or the header region about to be
    /// read, which is always inside `size`).
    pub fn extend_for_read(&mut self, end: u32) {
        let needed = Self::pages_needed_for(end.max(1));
        while (self.locked.len() as u32) < needed {
            let next_idx = self.locked.last().unwrap().1.meta.next;
            assert_ne!(next_idx, MAX_PAGE_IDX, "chain ended before expected byte offset");
            let guard = self.store.get(next_idx).lock();
            self.locked.push((next_idx, guard));
        }
    }

    /// Locks and, if necessary, allocates and links new pages so that the
    /// chain covers byte `end`. Returns `false` if a new page was needed but
    /// the store is out of memory; the iterator is left with whatever
    /// pages were successfully allocated.
    pub fn extend_for_write(&mut self, end: u32) -> bool {
        let needed = Self::pages_needed_for(end.max(1));
        while (self.locked.len() as u32) < needed {
            let existing_next = self.locked.last().unwrap().1.meta.next;
            let new_idx = if existing_next != MAX_PAGE_IDX {
                existing_next
            } else {
                match self.store.allocate_page() {
                    Ok(Some(idx)) => idx,
                    _ => return false,
                }
            };
            let prev_idx = self.locked.last().unwrap().0;
            if existing_next == MAX_PAGE_IDX {
                self.locked.last_mut().unwrap().1.meta.next = new_idx;
            }
            let mut guard = self.store.get(new_idx).lock();
            guard.meta.prev = prev_idx;
            if new_idx < self.store.num_memory_pages() {
                // This index doubles as some other key's base page. Mark it
                // borrowed so that key's write_prep reclaims it instead of
                // silently overwriting the chain we're about to extend into it.
                guard.meta.is_borrowed = true;
            }
            self.locked.push((new_idx, guard));
        }
        true
    }

    pub fn read_header(&mut self, chain_offset: u32) -> RawHeader {
        self.extend_for_read(chain_offset + entry::KEY_OFFSET);
        let (pos, in_page) = Self::locate(chain_offset);
        let buf = self.locked[pos].1.data.as_slice();
        RawHeader::read(buf, in_page as usize)
    }

    pub fn read_key(&mut self, chain_offset: u32, key_size: u32) -> Vec<u8> {
        let key_start = chain_offset + entry::KEY_OFFSET;
        if key_size == 0 {
            return Vec::new();
        }
        self.extend_for_read(key_start + key_size);
        let mut out = Vec::with_capacity(key_size as usize);
        let mut remaining = key_size;
        let mut cursor = key_start;
        while remaining > 0 {
            let (pos, in_page) = Self::locate(cursor);
            let buf = self.locked[pos].1.data.as_slice();
            let avail = PAGE_SIZE as u32 - in_page;
            let take = avail.min(remaining);
            out.extend_from_slice(&buf[in_page as usize..(in_page + take) as usize]);
            remaining -= take;
            cursor += take;
        }
        out
    }

    pub fn write_header(&mut self, chain_offset: u32, header: &RawHeader) {
        let (pos, in_page) = Self::locate(chain_offset);
        let buf = self.locked[pos].1.data.as_mut_slice();
        header.write(buf, in_page as usize);
    }

    pub fn write_key(&mut self, chain_offset: u32, key: &[u8]) {
        let key_start = chain_offset + entry::KEY_OFFSET;
        let mut remaining = key.len() as u32;
        let mut cursor = key_start;
        let mut written = 0usize;
        while remaining > 0 {
            // Recomputed every iteration: each page needs its own destination
            // slice, never reused across a page crossing.
            let (pos, in_page) = Self::locate(cursor);
            let buf = self.locked[pos].1.data.as_mut_slice();
            let avail = PAGE_SIZE as u32 - in_page;
            let take = avail.min(remaining);
            buf[in_page as usize..(in_page + take) as usize]
                .copy_from_slice(&key[written..written + take as usize]);
            written += take as usize;
            remaining -= take;
            cursor += take;
        }
    }

    /// Compares `key` against the key stored at `chain_offset` without
    /// allocating when the two differ in length.
    pub fn key_matches(&mut self, chain_offset: u32, key_size: u32, key: &[u8]) -> bool {
        if key_size != key.len() as u32 {
            return false;
        }
        self.read_key(chain_offset, key_size) == key
    }
}

impl<'s> Drop for ScanIter<'s> {
    fn drop(&mut self) {
        while self.locked.pop().is_some() {}
    }
}
