//! Owns every page, memory and swap alike, as a sequence of append-only
//! "generations": generation 0 is the fixed memory-page array, generation 1
//! is the swap array created at construction time, and generation *k* for
//! k > 1 is the swap array created by the k-th call to [`PageStore::expand_swap`].
//!
//! A page's global index is its position within the concatenation of all
//! generations in order. Memory pages occupy `[0, num_memory_pages)`; swap
//! pages occupy `[num_memory_pages, num_memory_pages + num_swap_pages)`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::config::{
    FREE_LIST_STRIDE, MAX_PAGE_IDX, MAX_PATH_LEN, PAGE_SIZE, SWAP_FILE_MODE, SWAP_FILE_NAME,
};
use crate::common::KeydirError;

use super::Page;

/// Builds the next_free chain a memory-page free list starts with. Pages are
/// visited in `stride`-separated interleavings (0, stride, 2*stride, ...,
/// then 1, stride+1, ...) rather than sequential order, so that pages handed
/// out to concurrently-allocating threads early on land far apart in the
/// page array instead of clustering at the low end.
fn seed_free_chain(base: u32, count: u32, stride: u32) -> Vec<(u32, u32)> {
    let mut order = Vec::with_capacity(count as usize);
    let stride = stride.max(1).min(count.max(1));
    for offset in 0..stride {
        let mut i = offset;
        while i < count {
            order.push(base + i);
            i += stride;
        }
    }
    let mut links = Vec::with_capacity(order.len());
    for (pos, &idx) in order.iter().enumerate() {
        let next = order.get(pos + 1).copied().unwrap_or(MAX_PAGE_IDX);
        links.push((idx, next));
    }
    links
}

pub struct PageStore {
    num_memory_pages: u32,
    generations: RwLock<Vec<Arc<Vec<Page>>>>,
    memory_free_list_head: AtomicU32,
    swap_free_list_head: AtomicU32,
    num_swap_pages: AtomicU32,
    grow_mutex: Mutex<()>,
    swap_file: Mutex<File>,
    swap_path: PathBuf,
}

impl PageStore {
    pub fn open(basedir: &Path, num_pages: u32, initial_num_swap_pages: u32) -> Result<Self, KeydirError> {
        let swap_path = basedir.join(SWAP_FILE_NAME);
        let path_len = swap_path.as_os_str().len();
        if path_len > MAX_PATH_LEN {
            return Err(KeydirError::PathTooLong {
                basedir: basedir.to_path_buf(),
                limit: MAX_PATH_LEN,
            });
        }
        if num_pages == 0 {
            return Err(KeydirError::InvalidConfig("num_pages must be > 0".into()));
        }

        let mut memory_pages = Vec::with_capacity(num_pages as usize);
        for _ in 0..num_pages {
            memory_pages.push(Page::new_memory());
        }
        let memory_chain = seed_free_chain(0, num_pages, FREE_LIST_STRIDE);
        for (idx, next) in &memory_chain {
            memory_pages[*idx as usize].lock().meta.next_free = *next;
        }
        let memory_head = memory_chain.first().map(|(idx, _)| *idx).unwrap_or(MAX_PAGE_IDX);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(SWAP_FILE_MODE)
            .open(&swap_path)?;
        file.set_len(initial_num_swap_pages as u64 * PAGE_SIZE as u64)?;

        let mut swap_pages = Vec::with_capacity(initial_num_swap_pages as usize);
        for i in 0..initial_num_swap_pages {
            let offset = i as u64 * PAGE_SIZE as u64;
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(offset)
                    .len(PAGE_SIZE)
                    .map_mut(&file)?
            };
            swap_pages.push(Page::new_swap(mmap, MAX_PAGE_IDX));
        }
        let swap_chain = seed_free_chain(num_pages, initial_num_swap_pages, FREE_LIST_STRIDE);
        for (idx, next) in &swap_chain {
            swap_pages[(*idx - num_pages) as usize].lock().meta.next_free = *next;
        }
        let swap_head = swap_chain.first().map(|(idx, _)| *idx).unwrap_or(MAX_PAGE_IDX);

        Ok(PageStore {
            num_memory_pages: num_pages,
            generations: RwLock::new(vec![Arc::new(memory_pages), Arc::new(swap_pages)]),
            memory_free_list_head: AtomicU32::new(memory_head),
            swap_free_list_head: AtomicU32::new(swap_head),
            num_swap_pages: AtomicU32::new(initial_num_swap_pages),
            grow_mutex: Mutex::new(()),
            swap_file: Mutex::new(file),
            swap_path,
        })
    }

    pub fn num_memory_pages(&self) -> u32 {
        self.num_memory_pages
    }

    pub fn num_swap_pages(&self) -> u32 {
        self.num_swap_pages.load(Ordering::Acquire)
    }

    /// Resolves a global page index to its page.
    ///
    /// # Panics
    /// Panics if `idx` is out of range of any published generation.
    pub fn get(&self, idx: u32) -> &Page {
        let gens = self.generations.read().unwrap();
        let mut base = 0u32;
        for gen in gens.iter() {
            let len = gen.len() as u32;
            if idx < base + len {
                let page_ptr: *const Page = &gen[(idx - base) as usize];
                // SAFETY: generations are append-only for the life of `self` — once
                // an Arc<Vec<Page>> is published here it is never removed or mutated,
                // so the pointee outlives the read guard we're about to drop.
                return unsafe { &*page_ptr };
            }
            base += len;
        }
        panic!("page index {idx} out of range (have {base} pages)");
    }

    fn pop_free(&self, head: &AtomicU32) -> Option<u32> {
        loop {
            let cur = head.load(Ordering::Acquire);
            if cur == MAX_PAGE_IDX {
                return None;
            }
            let page = self.get(cur);
            let mut guard = page.lock();
            if !guard.meta.is_free {
                drop(guard);
                continue;
            }
            let next = guard.meta.next_free;
            if head
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                guard.meta.is_free = false;
                guard.meta.next_free = MAX_PAGE_IDX;
                return Some(cur);
            }
        }
    }

    fn push_free(&self, head: &AtomicU32, idx: u32) {
        let page = self.get(idx);
        loop {
            let cur = head.load(Ordering::Acquire);
            {
                let mut guard = page.lock();
                guard.meta.is_free = true;
                guard.meta.next_free = cur;
            }
            if head
                .compare_exchange(cur, idx, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Allocates a free page, preferring memory over swap. Returns `Ok(None)`
    /// when swap is exhausted and growing it failed (out of memory).
    pub fn allocate_page(&self) -> io::Result<Option<u32>> {
        if let Some(idx) = self.pop_free(&self.memory_free_list_head) {
            return Ok(Some(idx));
        }
        loop {
            if let Some(idx) = self.pop_free(&self.swap_free_list_head) {
                return Ok(Some(idx));
            }
            let before = self.num_swap_pages.load(Ordering::Acquire);
            self.expand_swap()?;
            let after = self.num_swap_pages.load(Ordering::Acquire);
            if after == before {
                warn!("allocate_page: swap exhausted and expand_swap made no progress");
                return Ok(None);
            }
        }
    }

    pub fn add_free_page(&self, idx: u32) {
        debug!(page = idx, "add_free_page: returning page to free list");
        if idx < self.num_memory_pages {
            self.push_free(&self.memory_free_list_head, idx);
        } else {
            self.push_free(&self.swap_free_list_head, idx);
        }
    }

    /// Doubles the swap file and publishes a new generation of swap pages.
    /// Serialized by `grow_mutex`; a thread that loses the race to grow
    /// simply observes the free list the winner populated.
    fn expand_swap(&self) -> io::Result<()> {
        let _guard = self.grow_mutex.lock().unwrap();
        if self.swap_free_list_head.load(Ordering::Acquire) != MAX_PAGE_IDX {
            return Ok(());
        }
        let old_num_swap = self.num_swap_pages.load(Ordering::Acquire);
        let add = old_num_swap.max(1);
        let old_total_bytes = old_num_swap as u64 * PAGE_SIZE as u64;
        let new_total_bytes = (old_num_swap + add) as u64 * PAGE_SIZE as u64;
        debug!(
            old_num_swap,
            add, new_total_bytes, "expand_swap: growing swap file"
        );

        let file = self.swap_file.lock().unwrap();
        file.set_len(new_total_bytes)?;

        let mut new_pages = Vec::with_capacity(add as usize);
        for i in 0..add {
            let offset = old_total_bytes + i as u64 * PAGE_SIZE as u64;
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(offset)
                    .len(PAGE_SIZE)
                    .map_mut(&*file)
            };
            match mmap {
                Ok(m) => new_pages.push(Page::new_swap(m, MAX_PAGE_IDX)),
                Err(e) => {
                    if new_pages.is_empty() {
                        return Err(e);
                    }
                    warn!(
                        error = %e,
                        built = new_pages.len(),
                        requested = add,
                        "expand_swap: partial mmap failure, continuing with pages mapped so far"
                    );
                    break;
                }
            }
        }
        drop(file);

        let built = new_pages.len() as u32;
        if built == 0 {
            return Ok(());
        }

        let base = self.num_memory_pages + old_num_swap;
        for (i, page) in new_pages.iter().enumerate() {
            let next = if (i as u32) + 1 < built {
                base + i as u32 + 1
            } else {
                MAX_PAGE_IDX
            };
            page.lock().meta.next_free = next;
        }

        self.generations.write().unwrap().push(Arc::new(new_pages));
        self.num_swap_pages.fetch_add(built, Ordering::AcqRel);
        self.swap_free_list_head.store(base, Ordering::Release);
        debug!(built, base, "expand_swap: published new swap generation");
        Ok(())
    }

    /// Truncates the swap file to zero length. Called on `Drop` — the swap
    /// file is never unlinked, only emptied, so a crash leaves an empty but
    /// visible file rather than a dangling inode.
    pub fn truncate_swap_file(&self) -> io::Result<()> {
        self.swap_file.lock().unwrap().set_len(0)
    }

    pub fn swap_path(&self) -> &Path {
        &self.swap_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_chain_links_every_page_exactly_once() {
        let links = seed_free_chain(0, 37, 16);
        let mut seen = vec![false; 37];
        for (idx, _) in &links {
            assert!(!seen[*idx as usize], "page {idx} seeded twice");
            seen[*idx as usize] = true;
        }
        assert!(seen.into_iter().all(|b| b), "every page must be in the free list");
    }

    #[test]
    fn open_and_allocate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::open(dir.path(), 4, 2).unwrap();
        assert_eq!(store.num_memory_pages(), 4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let idx = store.allocate_page().unwrap().unwrap();
            assert!(idx < 4);
            assert!(seen.insert(idx));
        }
        // memory exhausted, next comes from swap
        let idx = store.allocate_page().unwrap().unwrap();
        assert!(idx >= 4);
    }

    #[test]
    fn swap_grows_past_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::open(dir.path(), 1, 1).unwrap();
        let _ = store.allocate_page().unwrap().unwrap(); // the one memory page
        let mut allocated = Vec::new();
        for _ in 0..8 {
            allocated.push(store.allocate_page().unwrap().unwrap());
        }
        assert!(store.num_swap_pages() >= 8);
        assert_eq!(allocated.iter().collect::<std::collections::HashSet<_>>().len(), 8);
    }

    #[test]
    fn free_and_reallocate() {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::open(dir.path(), 2, 0).unwrap();
        let a = store.allocate_page().unwrap().unwrap();
        store.add_free_page(a);
        let b = store.allocate_page().unwrap().unwrap();
        assert_eq!(a, b);
    }
}
