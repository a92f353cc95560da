//! Fixed-size pages and the metadata every page carries, whether backed by
//! plain heap memory or by a memory-mapped region of the swap file.

pub mod store;
pub use store::PageStore;

use std::sync::{Mutex, MutexGuard};

use crate::config::{MAX_PAGE_IDX, PAGE_SIZE};

/// Per-page bookkeeping. Only meaningful on a *base* page: `size`, `alt_idx`,
/// `dead_bytes`, `is_borrowed`. Every page, base or not, carries `prev`,
/// `next`, `next_free`, `is_free`.
#[derive(Debug, Clone, Copy)]
pub struct PageMeta {
    pub prev: u32,
    pub next: u32,
    pub next_free: u32,
    pub is_free: bool,
    /// Bytes currently in use across the chain. Meaningful on base pages only.
    pub size: u32,
    /// If not `MAX_PAGE_IDX`, this base page's home chain has relocated to
    /// the swap page at this global index, and the memory slot is available
    /// to host a foreign chain as a *borrowed* base.
    pub alt_idx: u32,
    pub dead_bytes: u32,
    pub is_borrowed: bool,
}

impl PageMeta {
    pub(crate) fn fresh() -> Self {
        PageMeta {
            prev: MAX_PAGE_IDX,
            next: MAX_PAGE_IDX,
            next_free: MAX_PAGE_IDX,
            is_free: true,
            size: 0,
            alt_idx: MAX_PAGE_IDX,
            dead_bytes: 0,
            is_borrowed: false,
        }
    }
}

/// The byte storage backing a page: either a plain heap buffer (memory page)
/// or a private `MAP_SHARED` mapping of one `PAGE_SIZE` region of the swap
/// file (swap page). Each swap page is its own independent mapping, because
/// swap arrays are heterogeneous generations grown at different times.
pub enum PageData {
    Memory(Box<[u8; PAGE_SIZE]>),
    Swap(memmap2::MmapMut),
}

impl PageData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            PageData::Memory(b) => b.as_slice(),
            PageData::Swap(m) => &m[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            PageData::Memory(b) => b.as_mut_slice(),
            PageData::Swap(m) => &mut m[..],
        }
    }
}

/// Everything guarded by a page's mutex: its metadata and its bytes.
pub struct PageInner {
    pub meta: PageMeta,
    pub data: PageData,
}

/// A page: fixed `PAGE_SIZE` bytes plus metadata, all behind a single mutex.
/// One mutex per page is the entire locking granularity of the keydir — no
/// lock is ever held across more than the handful of pages a single chain
/// operation touches.
pub struct Page {
    inner: Mutex<PageInner>,
}

pub type PageGuard<'a> = MutexGuard<'a, PageInner>;

impl Page {
    pub fn new_memory() -> Self {
        Page {
            inner: Mutex::new(PageInner {
                meta: PageMeta::fresh(),
                data: PageData::Memory(Box::new([0u8; PAGE_SIZE])),
            }),
        }
    }

    pub fn new_swap(mmap: memmap2::MmapMut, next_free: u32) -> Self {
        let mut meta = PageMeta::fresh();
        meta.next_free = next_free;
        Page {
            inner: Mutex::new(PageInner {
                meta,
                data: PageData::Swap(mmap),
            }),
        }
    }

    pub fn lock(&self) -> PageGuard<'_> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_lock(&self) -> Option<PageGuard<'_>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::WouldBlock) => None,
            Err(std::sync::TryLockError::Poisoned(e)) => Some(e.into_inner()),
        }
    }
}
