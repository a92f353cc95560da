//! Configuration constants for keydir.
//! Caution: if you change the entry layout constants below, any previously
//! written swap file becomes unreadable garbage (it is never treated as
//! durable, so this only matters within a single process lifetime).

pub const _NAME: &str = "keydir";
pub const _VERSION: &str = "0.1.0";

pub const LOG_LEVEL: &str = "debug";
pub const LOG_PATH: &str = "./logs/keydir.log";

/// Size of every memory page and every swap page.
pub const PAGE_SIZE: usize = 4 * 1024;

/// Sentinel "no page" index, distinct from `MAX_OFFSET`/`MAX_FILE_ID`/`MAX_EPOCH`.
pub const MAX_PAGE_IDX: u32 = u32::MAX;

/// Tombstone marker stored in an entry's `offset` field.
pub const MAX_OFFSET: u64 = u64::MAX;

/// Tombstone marker stored in an entry's `file_id` field.
pub const MAX_FILE_ID: u32 = u32::MAX;

/// "No snapshot pinned" sentinel for `min_epoch`.
pub const MAX_EPOCH: u64 = u64::MAX;

/// Seed passed to murmur3 when hashing a key to its base page.
pub const HASH_SEED: u32 = 42;

/// Stride used when seeding the memory-page free list at construction time.
pub const FREE_LIST_STRIDE: u32 = 16;

/// File name of the memory-mapped swap file under a keydir's basedir.
pub const SWAP_FILE_NAME: &str = "bitcask.swap";

/// Permission bits the swap file is created with (owner read/write only).
pub const SWAP_FILE_MODE: u32 = 0o600;

/// Maximum basedir path length, including the `/bitcask.swap` suffix.
pub const MAX_PATH_LEN: usize = 1023;
