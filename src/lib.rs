//! kvfuse - a POSIX filesystem stored in a conditional-update key-value store.
//!
//! Every piece of persistent state lives in two remote tables: metadata
//! rows keyed by `(parentPath, name)` and 32 KiB content blocks keyed by
//! `(blockId, blockNum)`. There are no transactions; per-record
//! optimistic versioning and conditional-write locks are the only
//! concurrency primitives. The host kernel binding drives the operation
//! surface in [`fs::KvFs`].

pub mod blocks;
pub mod config;
pub mod error;
pub mod fs;
pub mod lock;
pub mod path;
pub mod record;
pub mod store;

pub use error::{FsError, Result};

/// Fixed content block size in bytes.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Longest permitted name component.
pub const MAX_NAME_LEN: usize = 255;

/// Longest permitted table key.
pub const MAX_KEY_LEN: usize = 1024;

/// Longest permitted path.
pub const MAX_PATH_LEN: usize = 4096;

/// Retry budget shared by optimistic saves and lock acquisition.
pub const MAX_RETRIES: u32 = 5;

/// Name of the hidden directory holding tombstoned files.
pub const DELETED_LINKS: &str = "DELETED_LINKS";

/// Full path of the tombstone directory.
pub const DELETED_LINKS_PATH: &str = "/DELETED_LINKS";
