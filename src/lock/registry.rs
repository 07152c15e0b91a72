//! Per-process registry of POSIX advisory locks.
//!
//! A KV round-trip per lock transition is expensive, so the process keeps
//! a local table of advisory locks per path and only touches the KV lock
//! attributes on the 0→1 and 1→0 transitions of that table. `open` and
//! `release` reference-count entries so a path's bookkeeping disappears
//! when the last handle goes away.
//!
//! The registry mutex is held only for the table manipulation itself,
//! never across a KV call: callers decide under the mutex whether a KV
//! round-trip is needed, drop it, then perform the round-trip.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use crate::error::{FsError, Result};

/// A lock as recorded locally for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalLock {
    Shared,
    Exclusive,
}

/// The KV-level lock the process holds on behalf of a path's local
/// holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvHold {
    /// One increment of the `readLock` counter.
    Read,
    /// The `writeLock` UUID written by this process.
    Write(String),
}

/// Outcome of a local unlock.
#[derive(Debug, PartialEq, Eq)]
pub enum Unlock {
    /// The owner held no lock on this path.
    NotHeld,
    /// Other local holders remain; the KV lock stays.
    Retained,
    /// The last local holder left; release the returned KV hold.
    LastHolder(Option<KvHold>),
}

#[derive(Default)]
struct Entry {
    owners: HashMap<u64, LocalLock>,
    kv: Option<KvHold>,
    refs: usize,
}

/// Path-keyed advisory lock table of this process.
#[derive(Default)]
pub struct LockRegistry {
    inner: Mutex<HashMap<String, Entry>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference-counts the entry for an opened file.
    pub fn open(&self, path: &str) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let entry = inner.entry(path.to_owned()).or_default();
        entry.refs += 1;
        trace!(path, refs = entry.refs, "registry open");
    }

    /// Drops one reference; the entry disappears with the last one.
    pub fn release(&self, path: &str) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(entry) = inner.get_mut(path) {
            entry.refs = entry.refs.saturating_sub(1);
            trace!(path, refs = entry.refs, "registry release");
            if entry.refs == 0 && entry.owners.is_empty() {
                inner.remove(path);
            }
        }
    }

    /// Registers a shared lock for `owner`. Returns `true` when this is
    /// the first local holder and the KV read lock must be acquired.
    pub fn read_lock(&self, path: &str, owner: u64) -> Result<bool> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let entry = inner.entry(path.to_owned()).or_default();
        match entry.owners.get(&owner) {
            Some(LocalLock::Exclusive) => Err(FsError::Busy),
            Some(LocalLock::Shared) => Ok(false),
            None => {
                let first = entry.owners.is_empty();
                entry.owners.insert(owner, LocalLock::Shared);
                trace!(path, owner, first, "registry read lock");
                Ok(first)
            }
        }
    }

    /// Registers an exclusive lock for `owner`. Only an empty table can
    /// grant it; a repeated request by the same owner is a no-op.
    /// Returns `true` when the KV write lock must be acquired.
    pub fn write_lock(&self, path: &str, owner: u64) -> Result<bool> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let entry = inner.entry(path.to_owned()).or_default();
        if entry.owners.get(&owner) == Some(&LocalLock::Exclusive) {
            return Ok(false);
        }
        if !entry.owners.is_empty() {
            return Err(FsError::Busy);
        }
        entry.owners.insert(owner, LocalLock::Exclusive);
        trace!(path, owner, "registry write lock");
        Ok(true)
    }

    /// Records the KV hold acquired after a granting
    /// [`LockRegistry::read_lock`] or [`LockRegistry::write_lock`].
    pub fn note_kv(&self, path: &str, hold: KvHold) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(entry) = inner.get_mut(path) {
            entry.kv = Some(hold);
        }
    }

    /// Removes `owner`'s lock and reports whether the KV lock must be
    /// released.
    pub fn unlock(&self, path: &str, owner: u64) -> Unlock {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let Some(entry) = inner.get_mut(path) else {
            return Unlock::NotHeld;
        };
        if entry.owners.remove(&owner).is_none() {
            return Unlock::NotHeld;
        }
        trace!(path, owner, remaining = entry.owners.len(), "registry unlock");
        if entry.owners.is_empty() {
            let hold = entry.kv.take();
            if entry.refs == 0 {
                inner.remove(path);
            }
            Unlock::LastHolder(hold)
        } else {
            Unlock::Retained
        }
    }

    /// Backs out a local grant whose KV acquisition failed.
    pub fn rollback(&self, path: &str, owner: u64) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(entry) = inner.get_mut(path) {
            entry.owners.remove(&owner);
            if entry.refs == 0 && entry.owners.is_empty() {
                inner.remove(path);
            }
        }
    }
}
