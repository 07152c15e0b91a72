//! Distributed locks built from conditional writes on the metadata table.
//!
//! Three primitives, each re-entrant per acquisition handle:
//!
//! * [`ExclusiveLock`] --- a `lockOwner` UUID guarding record-level
//!   critical sections (file writes, truncates, deletes).
//! * [`SharedLock`] --- a `readLock` counter, granted while no
//!   `writeLock` is present.
//! * [`WriteLock`] --- a `writeLock` UUID, granted while no writer and no
//!   readers are present.
//!
//! Acquisition retries the conditional update with a one second sleep, up
//! to five times unless the caller asked to wait; exhaustion surfaces
//! `EAGAIN`. Releases against a record that was deleted under the lock
//! are skipped, since the row no longer exists.

pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{FsError, Result};
use crate::path;
use crate::store::{attr, Expected, Gateway, Key, StoreError, Update};
use crate::MAX_RETRIES;

/// Pause between conditional-update attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

fn lock_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn key_of(path: &str) -> Key {
    let (parent, name) = path::split(path);
    Key::meta(parent, name)
}

/// Runs a conditional update until it commits, the retry budget runs out
/// or the backend fails hard.
async fn acquire_loop(
    gateway: &Gateway,
    key: &Key,
    update: &Update,
    expected: &[Expected],
    wait: bool,
    what: &str,
    path: &str,
) -> Result<()> {
    let mut retries = 0;
    while wait || retries < MAX_RETRIES {
        match gateway.update_meta(key, update, expected).await {
            Ok(_) => {
                trace!(path, "got the {what}");
                return Ok(());
            }
            Err(StoreError::ConditionFailed) => {
                // Someone holds a conflicting lock; back off and retry.
                retries += 1;
                sleep(RETRY_DELAY).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
    debug!(path, "cannot take {what}");
    Err(FsError::Again)
}

/// Record-level mutual exclusion via the `lockOwner` attribute.
pub struct ExclusiveLock {
    gateway: Arc<Gateway>,
    path: String,
    lock_id: String,
    acquired: u32,
}

impl ExclusiveLock {
    pub fn new(gateway: Arc<Gateway>, path: impl Into<String>) -> Self {
        ExclusiveLock { gateway, path: path.into(), lock_id: lock_id(), acquired: 0 }
    }

    pub async fn acquire(&mut self) -> Result<()> {
        if self.acquired > 0 {
            self.acquired += 1;
            trace!(path = %self.path, depth = self.acquired, "re-entrant exclusive lock");
            return Ok(());
        }
        let update = Update::new().set(attr::LOCK_OWNER, self.lock_id.clone());
        let expected = [Expected::absent(attr::LOCK_OWNER)];
        acquire_loop(
            &self.gateway,
            &key_of(&self.path),
            &update,
            &expected,
            false,
            "exclusive lock",
            &self.path,
        )
        .await?;
        self.acquired = 1;
        Ok(())
    }

    /// Clears `lockOwner` if this handle owns it. `record_deleted` skips
    /// the write when the row was removed inside the critical section.
    pub async fn release(&mut self, record_deleted: bool) -> Result<()> {
        self.acquired = self.acquired.saturating_sub(1);
        if self.acquired > 0 {
            trace!(path = %self.path, depth = self.acquired, "re-entrant exclusive unlock");
            return Ok(());
        }
        if record_deleted {
            trace!(path = %self.path, "not releasing lock, record was deleted");
            return Ok(());
        }
        let update = Update::new().remove(attr::LOCK_OWNER);
        let expected = [Expected::equals(attr::LOCK_OWNER, self.lock_id.clone())];
        self.gateway.update_meta(&key_of(&self.path), &update, &expected).await?;
        Ok(())
    }
}

/// Shared lock via the `readLock` counter.
pub struct SharedLock {
    gateway: Arc<Gateway>,
    path: String,
    acquired: u32,
}

impl SharedLock {
    pub fn new(gateway: Arc<Gateway>, path: impl Into<String>) -> Self {
        SharedLock { gateway, path: path.into(), acquired: 0 }
    }

    /// Resumes a handle for a lock this process already holds once.
    pub fn resume(gateway: Arc<Gateway>, path: impl Into<String>) -> Self {
        SharedLock { gateway, path: path.into(), acquired: 1 }
    }

    pub async fn acquire(&mut self, wait: bool) -> Result<()> {
        if self.acquired > 0 {
            self.acquired += 1;
            return Ok(());
        }
        let update = Update::new().add(attr::READ_LOCK, 1);
        let expected = [Expected::absent(attr::WRITE_LOCK)];
        acquire_loop(
            &self.gateway,
            &key_of(&self.path),
            &update,
            &expected,
            wait,
            "read lock",
            &self.path,
        )
        .await?;
        self.acquired = 1;
        Ok(())
    }

    pub async fn release(&mut self, record_deleted: bool) -> Result<()> {
        self.acquired = self.acquired.saturating_sub(1);
        if self.acquired > 0 {
            return Ok(());
        }
        if record_deleted {
            trace!(path = %self.path, "not releasing read lock, record was deleted");
            return Ok(());
        }
        let update = Update::new().add(attr::READ_LOCK, -1);
        self.gateway.update_meta(&key_of(&self.path), &update, &[]).await?;
        Ok(())
    }
}

/// Exclusive writer lock via the `writeLock` attribute.
pub struct WriteLock {
    gateway: Arc<Gateway>,
    path: String,
    lock_id: String,
    acquired: u32,
}

impl WriteLock {
    pub fn new(gateway: Arc<Gateway>, path: impl Into<String>) -> Self {
        WriteLock { gateway, path: path.into(), lock_id: lock_id(), acquired: 0 }
    }

    /// Resumes a handle for a lock this process already holds once.
    pub fn resume(gateway: Arc<Gateway>, path: impl Into<String>, lock_id: String) -> Self {
        WriteLock { gateway, path: path.into(), lock_id, acquired: 1 }
    }

    pub fn id(&self) -> &str {
        &self.lock_id
    }

    pub async fn acquire(&mut self, wait: bool) -> Result<()> {
        if self.acquired > 0 {
            self.acquired += 1;
            return Ok(());
        }
        let update = Update::new().set(attr::WRITE_LOCK, self.lock_id.clone());
        let expected = [
            Expected::absent(attr::WRITE_LOCK),
            Expected::equals(attr::READ_LOCK, 0i64),
        ];
        acquire_loop(
            &self.gateway,
            &key_of(&self.path),
            &update,
            &expected,
            wait,
            "write lock",
            &self.path,
        )
        .await?;
        self.acquired = 1;
        Ok(())
    }

    pub async fn release(&mut self, record_deleted: bool) -> Result<()> {
        self.acquired = self.acquired.saturating_sub(1);
        if self.acquired > 0 {
            return Ok(());
        }
        if record_deleted {
            trace!(path = %self.path, "not releasing write lock, record was deleted");
            return Ok(());
        }
        let update = Update::new().remove(attr::WRITE_LOCK);
        let expected = [Expected::equals(attr::WRITE_LOCK, self.lock_id.clone())];
        self.gateway.update_meta(&key_of(&self.path), &update, &expected).await?;
        Ok(())
    }
}
