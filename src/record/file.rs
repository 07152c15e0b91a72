//! Regular files: block-striped content, soft delete and hard-link
//! bookkeeping.
//!
//! A File owns one partition of the blocks table through its `blockId`.
//! Content mutations run inside the record's exclusive-lock critical
//! section; the stat row is updated afterwards with a version-coupled
//! save, so `st_size` only ever grows to the conservative maximum under
//! concurrent writers.

use tracing::debug;
use uuid::Uuid;

use crate::blocks::{block_span, BlockStore, BlockView};
use crate::error::{FsError, Result};
use crate::lock::ExclusiveLock;
use crate::record::{unix_now, Accessor, Record, RecordData, RecordKind};
use crate::store::{attr, StoreError, Update};
use crate::{BLOCK_SIZE, DELETED_LINKS_PATH, MAX_RETRIES};

/// Mints the file's `blockId` and inode number from the global counter.
pub(super) async fn init_file(accessor: &Accessor, data: &mut RecordData) -> Result<()> {
    if data.block_id.is_none() {
        let id = accessor.gateway.next_id().await?;
        data.block_id = Some(id.to_string());
        data.ino = id as u64;
    }
    Ok(())
}

/// Allocates block 0, which exists from the moment the file does.
pub(super) async fn allocate_first_block(accessor: &Accessor, data: &RecordData) -> Result<()> {
    let block_id = data.block_id.as_deref().ok_or(FsError::IO)?;
    match accessor.blocks.create(block_id, 0).await {
        Ok(_) => Ok(()),
        Err(StoreError::AlreadyExists) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Record {
    fn require_file(&self) -> Result<&str> {
        if self.data.kind != RecordKind::File {
            return Err(FsError::InvalidArgument);
        }
        self.data.block_id.as_deref().ok_or(FsError::IO)
    }

    /// Writes `data` at `offset`, growing the file as needed. Returns the
    /// number of bytes written.
    pub async fn write_file(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        self.require_file()?;
        if data.is_empty() {
            return Ok(0);
        }
        let mut lock = ExclusiveLock::new(self.accessor.gateway.clone(), self.path());
        lock.acquire().await?;
        let outcome = self.write_locked(data, offset).await;
        let released = lock.release(false).await;
        outcome?;
        released?;
        Ok(data.len())
    }

    async fn write_locked(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let block_id = self.require_file()?.to_owned();
        let (first, last) = block_span(offset, data.len());
        debug!(
            path = %self.path(),
            first,
            last,
            len = data.len(),
            offset,
            "writing block range"
        );
        let mut consumed = 0usize;
        for num in first..=last {
            let in_block = if num == first { (offset % BLOCK_SIZE as u64) as usize } else { 0 };
            let take = (BLOCK_SIZE - in_block).min(data.len() - consumed);
            let slice = &data[consumed..consumed + take];
            write_block_slice(&self.accessor.blocks, &block_id, num, in_block, slice).await?;
            consumed += take;
        }
        let end = offset + data.len() as u64;
        self.mutate(move |d| {
            let now = unix_now();
            d.size = d.size.max(end);
            d.mtime = d.mtime.max(now);
            d.ctime = d.ctime.max(now);
        })
        .await
    }

    /// Reads up to `size` bytes at `offset`. Bytes past the end of file
    /// are not returned; holes read as zeroes.
    pub async fn read_file(&self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let block_id = self.require_file()?.to_owned();
        if offset >= self.data.size || size == 0 {
            return Ok(Vec::new());
        }
        let want = size.min((self.data.size - offset) as usize);
        let (first, last) = block_span(offset, want);
        let mut out = Vec::with_capacity(want);
        let mut remaining = want;
        for num in first..=last {
            let start = if num == first { (offset % BLOCK_SIZE as u64) as usize } else { 0 };
            let take = (BLOCK_SIZE - start).min(remaining);
            match self.accessor.blocks.read(&block_id, num, true).await? {
                Some(view) => {
                    let data = view.data.unwrap_or_default();
                    let available = data.len().saturating_sub(start);
                    let copy = available.min(take);
                    out.extend_from_slice(&data[start..start + copy]);
                    out.resize(out.len() + (take - copy), 0);
                }
                None => {
                    // Never-written block inside the file: a hole.
                    out.resize(out.len() + take, 0);
                }
            }
            remaining -= take;
        }
        Ok(out)
    }

    /// Truncates (or sparsely extends) the file to `length` bytes.
    pub async fn truncate_file(&mut self, length: u64) -> Result<()> {
        self.require_file()?;
        let mut lock = ExclusiveLock::new(self.accessor.gateway.clone(), self.path());
        lock.acquire().await?;
        let outcome = self.truncate_locked(length).await;
        let released = lock.release(false).await;
        outcome?;
        released?;
        Ok(())
    }

    async fn truncate_locked(&mut self, length: u64) -> Result<()> {
        let block_id = self.require_file()?.to_owned();
        let last_block = (length / BLOCK_SIZE as u64) as i64;
        self.accessor.blocks.purge_above(&block_id, last_block).await?;

        // Trim the boundary block to the kept prefix. A missing block is
        // a hole, not an error.
        let keep = (length % BLOCK_SIZE as u64) as usize;
        trim_block(&self.accessor.blocks, &block_id, last_block as u64, keep).await?;

        self.mutate(move |d| {
            let now = unix_now();
            d.size = length;
            d.mtime = d.mtime.max(now);
            d.ctime = d.ctime.max(now);
        })
        .await
    }

    /// Drops one reference to the file. `linked` is set when the call
    /// originates from a hard link going away rather than from the
    /// file's own name.
    ///
    /// Returns `true` when the row this record was loaded from no longer
    /// exists (purged or relocated under `/DELETED_LINKS`).
    pub async fn delete_file(&mut self, linked: bool) -> Result<bool> {
        self.require_file()?;
        let mut lock = ExclusiveLock::new(self.accessor.gateway.clone(), self.path());
        lock.acquire().await?;
        match self.delete_locked(linked).await {
            Ok(gone) => {
                lock.release(gone).await?;
                Ok(gone)
            }
            Err(err) => {
                let _ = lock.release(false).await;
                Err(err)
            }
        }
    }

    async fn delete_locked(&mut self, linked: bool) -> Result<bool> {
        let remaining = self.data.nlink;
        debug!(path = %self.path(), linked, links = remaining, "deleting file reference");
        if remaining <= 1 {
            // Last reference: purge content, then the row itself.
            if let Some(block_id) = self.data.block_id.clone() {
                self.accessor.blocks.purge_all(&block_id).await?;
            }
            self.delete_row().await?;
            return Ok(true);
        }
        if !linked && !self.data.deleted {
            // The file's own name goes away while hard links remain:
            // tombstone it under the hidden directory and point the
            // outstanding links at the new location.
            let tombstone =
                format!("{}/{}", DELETED_LINKS_PATH, Uuid::new_v4().simple());
            self.data.nlink -= 1;
            self.data.deleted = true;
            self.data.ctime = self.data.ctime.max(unix_now());
            self.move_file_to(&tombstone, true, false).await?;
            return Ok(true);
        }
        self.mutate(|d| {
            d.nlink -= 1;
            d.ctime = d.ctime.max(unix_now());
        })
        .await?;
        Ok(false)
    }

    /// Adds one hard-link reference. Files and nodes can be linked,
    /// directories cannot.
    pub async fn link_increment(&mut self) -> Result<()> {
        if !matches!(self.data.kind, RecordKind::File | RecordKind::Node) {
            return Err(FsError::InvalidArgument);
        }
        self.mutate(|d| {
            d.nlink += 1;
            d.ctime = d.ctime.max(unix_now());
        })
        .await
    }

    /// Moves the metadata row to `new_path`. When hard links refer to the
    /// old path (or the caller forces it), every Link row is repointed
    /// before the old row disappears.
    pub async fn move_file_to(
        &mut self,
        new_path: &str,
        force_retarget: bool,
        overwrite: bool,
    ) -> Result<()> {
        let old_path = self.path();
        self.clone_to(new_path, overwrite).await?;

        if self.data.nlink > 1 || force_retarget {
            debug!(from = %old_path, to = new_path, "retargeting hard links");
            let links = self.accessor.gateway.links_to(&old_path).await?;
            let repoint = Update::new().set(attr::LINK, new_path);
            let updates = links
                .iter()
                .map(|key| self.accessor.gateway.update_meta(key, &repoint, &[]));
            futures::future::try_join_all(updates).await?;
        }

        self.accessor.gateway.delete_meta(&self.key()).await?;
        let (parent, name) = crate::path::split(new_path);
        self.data.parent = parent.to_owned();
        self.data.name = name.to_owned();
        self.origin = self.data.to_item();
        Ok(())
    }
}

async fn write_block_slice(
    blocks: &BlockStore,
    block_id: &str,
    num: u64,
    in_block: usize,
    slice: &[u8],
) -> Result<()> {
    let mut view = match blocks.read(block_id, num, true).await? {
        Some(view) => view,
        None => match blocks.create(block_id, num).await {
            Ok(view) => view,
            Err(err) if BlockStore::lost_create_race(&err) => blocks
                .read(block_id, num, true)
                .await?
                .ok_or(FsError::IO)?,
            Err(err) => return Err(err.into()),
        },
    };
    save_with_retry(blocks, block_id, num, &mut view, |view| {
        view.splice(in_block, slice);
    })
    .await
}

async fn trim_block(
    blocks: &BlockStore,
    block_id: &str,
    num: u64,
    keep: usize,
) -> Result<()> {
    let Some(mut view) = blocks.read(block_id, num, true).await? else {
        return Ok(());
    };
    if view.data.as_ref().map_or(true, |data| data.len() <= keep) {
        return Ok(());
    }
    save_with_retry(blocks, block_id, num, &mut view, |view| {
        if let Some(data) = view.data.as_mut() {
            data.truncate(keep);
        }
    })
    .await
}

/// Re-applies `apply` and saves until the version-conditioned write
/// lands, re-reading the block on every conflict.
async fn save_with_retry(
    blocks: &BlockStore,
    block_id: &str,
    num: u64,
    view: &mut BlockView,
    apply: impl Fn(&mut BlockView),
) -> Result<()> {
    let mut retries = 0;
    loop {
        apply(view);
        match blocks.save(view).await {
            Ok(()) => return Ok(()),
            Err(StoreError::ConditionFailed) if retries < MAX_RETRIES => {
                retries += 1;
                *view = blocks.read(block_id, num, true).await?.ok_or(FsError::IO)?;
            }
            Err(StoreError::ConditionFailed) => return Err(FsError::IO),
            Err(err) => return Err(err.into()),
        }
    }
}
