//! The POSIX operation surface.
//!
//! [`KvFs`] translates vnode-level calls into record, block and lock
//! actions. The host kernel binding marshals the wire protocol and calls
//! these methods with the caller's [`Context`]; everything here is pure
//! translation --- permissions, sticky-bit rules, parent timestamp
//! maintenance, hard-link retargeting and deferred deletion.

pub mod bootstrap;
pub mod mode;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, error};

use crate::blocks::BlockStore;
use crate::config::Config;
use crate::error::{FsError, Result};
use crate::lock::registry::{KvHold, LocalLock, LockRegistry, Unlock};
use crate::lock::{SharedLock, WriteLock};
use crate::path;
use crate::record::{touch_parent, Accessor, NewRecord, Record, RecordKind};
use crate::store::{Backend, Gateway};
use crate::{BLOCK_SIZE, MAX_NAME_LEN, MAX_PATH_LEN};

pub use crate::record::Attr;

/// Identity of the calling process, as supplied by the kernel binding.
#[derive(Debug, Copy, Clone)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Synthetic filesystem statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u32,
}

/// Lock state observed by `F_GETLK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockProbe {
    Unlocked,
    /// Shared holders, with the reader count.
    Shared(u64),
    Exclusive,
}

/// `flock(2)` requests mapped onto the advisory lock machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockOp {
    Shared,
    Exclusive,
    Unlock,
}

/// The filesystem daemon state: one per mounted table pair.
pub struct KvFs {
    accessor: Accessor,
    registry: LockRegistry,
    next_handle: Mutex<u64>,
    open_files: DashMap<u64, String>,
}

impl KvFs {
    pub fn new(backend: Arc<dyn Backend>, config: &Config) -> Self {
        let gateway = Arc::new(Gateway::new(backend, &config.table, config.consistent_reads));
        let blocks = BlockStore::new(
            gateway.clone(),
            config.block_cache,
            Duration::from_millis(config.block_cache_ttl_ms),
        );
        KvFs {
            accessor: Accessor { gateway, blocks },
            registry: LockRegistry::new(),
            next_handle: Mutex::new(0),
            open_files: DashMap::new(),
        }
    }

    pub fn accessor(&self) -> &Accessor {
        &self.accessor
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.accessor.gateway
    }

    /// Mints a file-handle id. Purely local, never persisted.
    fn alloc_handle(&self) -> u64 {
        let mut counter = self.next_handle.lock().expect("handle mutex poisoned");
        *counter += 1;
        *counter
    }

    async fn record(&self, path: &str) -> Result<Record> {
        Record::load(&self.accessor, path, false).await
    }

    /// Loads a record for a user-visible operation; hidden records read
    /// as absent.
    async fn visible_record(&self, path: &str) -> Result<Record> {
        let record = self.record(path).await?;
        if record.data.hidden {
            return Err(FsError::NoEntry);
        }
        Ok(record)
    }

    /// Loads the parent directory and checks the caller's access to it.
    /// The root has no parent.
    async fn parent_checked(
        &self,
        ctx: &Context,
        child: &str,
        mask: u32,
    ) -> Result<Option<Record>> {
        if child == "/" {
            return Ok(None);
        }
        let dir = Record::load(&self.accessor, path::parent(child), false).await?;
        if !dir.is_directory() {
            return Err(FsError::NotDir);
        }
        dir.access(ctx.uid, ctx.gid, mask)?;
        Ok(Some(dir))
    }

    /// Sticky-bit rule: in a sticky directory only root, the directory
    /// owner or the entry owner may remove or rename an entry.
    fn sticky_guard(&self, ctx: &Context, dir: &Record, child: &Record) -> Result<()> {
        if mode::is_sticky(dir.data.mode)
            && ctx.uid != 0
            && ctx.uid != child.data.uid
            && ctx.uid != dir.data.uid
        {
            return Err(FsError::Permission);
        }
        Ok(())
    }

    async fn create_record(
        &self,
        ctx: &Context,
        path: &str,
        kind: RecordKind,
        mode_bits: u32,
        rdev: Option<u64>,
        symlink: Option<&str>,
    ) -> Result<Record> {
        path::check(path)?;
        self.parent_checked(ctx, path, mode::W_OK | mode::X_OK).await?;
        let record = Record::create(
            &self.accessor,
            NewRecord {
                path,
                kind,
                mode: mode_bits,
                uid: ctx.uid,
                gid: ctx.gid,
                rdev,
                symlink,
                hidden: false,
            },
        )
        .await?;
        touch_parent(&self.accessor, path).await?;
        Ok(record)
    }

    // ---- metadata operations ----

    pub async fn getattr(&self, _ctx: &Context, path: &str) -> Result<Attr> {
        let path = path::normalize(path);
        debug!(path, "getattr");
        Ok(self.visible_record(path).await?.getattr())
    }

    pub async fn access(&self, ctx: &Context, path: &str, mask: u32) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, mask, "access");
        self.visible_record(path).await?.access(ctx.uid, ctx.gid, mask)
    }

    pub async fn chmod(&self, ctx: &Context, path: &str, mode_bits: u32) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, mode = format_args!("{mode_bits:o}"), "chmod");
        self.visible_record(path).await?.chmod(ctx.uid, ctx.gid, mode_bits).await
    }

    pub async fn chown(
        &self,
        ctx: &Context,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, ?uid, ?gid, "chown");
        self.visible_record(path).await?.chown(ctx.uid, ctx.gid, uid, gid).await
    }

    pub async fn utimens(
        &self,
        _ctx: &Context,
        path: &str,
        times: Option<(i64, i64)>,
    ) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, "utimens");
        self.visible_record(path).await?.utimens(times).await
    }

    pub async fn readlink(&self, _ctx: &Context, path: &str) -> Result<String> {
        let path = path::normalize(path);
        debug!(path, "readlink");
        Ok(self.visible_record(path).await?.readlink()?.to_owned())
    }

    pub async fn statfs(&self, _ctx: &Context, path: &str) -> Result<StatFs> {
        let path = path::normalize(path);
        debug!(path, "statfs");
        let files = self.accessor.gateway.item_count().await?;
        Ok(StatFs {
            bsize: BLOCK_SIZE as u32,
            frsize: BLOCK_SIZE as u32,
            blocks: u64::MAX - 1,
            bfree: u64::MAX - 2,
            bavail: u64::MAX - 2,
            files,
            ffree: u64::MAX - 1,
            favail: u64::MAX - 1,
            fsid: 0,
            flag: 0,
            namemax: MAX_NAME_LEN as u32,
        })
    }

    // ---- open and release ----

    pub async fn open(&self, ctx: &Context, path: &str, flags: u32) -> Result<u64> {
        let path = path::normalize(path);
        debug!(path, flags = format_args!("{flags:#o}"), "open");
        let parent = self.parent_checked(ctx, path, mode::X_OK).await?;
        if flags & mode::O_CREAT != 0 {
            if let Some(dir) = &parent {
                dir.access(ctx.uid, ctx.gid, mode::W_OK)?;
            }
        }
        let record = self.visible_record(path).await?;
        let acc = flags & mode::O_ACCMODE;
        if acc == mode::O_RDONLY || acc == mode::O_RDWR {
            record.access(ctx.uid, ctx.gid, mode::R_OK)?;
        }
        if acc == mode::O_WRONLY || acc == mode::O_RDWR {
            record.access(ctx.uid, ctx.gid, mode::W_OK)?;
        }
        self.registry.open(path);
        let fh = self.alloc_handle();
        self.open_files.insert(fh, path.to_owned());
        Ok(fh)
    }

    pub async fn release(&self, fh: u64) -> Result<()> {
        if let Some((_, path)) = self.open_files.remove(&fh) {
            debug!(path, fh, "release");
            self.registry.release(&path);
        }
        Ok(())
    }

    pub async fn opendir(&self, _ctx: &Context, path: &str) -> Result<u64> {
        let path = path::normalize(path);
        debug!(path, "opendir");
        self.visible_record(path).await?;
        Ok(self.alloc_handle())
    }

    pub async fn releasedir(&self, _fh: u64) -> Result<()> {
        Ok(())
    }

    // ---- namespace operations ----

    pub async fn create(&self, ctx: &Context, path: &str, mode_bits: u32) -> Result<u64> {
        let path = path::normalize(path);
        debug!(path, mode = format_args!("{mode_bits:o}"), "create");
        let kind = mode::kind_of(mode_bits);
        self.create_record(ctx, path, kind, mode_bits, None, None).await?;
        self.registry.open(path);
        let fh = self.alloc_handle();
        self.open_files.insert(fh, path.to_owned());
        Ok(fh)
    }

    pub async fn mkdir(&self, ctx: &Context, path: &str, mode_bits: u32) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, mode = format_args!("{mode_bits:o}"), "mkdir");
        self.create_record(
            ctx,
            path,
            RecordKind::Directory,
            mode_bits | mode::S_IFDIR,
            None,
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn mknod(
        &self,
        ctx: &Context,
        path: &str,
        mode_bits: u32,
        rdev: u64,
    ) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, mode = format_args!("{mode_bits:o}"), rdev, "mknod");
        let kind = mode::kind_of(mode_bits);
        self.create_record(ctx, path, kind, mode_bits, Some(rdev), None).await?;
        Ok(())
    }

    pub async fn symlink(&self, ctx: &Context, link_path: &str, target: &str) -> Result<()> {
        let link_path = path::normalize(link_path);
        debug!(link_path, target, "symlink");
        if target.len() > MAX_PATH_LEN {
            return Err(FsError::NameTooLong);
        }
        self.create_record(ctx, link_path, RecordKind::Symlink, 0, None, Some(target))
            .await?;
        Ok(())
    }

    pub async fn readdir(&self, _ctx: &Context, path: &str) -> Result<Vec<String>> {
        let path = path::normalize(path);
        debug!(path, "readdir");
        let dir = self.visible_record(path).await?;
        if !dir.is_directory() {
            return Err(FsError::NotDir);
        }
        let mut entries = vec![String::from("."), String::from("..")];
        entries.extend(dir.list_names().await?);
        Ok(entries)
    }

    pub async fn unlink(&self, ctx: &Context, path: &str) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, "unlink");
        let parent = self.parent_checked(ctx, path, mode::W_OK | mode::X_OK).await?;
        let mut record = self.visible_record(path).await?;
        if let Some(dir) = &parent {
            self.sticky_guard(ctx, dir, &record)?;
        }
        match record.kind() {
            RecordKind::Directory => return Err(FsError::IsDir),
            RecordKind::File => {
                record.delete_file(false).await?;
            }
            RecordKind::Link => {
                record.delete_link().await?;
            }
            RecordKind::Symlink | RecordKind::Node => {
                record.delete_row().await?;
            }
        }
        touch_parent(&self.accessor, path).await
    }

    pub async fn rmdir(&self, ctx: &Context, path: &str) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, "rmdir");
        if path == "/" {
            return Err(FsError::InvalidArgument);
        }
        let parent = self.parent_checked(ctx, path, mode::W_OK | mode::X_OK).await?;
        let record = self.visible_record(path).await?;
        if !record.is_directory() {
            return Err(FsError::InvalidArgument);
        }
        if let Some(dir) = &parent {
            self.sticky_guard(ctx, dir, &record)?;
        }
        if !record.is_empty_dir().await? {
            return Err(FsError::NotEmpty);
        }
        record.delete_row().await?;
        touch_parent(&self.accessor, path).await
    }

    pub async fn rename(&self, ctx: &Context, old: &str, new: &str) -> Result<()> {
        let old = path::normalize(old);
        let new = path::normalize(new);
        debug!(old, new, "rename");
        if old == new {
            return Ok(());
        }
        if old == "/" || new == "/" {
            return Err(FsError::InvalidArgument);
        }
        path::check(old)?;
        path::check(new)?;
        // A directory cannot become a descendant of itself.
        if new.starts_with(&format!("{old}/")) {
            return Err(FsError::InvalidArgument);
        }

        let old_parent = self.parent_checked(ctx, old, mode::W_OK | mode::X_OK).await?;
        let new_dir = match Record::load_opt(&self.accessor, path::parent(new), false).await? {
            Some(dir) if dir.is_directory() => dir,
            _ => return Err(FsError::NoEntry),
        };
        new_dir.access(ctx.uid, ctx.gid, mode::W_OK | mode::X_OK)?;

        let mut record = self.visible_record(old).await?;
        if let Some(dir) = &old_parent {
            self.sticky_guard(ctx, dir, &record)?;
        }

        let existing = Record::load_opt(&self.accessor, new, false).await?;
        if let Some(target) = &existing {
            self.sticky_guard(ctx, &new_dir, target)?;
            if record.is_directory() {
                if !target.is_directory() {
                    return Err(FsError::IsDir);
                }
                if !target.is_empty_dir().await? {
                    return Err(FsError::NotEmpty);
                }
            } else if target.is_directory() {
                return Err(FsError::IsDir);
            }
        }
        // Unlink whatever the destination named, so the move lands on a
        // free key and replaced file content is reclaimed.
        if let Some(mut target) = existing {
            match target.kind() {
                RecordKind::File => {
                    target.delete_file(false).await?;
                }
                RecordKind::Link => {
                    target.delete_link().await?;
                }
                _ => {
                    target.delete_row().await?;
                }
            }
        }

        self.move_record(&mut record, new).await?;
        touch_parent(&self.accessor, old).await?;
        touch_parent(&self.accessor, new).await
    }

    /// Re-parents one record. Directories move their children
    /// recursively; the old row is deleted last so no child is ever
    /// unreachable, but the move as a whole is not atomic.
    fn move_record<'a>(
        &'a self,
        record: &'a mut Record,
        new_path: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match record.kind() {
                RecordKind::File => record.move_file_to(new_path, false, false).await,
                RecordKind::Directory => {
                    let old_path = record.path();
                    record.clone_to(new_path, false).await?;
                    for name in record.list_names().await? {
                        let child_old = path::join(&old_path, &name);
                        let child_new = path::join(new_path, &name);
                        let mut child =
                            Record::load(&self.accessor, &child_old, false).await?;
                        self.move_record(&mut child, &child_new).await?;
                    }
                    record.delete_row().await
                }
                _ => {
                    record.clone_to(new_path, false).await?;
                    record.delete_row().await
                }
            }
        })
    }

    pub async fn link(&self, ctx: &Context, new_path: &str, source: &str) -> Result<()> {
        let new_path = path::normalize(new_path);
        let source = path::normalize(source);
        debug!(new_path, source, "link");
        let mut source_rec = self.visible_record(source).await?;
        if !matches!(
            source_rec.kind(),
            RecordKind::File | RecordKind::Node | RecordKind::Link
        ) {
            return Err(FsError::InvalidArgument);
        }
        self.parent_checked(ctx, new_path, mode::W_OK | mode::X_OK).await?;
        if Record::exists(&self.accessor, new_path).await? {
            return Err(FsError::Exist);
        }
        Record::create_link(
            &self.accessor,
            ctx.uid,
            ctx.gid,
            new_path,
            source_rec.effective_mut(),
        )
        .await?;
        touch_parent(&self.accessor, new_path).await?;
        let mut source_dir =
            Record::load(&self.accessor, path::parent(source), false).await?;
        source_dir.update_ctime().await
    }

    // ---- file content operations ----

    pub async fn read(
        &self,
        _ctx: &Context,
        path: &str,
        size: usize,
        offset: u64,
    ) -> Result<Vec<u8>> {
        let path = path::normalize(path);
        debug!(path, size, offset, "read");
        let record = self.visible_record(path).await?;
        record.effective().read_file(offset, size).await
    }

    pub async fn write(
        &self,
        _ctx: &Context,
        path: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<usize> {
        let path = path::normalize(path);
        debug!(path, len = data.len(), offset, "write");
        let mut record = self.visible_record(path).await?;
        record.effective_mut().write_file(data, offset).await
    }

    pub async fn truncate(&self, ctx: &Context, path: &str, length: u64) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, length, "truncate");
        let mut record = self.visible_record(path).await?;
        record.access(ctx.uid, ctx.gid, mode::W_OK)?;
        record.effective_mut().truncate_file(length).await
    }

    // ---- advisory locks ----

    /// `F_GETLK`: the lock state observed on the target record.
    pub async fn getlk(&self, _ctx: &Context, path: &str) -> Result<LockProbe> {
        let path = path::normalize(path);
        debug!(path, "getlk");
        let record = self.record(path).await?;
        if record.data.write_lock.is_some() {
            Ok(LockProbe::Exclusive)
        } else if record.data.read_lock > 0 {
            Ok(LockProbe::Shared(record.data.read_lock as u64))
        } else {
            Ok(LockProbe::Unlocked)
        }
    }

    /// `F_SETLK` / `F_SETLKW`: registers the lock locally and performs
    /// the KV round-trip only for the first holder of the path.
    pub async fn setlk(
        &self,
        _ctx: &Context,
        path: &str,
        kind: LocalLock,
        owner: u64,
        wait: bool,
    ) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, ?kind, owner, wait, "setlk");
        self.record(path).await?;
        match kind {
            LocalLock::Shared => {
                if self.registry.read_lock(path, owner)? {
                    let mut kv = SharedLock::new(self.accessor.gateway.clone(), path);
                    if let Err(err) = kv.acquire(wait).await {
                        error!(path, %err, "unable to take the shared KV lock");
                        self.registry.rollback(path, owner);
                        return Err(err);
                    }
                    self.registry.note_kv(path, KvHold::Read);
                }
            }
            LocalLock::Exclusive => {
                if self.registry.write_lock(path, owner)? {
                    let mut kv = WriteLock::new(self.accessor.gateway.clone(), path);
                    if let Err(err) = kv.acquire(wait).await {
                        error!(path, %err, "unable to take the exclusive KV lock");
                        self.registry.rollback(path, owner);
                        return Err(err);
                    }
                    self.registry.note_kv(path, KvHold::Write(kv.id().to_owned()));
                }
            }
        }
        Ok(())
    }

    /// `F_UNLCK`: drops the local lock and releases the KV lock when the
    /// last holder leaves.
    pub async fn unlock(&self, _ctx: &Context, path: &str, owner: u64) -> Result<()> {
        let path = path::normalize(path);
        debug!(path, owner, "unlock");
        match self.registry.unlock(path, owner) {
            Unlock::NotHeld | Unlock::Retained => Ok(()),
            Unlock::LastHolder(None) => Ok(()),
            Unlock::LastHolder(Some(KvHold::Read)) => {
                SharedLock::resume(self.accessor.gateway.clone(), path)
                    .release(false)
                    .await
            }
            Unlock::LastHolder(Some(KvHold::Write(id))) => {
                WriteLock::resume(self.accessor.gateway.clone(), path, id)
                    .release(false)
                    .await
            }
        }
    }

    /// `flock(2)` over the same registry, with whole-file semantics.
    pub async fn flock(
        &self,
        ctx: &Context,
        path: &str,
        op: FlockOp,
        owner: u64,
        wait: bool,
    ) -> Result<()> {
        debug!(path, ?op, owner, "flock");
        match op {
            FlockOp::Shared => self.setlk(ctx, path, LocalLock::Shared, owner, wait).await,
            FlockOp::Exclusive => {
                self.setlk(ctx, path, LocalLock::Exclusive, owner, wait).await
            }
            FlockOp::Unlock => self.unlock(ctx, path, owner).await,
        }
    }
}
