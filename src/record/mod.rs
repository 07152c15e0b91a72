//! Metadata records --- the sum type over everything a path can name.
//!
//! A record is one row of the metadata table. The common base carries the
//! POSIX stat attributes, the optimistic `version` and the soft-delete
//! and lock bookkeeping; the per-variant modules add the behaviour of
//! regular files, directories, symlinks, hard links and device nodes.
//! Unknown attributes are preserved verbatim so user-defined attributes
//! survive clone and rename.

pub mod directory;
pub mod file;
pub mod link;
pub mod node;
pub mod symlink;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::blocks::BlockStore;
use crate::error::{FsError, Result};
use crate::fs::mode;
use crate::path;
use crate::store::{attr, Expected, Gateway, Item, Key, StoreError, Update, Value};
use crate::{BLOCK_SIZE, MAX_RETRIES};

/// Hard-link chains longer than this are considered cyclic.
const MAX_LINK_DEPTH: u32 = 40;

/// Seconds since the epoch.
pub fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// The record variants stored in the `type` attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordKind {
    File,
    Directory,
    Symlink,
    Link,
    Node,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::File => "File",
            RecordKind::Directory => "Directory",
            RecordKind::Symlink => "Symlink",
            RecordKind::Link => "Link",
            RecordKind::Node => "Node",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "File" => Some(RecordKind::File),
            "Directory" => Some(RecordKind::Directory),
            "Symlink" => Some(RecordKind::Symlink),
            "Link" => Some(RecordKind::Link),
            "Node" => Some(RecordKind::Node),
            _ => None,
        }
    }
}

/// Stat attributes reported for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: RecordKind,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub ino: u64,
    pub rdev: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Shared handles the record layer operates through.
#[derive(Clone)]
pub struct Accessor {
    pub gateway: Arc<Gateway>,
    pub blocks: BlockStore,
}

/// Typed view of a metadata row.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordData {
    pub parent: String,
    pub name: String,
    pub kind: RecordKind,
    pub version: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: i64,
    pub size: u64,
    pub blksize: u32,
    pub ino: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub block_id: Option<String>,
    pub symlink: Option<String>,
    pub link: Option<String>,
    pub rdev: Option<u64>,
    pub deleted: bool,
    pub hidden: bool,
    pub read_lock: i64,
    pub write_lock: Option<String>,
    pub lock_owner: Option<String>,
    /// Attributes this layer does not interpret, preserved through
    /// clone and rename.
    pub extra: BTreeMap<String, Value>,
}

const KNOWN_ATTRS: &[&str] = &[
    attr::NAME,
    attr::PATH,
    attr::TYPE,
    attr::VERSION,
    attr::MODE,
    attr::UID,
    attr::GID,
    attr::NLINK,
    attr::SIZE,
    attr::BLKSIZE,
    attr::INO,
    attr::ATIME,
    attr::MTIME,
    attr::CTIME,
    attr::RDEV,
    attr::BLOCK_ID,
    attr::SYMLINK,
    attr::LINK,
    attr::DELETED,
    attr::HIDDEN,
    attr::READ_LOCK,
    attr::WRITE_LOCK,
    attr::LOCK_OWNER,
];

impl RecordData {
    /// A fresh record with the creation defaults; the caller fills in the
    /// per-variant attributes.
    pub fn new(path: &str, kind: RecordKind, mode: u32, uid: u32, gid: u32) -> Self {
        let (parent, name) = path::split(path);
        let now = unix_now();
        RecordData {
            parent: parent.to_owned(),
            name: name.to_owned(),
            kind,
            version: 1,
            mode,
            uid,
            gid,
            nlink: 1,
            size: 0,
            blksize: BLOCK_SIZE as u32,
            ino: 0,
            atime: now,
            mtime: now,
            ctime: now,
            block_id: None,
            symlink: None,
            link: None,
            rdev: None,
            deleted: false,
            hidden: false,
            read_lock: 0,
            write_lock: None,
            lock_owner: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn from_item(item: &Item) -> Result<Self> {
        let kind = item
            .str(attr::TYPE)
            .and_then(RecordKind::parse)
            .ok_or(FsError::IO)?;
        let parent = item.str(attr::PATH).ok_or(FsError::IO)?.to_owned();
        let name = item.str(attr::NAME).ok_or(FsError::IO)?.to_owned();
        let extra = item
            .iter()
            .filter(|(k, _)| !KNOWN_ATTRS.contains(k))
            .map(|(k, v)| (k.to_owned(), v.clone()))
            .collect();
        Ok(RecordData {
            parent,
            name,
            kind,
            version: item.u64(attr::VERSION).unwrap_or(1),
            mode: item.u64(attr::MODE).unwrap_or(0) as u32,
            uid: item.u64(attr::UID).unwrap_or(0) as u32,
            gid: item.u64(attr::GID).unwrap_or(0) as u32,
            nlink: item.i64(attr::NLINK).unwrap_or(1),
            size: item.u64(attr::SIZE).unwrap_or(0),
            blksize: item.u64(attr::BLKSIZE).unwrap_or(BLOCK_SIZE as u64) as u32,
            ino: item.u64(attr::INO).unwrap_or(0),
            atime: item.i64(attr::ATIME).unwrap_or(0),
            mtime: item.i64(attr::MTIME).unwrap_or(0),
            ctime: item.i64(attr::CTIME).unwrap_or(0),
            block_id: item.str(attr::BLOCK_ID).map(str::to_owned),
            symlink: item.str(attr::SYMLINK).map(str::to_owned),
            link: item.str(attr::LINK).map(str::to_owned),
            rdev: item.u64(attr::RDEV),
            deleted: item.flag(attr::DELETED),
            hidden: item.flag(attr::HIDDEN),
            read_lock: item.i64(attr::READ_LOCK).unwrap_or(0),
            write_lock: item.str(attr::WRITE_LOCK).map(str::to_owned),
            lock_owner: item.str(attr::LOCK_OWNER).map(str::to_owned),
            extra,
        })
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new()
            .with(attr::NAME, self.name.clone())
            .with(attr::PATH, self.parent.clone())
            .with(attr::TYPE, self.kind.as_str())
            .with(attr::VERSION, self.version as i64)
            .with(attr::MODE, self.mode as i64)
            .with(attr::UID, self.uid as i64)
            .with(attr::GID, self.gid as i64)
            .with(attr::NLINK, self.nlink)
            .with(attr::SIZE, self.size as i64)
            .with(attr::BLKSIZE, self.blksize as i64)
            .with(attr::INO, self.ino as i64)
            .with(attr::ATIME, self.atime)
            .with(attr::MTIME, self.mtime)
            .with(attr::CTIME, self.ctime)
            .with(attr::READ_LOCK, self.read_lock);
        if let Some(id) = &self.block_id {
            item.set(attr::BLOCK_ID, id.clone());
        }
        if let Some(target) = &self.symlink {
            item.set(attr::SYMLINK, target.clone());
        }
        if let Some(target) = &self.link {
            item.set(attr::LINK, target.clone());
        }
        if let Some(rdev) = self.rdev {
            item.set(attr::RDEV, rdev as i64);
        }
        if self.deleted {
            item.set(attr::DELETED, true);
        }
        if self.hidden {
            item.set(attr::HIDDEN, true);
        }
        if let Some(id) = &self.write_lock {
            item.set(attr::WRITE_LOCK, id.clone());
        }
        if let Some(id) = &self.lock_owner {
            item.set(attr::LOCK_OWNER, id.clone());
        }
        for (k, v) in &self.extra {
            item.set(k.clone(), v.clone());
        }
        item
    }

    pub fn path(&self) -> String {
        path::join(&self.parent, &self.name)
    }

    pub fn key(&self) -> Key {
        Key::meta(&self.parent, &self.name)
    }

    /// Classical user/group/other permission evaluation. `F_OK` always
    /// succeeds for an existing record, root passes everything.
    pub fn check_access(&self, uid: u32, gid: u32, mask: u32) -> Result<()> {
        if mask == mode::F_OK || uid == 0 {
            return Ok(());
        }
        let class = if uid == self.uid {
            (self.mode >> 6) & 0o7
        } else if gid == self.gid {
            (self.mode >> 3) & 0o7
        } else {
            self.mode & 0o7
        };
        if class & mask == mask {
            Ok(())
        } else {
            Err(FsError::Access)
        }
    }
}

/// Attribute-level difference between the row as read and the row as it
/// should be committed.
fn diff(origin: &Item, next: &Item) -> Update {
    let mut update = Update::new();
    for (name, value) in next.iter() {
        if origin.get(name) != Some(value) {
            update = update.set(name.to_owned(), value.clone());
        }
    }
    for (name, _) in origin.iter() {
        if !next.contains(name) {
            update = update.remove(name.to_owned());
        }
    }
    update
}

/// One loaded metadata record. Link records eagerly resolve their target
/// so reads, writes and stat can delegate to it.
pub struct Record {
    accessor: Accessor,
    origin: Item,
    pub data: RecordData,
    target: Option<Box<Record>>,
}

/// Creation request passed to [`Record::create`].
pub struct NewRecord<'a> {
    pub path: &'a str,
    pub kind: RecordKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: Option<u64>,
    pub symlink: Option<&'a str>,
    pub hidden: bool,
}

impl Record {
    /// Loads the record at `path`. A soft-deleted record reads as absent
    /// unless `ignore_deleted` is set (hard links resolve tombstones).
    pub async fn load(accessor: &Accessor, path: &str, ignore_deleted: bool) -> Result<Record> {
        path::check(path)?;
        let (parent, name) = path::split(path);
        let key = Key::meta(parent, name);
        let item = accessor
            .gateway
            .get_meta(&key, None)
            .await?
            .ok_or(FsError::NoEntry)?;
        let data = RecordData::from_item(&item)?;
        if data.deleted && !ignore_deleted {
            return Err(FsError::NoEntry);
        }
        let mut record = Record { accessor: accessor.clone(), origin: item, data, target: None };
        record.resolve_target().await?;
        Ok(record)
    }

    /// Like [`Record::load`], mapping an absent row to `None`.
    pub async fn load_opt(
        accessor: &Accessor,
        path: &str,
        ignore_deleted: bool,
    ) -> Result<Option<Record>> {
        match Record::load(accessor, path, ignore_deleted).await {
            Ok(record) => Ok(Some(record)),
            Err(FsError::NoEntry) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Whether any row exists at `path`, deleted or not.
    pub async fn exists(accessor: &Accessor, path: &str) -> Result<bool> {
        path::check(path)?;
        let (parent, name) = path::split(path);
        let item = accessor.gateway.get_meta(&Key::meta(parent, name), Some(&[])).await?;
        Ok(item.is_some())
    }

    /// Creates a new record row, failing with `EEXIST` on a key collision.
    pub async fn create(accessor: &Accessor, new: NewRecord<'_>) -> Result<Record> {
        path::check(new.path)?;
        let mut data = RecordData::new(new.path, new.kind, new.mode, new.uid, new.gid);
        data.hidden = new.hidden;
        match new.kind {
            RecordKind::File => file::init_file(accessor, &mut data).await?,
            RecordKind::Symlink => {
                symlink::init_symlink(&mut data, new.symlink.ok_or(FsError::InvalidArgument)?)
            }
            RecordKind::Node => node::init_node(&mut data, new.rdev),
            RecordKind::Directory | RecordKind::Link => {}
        }
        if data.ino == 0 {
            data.ino = accessor.gateway.next_id().await? as u64;
        }
        let item = data.to_item();
        match accessor.gateway.put_new_meta(&data.key(), item.clone()).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => return Err(FsError::Exist),
            Err(err) => return Err(err.into()),
        }
        if new.kind == RecordKind::File {
            file::allocate_first_block(accessor, &data).await?;
        }
        trace!(path = new.path, kind = new.kind.as_str(), "created record");
        Ok(Record { accessor: accessor.clone(), origin: item, data, target: None })
    }

    /// Follows the `link` reference chain of a Link record and pins the
    /// final target.
    async fn resolve_target(&mut self) -> Result<()> {
        if self.data.kind != RecordKind::Link {
            return Ok(());
        }
        let mut hops = 0;
        let mut target_path = self.data.link.clone().ok_or(FsError::IO)?;
        loop {
            let (parent, name) = path::split(&target_path);
            let item = self
                .accessor
                .gateway
                .get_meta(&Key::meta(parent, name), None)
                .await?
                .ok_or(FsError::NoEntry)?;
            let data = RecordData::from_item(&item)?;
            if data.kind == RecordKind::Link {
                hops += 1;
                if hops > MAX_LINK_DEPTH {
                    return Err(FsError::InvalidArgument);
                }
                target_path = data.link.clone().ok_or(FsError::IO)?;
                continue;
            }
            self.target = Some(Box::new(Record {
                accessor: self.accessor.clone(),
                origin: item,
                data,
                target: None,
            }));
            return Ok(());
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.data.kind
    }

    pub fn path(&self) -> String {
        self.data.path()
    }

    pub fn key(&self) -> Key {
        self.data.key()
    }

    pub fn is_directory(&self) -> bool {
        self.data.kind == RecordKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.data.kind == RecordKind::File
    }

    pub fn accessor(&self) -> &Accessor {
        &self.accessor
    }

    /// The resolved hard-link target, if this is a Link record.
    pub fn target(&self) -> Option<&Record> {
        self.target.as_deref()
    }

    /// The record operations should act on: the link target for Link
    /// records, the record itself otherwise.
    pub fn effective(&self) -> &Record {
        self.target.as_deref().unwrap_or(self)
    }

    pub fn effective_mut(&mut self) -> &mut Record {
        if self.target.is_some() {
            self.target.as_deref_mut().expect("target checked above")
        } else {
            self
        }
    }

    /// Re-reads the row, discarding local modifications.
    pub async fn refresh(&mut self) -> Result<()> {
        let item = self
            .accessor
            .gateway
            .get_meta(&self.key(), None)
            .await?
            .ok_or(FsError::NoEntry)?;
        self.data = RecordData::from_item(&item)?;
        self.origin = item;
        Ok(())
    }

    async fn save_once(&mut self) -> std::result::Result<(), StoreError> {
        let observed = self.data.version;
        let mut next = self.data.clone();
        next.version = observed + 1;
        let next_item = next.to_item();
        let update = diff(&self.origin, &next_item);
        let expected = [Expected::equals(attr::VERSION, observed as i64)];
        self.accessor.gateway.update_meta(&self.key(), &update, &expected).await?;
        self.data.version = observed + 1;
        self.origin = next_item;
        Ok(())
    }

    /// Applies `apply` to the record data and commits it with a
    /// version-coupled save. On a conditional failure the row is
    /// re-read and `apply` re-applied, up to the retry budget; the
    /// mutation must therefore be expressible over any observed state.
    pub async fn mutate<F>(&mut self, apply: F) -> Result<()>
    where
        F: Fn(&mut RecordData),
    {
        let mut retries = 0;
        loop {
            apply(&mut self.data);
            match self.save_once().await {
                Ok(()) => return Ok(()),
                Err(StoreError::ConditionFailed) if retries < MAX_RETRIES => {
                    retries += 1;
                    trace!(path = %self.path(), retries, "stale save, refreshing");
                    self.refresh().await?;
                }
                Err(StoreError::ConditionFailed) => return Err(FsError::IO),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Stat attributes; Link records report their target.
    pub fn getattr(&self) -> Attr {
        let data = &self.effective().data;
        let mut attr = Attr {
            kind: data.kind,
            mode: data.mode,
            nlink: data.nlink.max(0) as u32,
            uid: data.uid,
            gid: data.gid,
            size: data.size,
            blocks: 0,
            blksize: data.blksize,
            ino: data.ino,
            rdev: data.rdev.unwrap_or(0),
            atime: data.atime,
            mtime: data.mtime,
            ctime: data.ctime,
        };
        match data.kind {
            RecordKind::File => {
                let blksize = data.blksize.max(1) as u64;
                attr.blocks = data.size.div_ceil(blksize);
                if let Some(ino) = data.block_id.as_ref().and_then(|id| id.parse().ok()) {
                    attr.ino = ino;
                }
            }
            RecordKind::Directory => {
                attr.nlink = 1;
                attr.size = 0;
            }
            _ => {}
        }
        attr
    }

    /// Permission probe against the effective record.
    pub fn access(&self, uid: u32, gid: u32, mask: u32) -> Result<()> {
        self.effective().data.check_access(uid, gid, mask)
    }

    /// Replaces the permission bits. Only the owner or root may do so;
    /// a non-privileged caller outside the owning group drops the
    /// set-group-id bit.
    pub async fn chmod(&mut self, uid: u32, gid: u32, new_mode: u32) -> Result<()> {
        if uid != 0 && uid != self.data.uid {
            return Err(FsError::Permission);
        }
        let mut bits = new_mode & 0o7777;
        if uid != 0 && gid != self.data.gid {
            bits &= !mode::S_ISGID;
        }
        self.mutate(move |d| {
            d.mode = (d.mode & !0o7777) | bits;
            d.ctime = d.ctime.max(unix_now());
        })
        .await
    }

    /// Changes ownership. A non-privileged caller may not change the
    /// uid and may only hand the gid to a group they belong to.
    pub async fn chown(&mut self, uid: u32, gid: u32, new_uid: Option<u32>, new_gid: Option<u32>) -> Result<()> {
        if uid != 0 {
            if let Some(u) = new_uid {
                if u != self.data.uid {
                    return Err(FsError::Permission);
                }
            }
            if let Some(g) = new_gid {
                if g != self.data.gid && g != gid {
                    return Err(FsError::Permission);
                }
            }
        }
        self.mutate(move |d| {
            if let Some(u) = new_uid {
                d.uid = u;
            }
            if let Some(g) = new_gid {
                d.gid = g;
            }
            d.ctime = d.ctime.max(unix_now());
        })
        .await
    }

    /// Sets the access and modification times; `None` means "now".
    pub async fn utimens(&mut self, times: Option<(i64, i64)>) -> Result<()> {
        let now = unix_now();
        let (atime, mtime) = times.unwrap_or((now, now));
        self.mutate(move |d| {
            d.atime = atime;
            d.mtime = mtime;
            d.ctime = d.ctime.max(unix_now());
        })
        .await
    }

    /// Bumps the change time, keeping it monotonic.
    pub async fn update_ctime(&mut self) -> Result<()> {
        self.mutate(|d| d.ctime = d.ctime.max(unix_now())).await
    }

    /// Bumps the modification and change times, keeping them monotonic.
    pub async fn update_mctime(&mut self) -> Result<()> {
        self.mutate(|d| {
            let now = unix_now();
            d.mtime = d.mtime.max(now);
            d.ctime = d.ctime.max(now);
        })
        .await
    }

    /// Writes a copy of this record under a new path, preserving its stat
    /// identity and user attributes. Locks do not travel with the copy.
    pub async fn clone_to(&self, new_path: &str, overwrite: bool) -> Result<()> {
        path::check(new_path)?;
        let (parent, name) = path::split(new_path);
        let mut data = self.data.clone();
        data.parent = parent.to_owned();
        data.name = name.to_owned();
        data.lock_owner = None;
        data.write_lock = None;
        let key = data.key();
        let item = data.to_item();
        if overwrite {
            self.accessor.gateway.put_meta(&key, item).await?;
        } else {
            match self.accessor.gateway.put_new_meta(&key, item).await {
                Ok(()) => {}
                Err(StoreError::AlreadyExists) => return Err(FsError::Exist),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Removes the metadata row. Blocks and link bookkeeping are the
    /// caller's concern.
    pub async fn delete_row(&self) -> Result<()> {
        self.accessor.gateway.delete_meta(&self.key()).await?;
        Ok(())
    }
}

/// Updates the parent directory's modification and change times after a
/// mutation of one of its entries.
pub async fn touch_parent(accessor: &Accessor, child_path: &str) -> Result<()> {
    if child_path == "/" {
        return Ok(());
    }
    let parent = path::parent(child_path);
    let mut dir = Record::load(accessor, parent, false).await?;
    dir.update_mctime().await
}
