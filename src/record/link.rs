//! Hard links: a Link row carries the absolute path of its target in the
//! `link` attribute and delegates content operations to it.
//!
//! The target is resolved eagerly at load time, following tombstoned
//! records, so a Link keeps working after its target's own name was
//! unlinked.

use crate::error::{FsError, Result};
use crate::path;
use crate::record::{Accessor, Record, RecordData, RecordKind};
use crate::store::StoreError;

impl Record {
    /// Creates a Link row pointing at `target` and bumps the target's
    /// reference count.
    pub async fn create_link(
        accessor: &Accessor,
        uid: u32,
        gid: u32,
        new_path: &str,
        target: &mut Record,
    ) -> Result<Record> {
        path::check(new_path)?;
        let mut data = RecordData::new(new_path, RecordKind::Link, target.data.mode, uid, gid);
        data.link = Some(target.path());
        data.ino = accessor.gateway.next_id().await? as u64;
        let item = data.to_item();
        match accessor.gateway.put_new_meta(&data.key(), item.clone()).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => return Err(FsError::Exist),
            Err(err) => return Err(err.into()),
        }
        target.link_increment().await?;
        Ok(Record { accessor: accessor.clone(), origin: item, data, target: None })
    }

    /// Deletes the Link row, dropping its reference on the target.
    pub async fn delete_link(&mut self) -> Result<()> {
        if self.data.kind != RecordKind::Link {
            return Err(FsError::InvalidArgument);
        }
        if let Some(target) = self.target.as_deref_mut() {
            target.delete_file(true).await?;
        }
        self.delete_row().await
    }
}
