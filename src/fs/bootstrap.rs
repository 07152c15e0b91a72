//! Table provisioning, idempotent root initialisation and maintenance.

use futures::future::try_join_all;
use tracing::{debug, info};

use crate::error::{FsError, Result};
use crate::fs::{mode, KvFs};
use crate::record::{NewRecord, Record, RecordData, RecordKind};
use crate::store::Key;
use crate::{DELETED_LINKS, DELETED_LINKS_PATH};

impl KvFs {
    /// Provisions the metadata and blocks tables. Idempotent.
    pub async fn create_tables(&self) -> Result<()> {
        self.gateway().create_tables().await?;
        Ok(())
    }

    /// Creates the root directory and the hidden tombstone directory if
    /// this is a fresh filesystem. Safe to run on every mount.
    pub async fn bootstrap(&self) -> Result<()> {
        self.ensure_directory("/", 0o755, false).await?;
        self.ensure_directory(DELETED_LINKS_PATH, 0o700, true).await
    }

    async fn ensure_directory(&self, path: &str, bits: u32, hidden: bool) -> Result<()> {
        if Record::exists(self.accessor(), path).await? {
            return Ok(());
        }
        match Record::create(
            self.accessor(),
            NewRecord {
                path,
                kind: RecordKind::Directory,
                mode: mode::S_IFDIR | bits,
                uid: 0,
                gid: 0,
                rdev: None,
                symlink: None,
                hidden,
            },
        )
        .await
        {
            Ok(_) => {
                info!(path, "initialised directory");
                Ok(())
            }
            // Another mount won the race; the row is there either way.
            Err(FsError::Exist) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Wipes every row except the root, the tombstone directory and the
    /// id counter.
    pub async fn cleanup(&self) -> Result<()> {
        let reserved = [
            Key::meta("/", "/"),
            Key::meta("/", DELETED_LINKS),
            Key::meta("global", "counter"),
        ];
        let keys = self.gateway().scan_meta_keys().await?;
        let victims: Vec<&Key> = keys.iter().filter(|key| !reserved.contains(key)).collect();
        debug!(count = victims.len(), "cleanup: deleting metadata rows");
        try_join_all(victims.iter().map(|key| self.gateway().delete_meta(key))).await?;

        let blocks = self.gateway().scan_block_keys().await?;
        debug!(count = blocks.len(), "cleanup: deleting block rows");
        try_join_all(blocks.iter().map(|key| self.gateway().delete_block(key))).await?;
        Ok(())
    }

    /// Purges tombstoned files whose last hard link is gone. Returns the
    /// number of tombstones reclaimed.
    pub async fn reap_tombstones(&self) -> Result<usize> {
        let rows = self.gateway().query_children(DELETED_LINKS_PATH, None).await?;
        let mut reaped = 0;
        for item in &rows {
            let data = RecordData::from_item(item)?;
            if data.name == "/" {
                continue;
            }
            if data.nlink <= 0 {
                if let Some(block_id) = &data.block_id {
                    self.accessor().blocks.purge_all(block_id).await?;
                }
                self.gateway().delete_meta(&data.key()).await?;
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!(reaped, "reaped tombstoned files");
        }
        Ok(reaped)
    }
}
