//! Directories: children live in the partition keyed by the directory's
//! own full path, so listing is a single partition query.

use crate::error::{FsError, Result};
use crate::record::{Record, RecordKind};
use crate::store::attr;

const LIST_ATTRS: &[&str] = &[attr::NAME, attr::DELETED, attr::HIDDEN];

impl Record {
    fn require_directory(&self) -> Result<()> {
        if self.data.kind != RecordKind::Directory {
            return Err(FsError::NotDir);
        }
        Ok(())
    }

    /// Names of the directory's visible children, in sort order.
    ///
    /// The root's self-sentinel row (`name == "/"`), soft-deleted rows
    /// and hidden rows are filtered out.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        self.require_directory()?;
        let rows = self
            .accessor()
            .gateway
            .query_children(&self.path(), Some(LIST_ATTRS))
            .await?;
        Ok(rows
            .iter()
            .filter(|row| !row.flag(attr::DELETED) && !row.flag(attr::HIDDEN))
            .filter_map(|row| row.str(attr::NAME))
            .filter(|name| *name != "/")
            .map(str::to_owned)
            .collect())
    }

    /// Whether the directory has no visible children.
    pub async fn is_empty_dir(&self) -> Result<bool> {
        Ok(self.list_names().await?.is_empty())
    }
}
