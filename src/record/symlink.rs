//! Symbolic links: the target string lives in the `symlink` attribute
//! and the permission bits are fixed at 0777.

use crate::error::{FsError, Result};
use crate::fs::mode;
use crate::record::{Record, RecordData, RecordKind};

pub(super) fn init_symlink(data: &mut RecordData, target: &str) {
    data.mode = mode::S_IFLNK | 0o777;
    data.symlink = Some(target.to_owned());
}

impl Record {
    /// The stored target string of a symlink.
    pub fn readlink(&self) -> Result<&str> {
        if self.data.kind != RecordKind::Symlink {
            return Err(FsError::InvalidArgument);
        }
        self.data.symlink.as_deref().ok_or(FsError::IO)
    }
}
