//! Device nodes, fifos and sockets: metadata-only records that keep the
//! device number in `st_rdev` and never allocate blocks.

use crate::record::RecordData;

pub(super) fn init_node(data: &mut RecordData, rdev: Option<u64>) {
    data.rdev = rdev;
}
