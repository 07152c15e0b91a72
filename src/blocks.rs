//! Fixed-size content blocks of regular files.
//!
//! File bytes are striped over 32 KiB rows of the blocks table, keyed
//! `(blockId, blockNum)`. Every block carries its own `version` and is
//! saved with a version-conditioned write; the byte at file offset `o`
//! lives at `(o / BLOCK_SIZE, o % BLOCK_SIZE)`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::store::{attr, Expected, Gateway, Item, Key, StoreError, StoreResult, Update};
use crate::BLOCK_SIZE;

const BLOCK_KEY_ATTRS: &[&str] = &[attr::BLOCK_ID, attr::BLOCK_NUM, attr::VERSION];
const BLOCK_DATA_ATTRS: &[&str] = &[attr::BLOCK_ID, attr::BLOCK_NUM, attr::VERSION, attr::DATA];

/// One block row, possibly without its `data` attribute when the caller
/// asked for metadata only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockView {
    pub block_id: String,
    pub num: u64,
    pub version: i64,
    pub data: Option<Vec<u8>>,
}

impl BlockView {
    fn key(&self) -> Key {
        Key::block(&self.block_id, self.num)
    }

    fn from_item(block_id: &str, num: u64, item: &Item) -> Self {
        BlockView {
            block_id: block_id.to_owned(),
            num,
            version: item.i64(attr::VERSION).unwrap_or(1),
            data: item.bytes(attr::DATA).map(<[u8]>::to_vec),
        }
    }

    /// Splices `bytes` into the block at `offset`, preserving bytes on
    /// both sides of the slice. A gap below `offset` reads as zeroes.
    pub fn splice(&mut self, offset: usize, bytes: &[u8]) {
        let data = self.data.get_or_insert_with(Vec::new);
        let end = offset + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(bytes);
    }
}

/// The block numbers touched by an access of `len` bytes at `offset`.
/// `len` must be non-zero.
pub fn block_span(offset: u64, len: usize) -> (u64, u64) {
    let first = offset / BLOCK_SIZE as u64;
    let last = (offset + len as u64 - 1) / BLOCK_SIZE as u64;
    (first, last)
}

/// Block-table access with an optional short-lived read cache.
///
/// The cache only amortises repeated reads inside a single operation:
/// entries expire quickly and a cached copy is used over the stored one
/// only when its `version` is newer.
#[derive(Clone)]
pub struct BlockStore {
    gateway: Arc<Gateway>,
    cache: Option<moka::sync::Cache<(String, u64), BlockView>>,
}

impl BlockStore {
    pub fn new(gateway: Arc<Gateway>, cache_enabled: bool, cache_ttl: Duration) -> Self {
        let cache = cache_enabled.then(|| {
            moka::sync::Cache::builder().time_to_live(cache_ttl).max_capacity(1024).build()
        });
        BlockStore { gateway, cache }
    }

    fn cached(&self, block_id: &str, num: u64) -> Option<BlockView> {
        self.cache.as_ref()?.get(&(block_id.to_owned(), num))
    }

    fn remember(&self, view: &BlockView) {
        if let Some(cache) = &self.cache {
            cache.insert((view.block_id.clone(), view.num), view.clone());
        }
    }

    fn forget(&self, block_id: &str, num: u64) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&(block_id.to_owned(), num));
        }
    }

    /// Reads one block; `want_data = false` projects the metadata
    /// attributes only. Returns `None` for a never-written block.
    pub async fn read(
        &self,
        block_id: &str,
        num: u64,
        want_data: bool,
    ) -> StoreResult<Option<BlockView>> {
        let projection = if want_data { BLOCK_DATA_ATTRS } else { BLOCK_KEY_ATTRS };
        let key = Key::block(block_id, num);
        let stored = self
            .gateway
            .get_block(&key, Some(projection))
            .await?
            .map(|item| BlockView::from_item(block_id, num, &item));
        let cached = self
            .cached(block_id, num)
            .filter(|view| !want_data || view.data.is_some());

        match (stored, cached) {
            (Some(stored), Some(cached)) if cached.version > stored.version => {
                trace!(block_id, num, "returning cached block");
                Ok(Some(cached))
            }
            (Some(stored), _) => Ok(Some(stored)),
            (None, cached) => Ok(cached),
        }
    }

    /// Creates an empty block row with `version = 1`.
    pub async fn create(&self, block_id: &str, num: u64) -> StoreResult<BlockView> {
        let key = Key::block(block_id, num);
        let item = Item::new()
            .with(attr::BLOCK_ID, block_id)
            .with(attr::BLOCK_NUM, num as i64)
            .with(attr::VERSION, 1i64);
        self.gateway.put_new_block(&key, item).await?;
        let view = BlockView { block_id: block_id.to_owned(), num, version: 1, data: None };
        self.remember(&view);
        Ok(view)
    }

    /// Saves the block's `data`, conditioned on the version under which
    /// it was read. Bumps the in-memory version on success.
    pub async fn save(&self, view: &mut BlockView) -> StoreResult<()> {
        let mut update = Update::new().set(attr::VERSION, view.version + 1);
        if let Some(data) = &view.data {
            update = update.set(attr::DATA, data.clone());
        }
        let expected = [Expected::equals(attr::VERSION, view.version)];
        self.gateway.update_block(&view.key(), &update, &expected).await?;
        view.version += 1;
        self.remember(view);
        Ok(())
    }

    /// Deletes every block row with `blockNum` strictly above the bound.
    pub async fn purge_above(&self, block_id: &str, above: i64) -> StoreResult<()> {
        let rows = self.gateway.blocks_above(block_id, above).await?;
        debug!(block_id, above, count = rows.len(), "purging trailing blocks");
        self.delete_rows(block_id, rows).await
    }

    /// Deletes every block row of the file.
    pub async fn purge_all(&self, block_id: &str) -> StoreResult<()> {
        let rows = self.gateway.all_blocks(block_id).await?;
        debug!(block_id, count = rows.len(), "purging all blocks");
        self.delete_rows(block_id, rows).await
    }

    async fn delete_rows(&self, block_id: &str, rows: Vec<Item>) -> StoreResult<()> {
        let nums: Vec<u64> =
            rows.iter().filter_map(|item| item.u64(attr::BLOCK_NUM)).collect();
        for num in &nums {
            self.forget(block_id, *num);
        }
        let keys: Vec<Key> = nums.iter().map(|num| Key::block(block_id, *num)).collect();
        let deletes = keys.iter().map(|key| self.gateway.delete_block(key));
        futures::future::try_join_all(deletes).await?;
        Ok(())
    }

    /// Whether an error from [`BlockStore::create`] means another writer
    /// allocated the block first.
    pub fn lost_create_race(err: &StoreError) -> bool {
        matches!(err, StoreError::AlreadyExists)
    }
}
