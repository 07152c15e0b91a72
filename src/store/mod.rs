//! Typed facade over the key-value store.
//!
//! The backing store is modelled after a DynamoDB-style table pair: items
//! are flat attribute maps addressed by a `(partition, sort)` key, and the
//! only concurrency primitive is the per-item conditional write. Everything
//! above this module speaks [`Gateway`]; the concrete client lives behind
//! the [`Backend`] trait so the filesystem can run against a production
//! client or against the in-process [`memory::MemoryBackend`].

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

/// Result of store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by the store layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The addressed item does not exist.
    #[error("item not found")]
    NotFound,
    /// A put-if-not-exists collided with an existing item.
    #[error("item already exists")]
    AlreadyExists,
    /// A conditional write observed state that no longer matches the
    /// expectation. Retryable by the caller.
    #[error("conditional check failed")]
    ConditionFailed,
    /// A network, serialisation or provisioning failure. Surfaces as EIO.
    #[error("transient backend failure: {0}")]
    Transient(String),
}

/// Well-known attribute names of the metadata and blocks tables.
pub mod attr {
    pub const NAME: &str = "name";
    pub const PATH: &str = "path";
    pub const TYPE: &str = "type";
    pub const VERSION: &str = "version";
    pub const MODE: &str = "st_mode";
    pub const UID: &str = "st_uid";
    pub const GID: &str = "st_gid";
    pub const NLINK: &str = "st_nlink";
    pub const SIZE: &str = "st_size";
    pub const BLKSIZE: &str = "st_blksize";
    pub const INO: &str = "st_ino";
    pub const ATIME: &str = "st_atime";
    pub const MTIME: &str = "st_mtime";
    pub const CTIME: &str = "st_ctime";
    pub const RDEV: &str = "st_rdev";
    pub const BLOCK_ID: &str = "blockId";
    pub const BLOCK_NUM: &str = "blockNum";
    pub const DATA: &str = "data";
    pub const SYMLINK: &str = "symlink";
    pub const LINK: &str = "link";
    pub const DELETED: &str = "deleted";
    pub const HIDDEN: &str = "hidden";
    pub const READ_LOCK: &str = "readLock";
    pub const WRITE_LOCK: &str = "writeLock";
    pub const LOCK_OWNER: &str = "lockOwner";
    pub const COUNTER_VALUE: &str = "value";
}

/// Attributes the gateway always folds into an explicit projection, so
/// partial records can still be typed and re-saved by upper layers.
pub const KEY_ATTRS: &[&str] = &[attr::NAME, attr::PATH, attr::TYPE, attr::VERSION];

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Numeric attribute.
    N(i64),
    /// String attribute.
    S(String),
    /// Opaque byte string.
    B(Vec<u8>),
    /// Boolean flag.
    Bool(bool),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::B(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::N(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::S(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::S(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::B(b)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// A flat attribute map --- one row of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    map: BTreeMap<String, Value>,
}

impl Item {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style attribute insertion.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.map.insert(name.into(), value.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.map.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.map.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.i64(name).and_then(|n| u64::try_from(n).ok())
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(Value::as_bytes)
    }

    /// A boolean flag; an absent attribute reads as `false`.
    pub fn flag(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// A copy restricted to the named attributes.
    pub fn project(&self, attrs: &[&str]) -> Item {
        let map = self
            .map
            .iter()
            .filter(|(k, _)| attrs.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Item { map }
    }
}

/// Sort-key component of an item key. String for the metadata table,
/// numeric for the blocks table; a table never mixes the two.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SortKey {
    N(i64),
    S(String),
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortKey::N(n) => write!(f, "{n}"),
            SortKey::S(s) => write!(f, "{s}"),
        }
    }
}

/// Composite item key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub partition: String,
    pub sort: SortKey,
}

impl Key {
    /// Metadata-table key `(parentPath, name)`.
    pub fn meta(parent: &str, name: &str) -> Self {
        Key { partition: parent.to_owned(), sort: SortKey::S(name.to_owned()) }
    }

    /// Blocks-table key `(blockId, blockNum)`.
    pub fn block(block_id: &str, num: u64) -> Self {
        Key { partition: block_id.to_owned(), sort: SortKey::N(num as i64) }
    }
}

/// Attribute-level predicate of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    /// The attribute must not exist on the item (a missing item passes).
    Absent(String),
    /// The attribute must exist and equal the value exactly.
    Equals(String, Value),
}

impl Expected {
    pub fn absent(name: impl Into<String>) -> Self {
        Expected::Absent(name.into())
    }

    pub fn equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Expected::Equals(name.into(), value.into())
    }
}

/// Attribute-level actions of an update. `add` is the atomic numeric ADD;
/// a missing attribute counts as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub set: Vec<(String, Value)>,
    pub remove: Vec<String>,
    pub add: Vec<(String, i64)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((name.into(), value.into()));
        self
    }

    pub fn remove(mut self, name: impl Into<String>) -> Self {
        self.remove.push(name.into());
        self
    }

    pub fn add(mut self, name: impl Into<String>, delta: i64) -> Self {
        self.add.push((name.into(), delta));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty() && self.add.is_empty()
    }
}

/// Sort-key filter of a partition query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RangeFilter {
    All,
    /// Numeric sort key strictly greater than the bound.
    Above(i64),
}

/// The store client interface.
///
/// A production implementation wraps the remote client library; tests and
/// local runs use [`memory::MemoryBackend`]. All methods may fail with
/// [`StoreError::Transient`]; conditional methods fail with
/// [`StoreError::ConditionFailed`] when the expectation does not hold.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates a table with the given key schema. Idempotent.
    async fn create_table(&self, table: &str, hash_attr: &str, range_attr: &str)
        -> StoreResult<()>;

    /// Reads one item; `None` when absent.
    async fn get(
        &self,
        table: &str,
        key: &Key,
        projection: Option<&[&str]>,
        consistent: bool,
    ) -> StoreResult<Option<Item>>;

    /// Writes a whole item, subject to the expectations.
    async fn put(&self, table: &str, key: Key, item: Item, expected: &[Expected])
        -> StoreResult<()>;

    /// Applies attribute-level actions, subject to the expectations, and
    /// returns the item as committed. Creates the item when absent.
    async fn update(
        &self,
        table: &str,
        key: &Key,
        update: &Update,
        expected: &[Expected],
    ) -> StoreResult<Item>;

    /// Removes one item. Removing an absent item is not an error.
    async fn delete(&self, table: &str, key: &Key) -> StoreResult<()>;

    /// Enumerates a partition in sort-key order.
    async fn query(
        &self,
        table: &str,
        partition: &str,
        range: RangeFilter,
        projection: Option<&[&str]>,
    ) -> StoreResult<Vec<Item>>;

    /// Scans for items whose attribute equals the value. Stands in for the
    /// keys-only secondary index used by hard-link retargeting.
    async fn scan_eq(&self, table: &str, name: &str, value: &Value) -> StoreResult<Vec<Item>>;

    /// Every key in the table.
    async fn scan_keys(&self, table: &str) -> StoreResult<Vec<Key>>;

    /// The backend's item count estimate.
    async fn item_count(&self, table: &str) -> StoreResult<u64>;
}

/// Typed access to the metadata and blocks tables of one filesystem.
pub struct Gateway {
    backend: Arc<dyn Backend>,
    table: String,
    block_table: String,
    consistent: bool,
}

impl Gateway {
    pub fn new(backend: Arc<dyn Backend>, base: &str, consistent: bool) -> Self {
        Gateway {
            backend,
            table: base.to_owned(),
            block_table: format!("{base}Blocks"),
            consistent,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn block_table(&self) -> &str {
        &self.block_table
    }

    /// Provisions both tables of the pair. Idempotent.
    pub async fn create_tables(&self) -> StoreResult<()> {
        self.backend.create_table(&self.table, attr::PATH, attr::NAME).await?;
        self.backend.create_table(&self.block_table, attr::BLOCK_ID, attr::BLOCK_NUM).await
    }

    /// Reads a metadata item. An explicit projection is widened so that
    /// `name`, `path`, `type` and `version` are always present.
    pub async fn get_meta(
        &self,
        key: &Key,
        projection: Option<&[&str]>,
    ) -> StoreResult<Option<Item>> {
        match projection {
            None => self.backend.get(&self.table, key, None, self.consistent).await,
            Some(attrs) => {
                let mut full: Vec<&str> = attrs.to_vec();
                for required in KEY_ATTRS {
                    if !full.contains(required) {
                        full.push(required);
                    }
                }
                self.backend.get(&self.table, key, Some(&full), self.consistent).await
            }
        }
    }

    /// Writes a metadata item unconditionally, replacing any existing row.
    pub async fn put_meta(&self, key: &Key, item: Item) -> StoreResult<()> {
        self.backend.put(&self.table, key.clone(), item, &[]).await
    }

    /// Creates a metadata item, failing with [`StoreError::AlreadyExists`]
    /// when the key is taken.
    pub async fn put_new_meta(&self, key: &Key, item: Item) -> StoreResult<()> {
        let guard = [Expected::absent(attr::PATH)];
        match self.backend.put(&self.table, key.clone(), item, &guard).await {
            Err(StoreError::ConditionFailed) => Err(StoreError::AlreadyExists),
            other => other,
        }
    }

    pub async fn update_meta(
        &self,
        key: &Key,
        update: &Update,
        expected: &[Expected],
    ) -> StoreResult<Item> {
        self.backend.update(&self.table, key, update, expected).await
    }

    pub async fn delete_meta(&self, key: &Key) -> StoreResult<()> {
        self.backend.delete(&self.table, key).await
    }

    /// Enumerates the children partition of a directory.
    pub async fn query_children(
        &self,
        parent: &str,
        projection: Option<&[&str]>,
    ) -> StoreResult<Vec<Item>> {
        self.backend.query(&self.table, parent, RangeFilter::All, projection).await
    }

    /// Keys of every Link row whose `link` attribute equals the target
    /// path, via the `(path, link)` keys-only index.
    pub async fn links_to(&self, target: &str) -> StoreResult<Vec<Key>> {
        let rows =
            self.backend.scan_eq(&self.table, attr::LINK, &Value::from(target)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let parent = row.str(attr::PATH)?;
                let name = row.str(attr::NAME)?;
                Some(Key::meta(parent, name))
            })
            .collect())
    }

    /// Mints the next unique id from the reserved `("global","counter")`
    /// row via an atomic ADD returning the new value.
    pub async fn next_id(&self) -> StoreResult<i64> {
        let key = Key::meta("global", "counter");
        let update = Update::new().add(attr::COUNTER_VALUE, 1);
        let item = self.backend.update(&self.table, &key, &update, &[]).await?;
        let id = item
            .i64(attr::COUNTER_VALUE)
            .ok_or_else(|| StoreError::Transient(String::from("counter row is corrupt")))?;
        trace!(id, "minted unique id");
        Ok(id)
    }

    pub async fn get_block(
        &self,
        key: &Key,
        projection: Option<&[&str]>,
    ) -> StoreResult<Option<Item>> {
        self.backend.get(&self.block_table, key, projection, self.consistent).await
    }

    pub async fn put_new_block(&self, key: &Key, item: Item) -> StoreResult<()> {
        let guard = [Expected::absent(attr::BLOCK_ID)];
        match self.backend.put(&self.block_table, key.clone(), item, &guard).await {
            Err(StoreError::ConditionFailed) => Err(StoreError::AlreadyExists),
            other => other,
        }
    }

    pub async fn update_block(
        &self,
        key: &Key,
        update: &Update,
        expected: &[Expected],
    ) -> StoreResult<Item> {
        self.backend.update(&self.block_table, key, update, expected).await
    }

    pub async fn delete_block(&self, key: &Key) -> StoreResult<()> {
        self.backend.delete(&self.block_table, key).await
    }

    /// Block rows of one file with `blockNum` strictly above the bound,
    /// keys only.
    pub async fn blocks_above(&self, block_id: &str, above: i64) -> StoreResult<Vec<Item>> {
        self.backend
            .query(
                &self.block_table,
                block_id,
                RangeFilter::Above(above),
                Some(&[attr::BLOCK_ID, attr::BLOCK_NUM]),
            )
            .await
    }

    /// Every block row of one file, keys only.
    pub async fn all_blocks(&self, block_id: &str) -> StoreResult<Vec<Item>> {
        self.backend
            .query(
                &self.block_table,
                block_id,
                RangeFilter::All,
                Some(&[attr::BLOCK_ID, attr::BLOCK_NUM]),
            )
            .await
    }

    /// Item count estimate of the metadata table, reported by statfs.
    pub async fn item_count(&self) -> StoreResult<u64> {
        self.backend.item_count(&self.table).await
    }

    pub async fn scan_meta_keys(&self) -> StoreResult<Vec<Key>> {
        self.backend.scan_keys(&self.table).await
    }

    pub async fn scan_block_keys(&self) -> StoreResult<Vec<Key>> {
        self.backend.scan_keys(&self.block_table).await
    }
}
