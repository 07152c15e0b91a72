//! In-process [`Backend`] with faithful conditional-write semantics.
//!
//! Backs the test suite and local runs. Rows live in ordered maps behind a
//! plain mutex; the mutex is never held across an await point, so the
//! backend is safe under both the single-threaded and multi-threaded
//! runtimes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    Backend, Expected, Item, Key, RangeFilter, SortKey, StoreError, StoreResult, Update, Value,
};

struct Table {
    hash_attr: String,
    range_attr: String,
    rows: BTreeMap<(String, SortKey), Item>,
}

/// Process-local table pair.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut Table) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut tables = self.tables.lock().expect("backend mutex poisoned");
        let table = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::Transient(format!("table {table} does not exist")))?;
        f(table)
    }
}

fn matches(existing: Option<&Item>, expected: &[Expected]) -> bool {
    expected.iter().all(|cond| match cond {
        Expected::Absent(name) => existing.map_or(true, |item| !item.contains(name)),
        Expected::Equals(name, value) => {
            existing.map_or(false, |item| item.get(name) == Some(value))
        }
    })
}

fn key_value(sort: &SortKey) -> Value {
    match sort {
        SortKey::N(n) => Value::N(*n),
        SortKey::S(s) => Value::S(s.clone()),
    }
}

fn project(item: &Item, projection: Option<&[&str]>) -> Item {
    match projection {
        None => item.clone(),
        Some(attrs) => item.project(attrs),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_table(
        &self,
        table: &str,
        hash_attr: &str,
        range_attr: &str,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().expect("backend mutex poisoned");
        tables.entry(table.to_owned()).or_insert_with(|| Table {
            hash_attr: hash_attr.to_owned(),
            range_attr: range_attr.to_owned(),
            rows: BTreeMap::new(),
        });
        Ok(())
    }

    async fn get(
        &self,
        table: &str,
        key: &Key,
        projection: Option<&[&str]>,
        _consistent: bool,
    ) -> StoreResult<Option<Item>> {
        self.with_table(table, |table| {
            let row = table.rows.get(&(key.partition.clone(), key.sort.clone()));
            Ok(row.map(|item| project(item, projection)))
        })
    }

    async fn put(
        &self,
        table: &str,
        key: Key,
        mut item: Item,
        expected: &[Expected],
    ) -> StoreResult<()> {
        self.with_table(table, |table| {
            let map_key = (key.partition.clone(), key.sort.clone());
            if !matches(table.rows.get(&map_key), expected) {
                return Err(StoreError::ConditionFailed);
            }
            item.set(table.hash_attr.clone(), key.partition);
            item.set(table.range_attr.clone(), key_value(&key.sort));
            table.rows.insert(map_key, item);
            Ok(())
        })
    }

    async fn update(
        &self,
        table: &str,
        key: &Key,
        update: &Update,
        expected: &[Expected],
    ) -> StoreResult<Item> {
        self.with_table(table, |table| {
            let map_key = (key.partition.clone(), key.sort.clone());
            let existing = table.rows.get(&map_key);
            if !matches(existing, expected) {
                return Err(StoreError::ConditionFailed);
            }
            let mut item = match existing {
                Some(item) => item.clone(),
                // An update of an absent item creates it, as the remote
                // store does; the counter row relies on this.
                None => {
                    let mut fresh = Item::new();
                    fresh.set(table.hash_attr.clone(), key.partition.clone());
                    fresh.set(table.range_attr.clone(), key_value(&key.sort));
                    fresh
                }
            };
            for (name, delta) in &update.add {
                let current = item.i64(name).unwrap_or(0);
                item.set(name.clone(), current + delta);
            }
            for (name, value) in &update.set {
                item.set(name.clone(), value.clone());
            }
            for name in &update.remove {
                item.remove(name);
            }
            table.rows.insert(map_key, item.clone());
            Ok(item)
        })
    }

    async fn delete(&self, table: &str, key: &Key) -> StoreResult<()> {
        self.with_table(table, |table| {
            table.rows.remove(&(key.partition.clone(), key.sort.clone()));
            Ok(())
        })
    }

    async fn query(
        &self,
        table: &str,
        partition: &str,
        range: RangeFilter,
        projection: Option<&[&str]>,
    ) -> StoreResult<Vec<Item>> {
        self.with_table(table, |table| {
            let rows = table
                .rows
                .iter()
                .filter(|((hash, sort), _)| {
                    hash == partition
                        && match range {
                            RangeFilter::All => true,
                            RangeFilter::Above(bound) => {
                                matches!(sort, SortKey::N(n) if *n > bound)
                            }
                        }
                })
                .map(|(_, item)| project(item, projection))
                .collect();
            Ok(rows)
        })
    }

    async fn scan_eq(&self, table: &str, name: &str, value: &Value) -> StoreResult<Vec<Item>> {
        self.with_table(table, |table| {
            Ok(table
                .rows
                .values()
                .filter(|item| item.get(name) == Some(value))
                .cloned()
                .collect())
        })
    }

    async fn scan_keys(&self, table: &str) -> StoreResult<Vec<Key>> {
        self.with_table(table, |table| {
            Ok(table
                .rows
                .keys()
                .map(|(hash, sort)| Key { partition: hash.clone(), sort: sort.clone() })
                .collect())
        })
    }

    async fn item_count(&self, table: &str) -> StoreResult<u64> {
        self.with_table(table, |table| Ok(table.rows.len() as u64))
    }
}
