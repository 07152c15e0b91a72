//! Daemon configuration and store URIs.
//!
//! Credentials are not configured here: the store client library reads
//! the usual credential pair from the environment.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Store region the table pair lives in.
    pub region: String,
    /// Base table name; the blocks table is `<table>Blocks`.
    pub table: String,
    /// Use consistent reads for metadata lookups.
    pub consistent_reads: bool,
    /// Enable the short-lived block read cache.
    pub block_cache: bool,
    /// Block cache time-to-live in milliseconds.
    pub block_cache_ttl_ms: u64,
    /// Provisioned read capacity used by table creation.
    pub read_capacity: u64,
    /// Provisioned write capacity used by table creation.
    pub write_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            region: String::from("us-east-1"),
            table: String::from("kvfuse"),
            consistent_reads: true,
            block_cache: false,
            block_cache_ttl_ms: 2000,
            read_capacity: 5,
            write_capacity: 5,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overrides the region and table from a parsed store URI.
    pub fn apply_uri(mut self, uri: &StoreUri) -> Self {
        match uri {
            StoreUri::Aws { region, table } => {
                self.region = region.clone();
                self.table = table.clone();
            }
            StoreUri::Mem { table } => {
                self.table = table.clone();
            }
        }
        self
    }
}

/// Where the table pair lives: `aws:<region>/<table>` for the remote
/// store, `mem:<table>` for the in-process backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    Aws { region: String, table: String },
    Mem { table: String },
}

impl FromStr for StoreUri {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("aws:") {
            let (region, table) = rest
                .split_once('/')
                .ok_or_else(|| String::from("expected aws:<region>/<table>"))?;
            if region.is_empty() || table.is_empty() {
                return Err(String::from("expected aws:<region>/<table>"));
            }
            return Ok(StoreUri::Aws { region: region.to_owned(), table: table.to_owned() });
        }
        if let Some(table) = s.strip_prefix("mem:") {
            if table.is_empty() {
                return Err(String::from("expected mem:<table>"));
            }
            return Ok(StoreUri::Mem { table: table.to_owned() });
        }
        Err(format!("unsupported store uri: {s}"))
    }
}
