use std::sync::Arc;

use kvfuse::config::Config;
use kvfuse::fs::{Context, KvFs};
use kvfuse::store::memory::MemoryBackend;
use kvfuse::store::{Backend, Item, Key, RangeFilter};

pub struct Fixture {
    pub backend: Arc<MemoryBackend>,
    pub fs: KvFs,
}

impl Fixture {
    pub async fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let fs = KvFs::new(backend.clone(), &Config::default());
        fs.create_tables().await.expect("create tables");
        fs.bootstrap().await.expect("bootstrap");
        // Make the playground writable for the unprivileged test context.
        fs.chmod(&root_ctx(), "/", 0o777).await.expect("open up root");
        Fixture { backend, fs }
    }

    /// A second daemon instance sharing the same backing store, as a
    /// separate mount would.
    pub fn second(&self) -> KvFs {
        KvFs::new(self.backend.clone(), &Config::default())
    }

    pub async fn write_file(&self, path: &str, data: &[u8]) {
        self.fs.create(&ctx(), path, 0o644).await.expect("create file");
        if !data.is_empty() {
            self.fs.write(&ctx(), path, data, 0).await.expect("write file");
        }
    }

    /// The raw metadata row behind a path.
    pub async fn raw_meta(&self, parent: &str, name: &str) -> Option<Item> {
        self.backend
            .get("kvfuse", &Key::meta(parent, name), None, true)
            .await
            .expect("backend get")
    }

    /// Block numbers currently stored for a file, by its block id.
    pub async fn block_numbers(&self, block_id: &str) -> Vec<i64> {
        self.backend
            .query("kvfuseBlocks", block_id, RangeFilter::All, None)
            .await
            .expect("backend query")
            .iter()
            .filter_map(|item| item.i64("blockNum"))
            .collect()
    }

    /// The block partition id of a file, from its reported inode number.
    pub async fn block_id_of(&self, path: &str) -> String {
        let attr = self.fs.getattr(&ctx(), path).await.expect("getattr");
        attr.ino.to_string()
    }
}

pub fn ctx() -> Context {
    Context { uid: 1000, gid: 1000, pid: 7 }
}

pub fn other_ctx() -> Context {
    Context { uid: 2000, gid: 2000, pid: 8 }
}

pub fn root_ctx() -> Context {
    Context { uid: 0, gid: 0, pid: 1 }
}
