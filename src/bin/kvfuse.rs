//! Administration entry point.
//!
//! `kvfuse <uri> <action>` where the action is `createTable`, `cleanup`,
//! `check` or a mountpoint. Mounting itself is performed by the host
//! kernel binding embedding [`kvfuse::fs::KvFs`]; this binary covers the
//! table lifecycle.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kvfuse::config::{Config, StoreUri};
use kvfuse::fs::{Context, KvFs};
use kvfuse::store::memory::MemoryBackend;

#[derive(Parser)]
#[command(name = "kvfuse", version, about = "POSIX filesystem over a key-value store")]
struct Cli {
    /// Store URI: `aws:<region>/<table>` or `mem:<table>`.
    uri: StoreUri,
    /// `createTable`, `cleanup`, `check`, or a mountpoint.
    action: String,
    /// TOML configuration file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(file) => {
            let text = match std::fs::read_to_string(file) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("cannot read {}: {err}", file.display());
                    return ExitCode::FAILURE;
                }
            };
            match Config::from_toml(&text) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("invalid configuration: {err}");
                    return ExitCode::FAILURE;
                }
            }
        }
        None => Config::default(),
    };
    let config = config.apply_uri(&cli.uri);

    let backend = match &cli.uri {
        StoreUri::Mem { .. } => Arc::new(MemoryBackend::new()),
        StoreUri::Aws { .. } => {
            eprintln!(
                "the remote store client is supplied by the embedding daemon; \
                 this build supports mem: URIs"
            );
            return ExitCode::FAILURE;
        }
    };
    let fs = KvFs::new(backend, &config);

    let outcome = match cli.action.as_str() {
        "createTable" | "create-table" => match fs.create_tables().await {
            Ok(()) => fs.bootstrap().await,
            Err(err) => Err(err),
        },
        "cleanup" => fs.cleanup().await,
        "check" => check(&fs).await,
        mountpoint => {
            eprintln!(
                "mounting at {mountpoint} requires the host kernel binding; \
                 supported actions: createTable, cleanup, check"
            );
            return ExitCode::FAILURE;
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err}", cli.action);
            ExitCode::FAILURE
        }
    }
}

async fn check(fs: &KvFs) -> kvfuse::Result<()> {
    fs.create_tables().await?;
    fs.bootstrap().await?;
    let ctx = Context { uid: 0, gid: 0, pid: std::process::id() };
    let stat = fs.statfs(&ctx, "/").await?;
    let root = fs.getattr(&ctx, "/").await?;
    println!(
        "ok: {} items, block size {}, root mode {:o}",
        stat.files, stat.bsize, root.mode
    );
    Ok(())
}
