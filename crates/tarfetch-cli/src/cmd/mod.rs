//! Subcommands

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tarfetch_core::{CommandStore, LocalStore, ObjectStore, cleanup_tmp_files};

use crate::config::Config;

pub mod inspect;
pub mod run;

/// Shard destination; overrides the `[store]` config section
#[derive(Args, Debug, Default)]
pub struct StoreArgs {
    /// Write shards into this directory
    #[arg(long, conflicts_with = "store_cmd")]
    pub store_dir: Option<PathBuf>,

    /// Stream each shard into this command's stdin ({name} = shard name),
    /// e.g. "rclone rcat remote:bucket/{name}"
    #[arg(long)]
    pub store_cmd: Option<String>,

    /// Command printing a stored shard to stdout ({name} = shard name)
    #[arg(long)]
    pub read_cmd: Option<String>,
}

impl StoreArgs {
    /// Build the sink. Stale `.tmp` files in a local directory are removed
    /// when `cleanup` is set.
    pub fn open(&self, config: &Config, cleanup: bool) -> Result<Arc<dyn ObjectStore>> {
        let read_cmd = self.read_cmd.as_deref().or(config.store.read_cmd.as_deref());
        let write_cmd = match &self.store_dir {
            Some(_) => None,
            None => self.store_cmd.as_deref().or(config.store.write_cmd.as_deref()),
        };

        if let Some(write_cmd) = write_cmd {
            log::info!("Store: command `{write_cmd}`");
            return Ok(Arc::new(CommandStore::new(write_cmd, read_cmd)?));
        }

        let dir = self.store_dir.as_ref().unwrap_or(&config.store.dir);
        let store = LocalStore::new(dir)
            .with_context(|| format!("Cannot create store directory {}", dir.display()))?;
        if cleanup {
            cleanup_tmp_files(dir).context("Failed to clean stale tmp files")?;
        }
        log::info!("Store: directory {}", dir.display());
        Ok(Arc::new(store))
    }
}
