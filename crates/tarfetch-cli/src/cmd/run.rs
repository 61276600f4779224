//! `tarfetch run` - fetch a locator list into tar shards

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tarfetch_core::{SharedProgress, is_shutdown_requested, parse_size};

use super::StoreArgs;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Input list, one URL per line (raw or JSON-quoted)
    pub input: PathBuf,

    /// Number of fetch workers
    pub fetchers: usize,

    /// Number of archiving workers
    pub archivers: usize,

    /// Maximum shard size (e.g. 10G, 512M, 1Ti; bare number = KiB; "off")
    #[arg(value_parser = parse_size)]
    pub max_size: u64,

    /// Shard name prefix; shards are <prefix><n>.tar
    pub prefix: String,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Leave out locators listed in this file (e.g. a previous run's _fails)
    #[arg(long)]
    pub skip: Option<PathBuf>,

    /// Fetched-record queue capacity
    #[arg(long)]
    pub queue: Option<usize>,

    /// Attempts per URL before it is recorded as failed
    #[arg(long)]
    pub attempts: Option<u32>,

    /// Deadline for a whole request in seconds
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Fail an attempt when no body bytes arrive for this many seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,
}

impl RunArgs {
    fn to_core(&self, config: &Config) -> Result<tarfetch_core::Config> {
        let mut core = config.to_core()?;
        core.input = self.input.clone();
        core.skip_list = self.skip.clone();
        core.fetch_workers = self.fetchers;
        core.archive_workers = self.archivers;
        core.max_shard_size = self.max_size;
        core.output_prefix = self.prefix.clone();
        if let Some(queue) = self.queue {
            core.queue_capacity = queue;
        }
        if let Some(attempts) = self.attempts {
            core.fetch_attempts = attempts;
        }
        if let Some(secs) = self.request_timeout {
            core.http.request_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.read_timeout {
            core.http.read_timeout = Duration::from_secs(secs);
        }
        Ok(core)
    }
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<ExitCode> {
    let core = args.to_core(config)?;
    core.validate()?;
    let store = args.store.open(config, true)?;

    let summary = tarfetch_core::run(&core, store, progress)?;
    if progress.is_tty() {
        summary.print();
    } else {
        summary.log();
    }

    if summary.interrupted || is_shutdown_requested() {
        log::warn!("Interrupted");
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn positional_arguments() {
        let cli = TestCli::parse_from([
            "t", "urls.txt", "32", "4", "512M", "crawl-", "--store-dir", "/tmp/s", "--queue", "20",
        ]);
        let core = cli.run.to_core(&Config::default()).unwrap();
        assert_eq!(core.input, PathBuf::from("urls.txt"));
        assert_eq!(core.fetch_workers, 32);
        assert_eq!(core.archive_workers, 4);
        assert_eq!(core.max_shard_size, 512 << 20);
        assert_eq!(core.output_prefix, "crawl-");
        assert_eq!(core.queue_capacity, 20);
        assert_eq!(core.fetch_attempts, 5);
    }

    #[test]
    fn bare_size_is_kib() {
        let cli = TestCli::parse_from(["t", "in", "1", "1", "100", "p"]);
        assert_eq!(cli.run.max_size, 100 * 1024);
    }

    #[test]
    fn store_dir_conflicts_with_store_cmd() {
        let res = TestCli::try_parse_from([
            "t", "in", "1", "1", "1G", "p", "--store-dir", "d", "--store-cmd", "tee {name}",
        ]);
        assert!(res.is_err());
    }
}
