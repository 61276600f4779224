//! Run orchestration: start the pools, feed the input, wait for quiescence

use std::sync::Arc;
use std::thread::Scope;
use std::time::Instant;

use anyhow::Context;
use crossbeam::channel::RecvTimeoutError;
use rustc_hash::FxHashSet;

use crate::archiver::run_archive_worker;
use crate::config::{Config, fmt_bytes};
use crate::fetch::run_fetch_worker;
use crate::input::{LineOutcome, fails_path, load_locators, open_lines, parse_line, write_failures};
use crate::monitor::run_monitor;
use crate::pipeline::Pipeline;
use crate::progress::{ProgressContext, fmt_num};
use crate::shutdown::is_shutdown_requested;
use crate::sink::ObjectStore;
use crate::stats::RunSummary;

/// Input lines handed to the work source
#[derive(Debug, Default)]
struct FeedStats {
    submitted: usize,
    skipped: usize,
    malformed: usize,
}

/// Fetch every locator of `config.input` and archive the results into
/// `<prefix><n>.tar` shards in `store`.
///
/// Returns once the pipeline has been idle for more than `idle_rounds`
/// consecutive polls, or after an interruption. Permanent download failures
/// are written to `<input>_fails`. An unrecoverable archiving error aborts the
/// run without writing the failure file.
pub fn run(
    config: &Config,
    store: Arc<dyn ObjectStore>,
    progress: &ProgressContext,
) -> anyhow::Result<RunSummary> {
    config.validate()?;
    let start = Instant::now();

    let lines = open_lines(&config.input)?;
    let skip = match &config.skip_list {
        Some(path) => {
            let set = load_locators(path)
                .with_context(|| format!("Cannot load skip list {}", path.display()))?;
            log::info!("Skip list: {} locators", fmt_num(set.len()));
            set
        }
        None => FxHashSet::default(),
    };

    let pipeline = Pipeline::new(config.clone(), store).context("Cannot build HTTP client")?;
    log::info!(
        "tarfetch starting: input={}, fetchers={}, archivers={}, max shard={}, prefix={:?}",
        config.input.display(),
        config.fetch_workers,
        config.archive_workers,
        fmt_bytes(config.max_shard_size),
        config.output_prefix,
    );

    let feed = std::thread::scope(|s| {
        if let Err(e) = spawn_workers(s, &pipeline, progress) {
            pipeline.stop_signal().trigger();
            return Err(e);
        }

        let feed = feed_input(&pipeline, lines, &skip, &config.input);
        match &feed {
            Ok(stats) => {
                log::info!(
                    "Input exhausted: {} submitted, {} skipped, {} malformed",
                    fmt_num(stats.submitted),
                    fmt_num(stats.skipped),
                    fmt_num(stats.malformed)
                );
                wait_for_quiescence(&pipeline);
            }
            Err(e) => log::error!("{e:#}"),
        }
        pipeline.stop_signal().trigger();
        feed
    })?;

    if let Some(err) = pipeline.fatal_error() {
        anyhow::bail!("run aborted: {err}");
    }

    let failures = pipeline.work.failures();
    let fails = fails_path(&config.input);
    write_failures(&fails, &failures)
        .with_context(|| format!("Cannot write failure file {}", fails.display()))?;
    if !failures.is_empty() {
        log::warn!(
            "{} locators failed, written to {}",
            fmt_num(failures.len()),
            fails.display()
        );
    }

    let mut summary = RunSummary::collect(&pipeline, feed.submitted, feed.skipped, feed.malformed);
    summary.elapsed = start.elapsed();
    summary.interrupted = is_shutdown_requested();
    Ok(summary)
}

fn spawn_workers<'scope>(
    s: &'scope Scope<'scope, '_>,
    pipeline: &'scope Pipeline,
    progress: &'scope ProgressContext,
) -> anyhow::Result<()> {
    for id in 0..pipeline.config.fetch_workers {
        std::thread::Builder::new()
            .name(format!("fetch-{id}"))
            .spawn_scoped(s, move || run_fetch_worker(pipeline, id))
            .context("Failed to spawn fetch worker")?;
    }
    for id in 0..pipeline.config.archive_workers {
        std::thread::Builder::new()
            .name(format!("archive-{id}"))
            .spawn_scoped(s, move || run_archive_worker(pipeline, id))
            .context("Failed to spawn archive worker")?;
    }
    std::thread::Builder::new()
        .name("monitor".into())
        .spawn_scoped(s, move || run_monitor(pipeline, progress))
        .context("Failed to spawn bandwidth monitor")?;
    Ok(())
}

/// Stream the input list into the work source.
///
/// Stops early, without error, when the run is stopped.
fn feed_input(
    pipeline: &Pipeline,
    lines: impl Iterator<Item = std::io::Result<String>>,
    skip: &FxHashSet<String>,
    input: &std::path::Path,
) -> anyhow::Result<FeedStats> {
    let mut stats = FeedStats::default();
    for (idx, line) in lines.enumerate() {
        let line = line.with_context(|| format!("{}: read failed", input.display()))?;
        let locator = match parse_line(&line) {
            LineOutcome::Locator(loc) => loc,
            LineOutcome::Blank => {
                log::debug!("{}:{}: blank line", input.display(), idx + 1);
                continue;
            }
            LineOutcome::Malformed(e) => {
                log::warn!("{}:{}: skipping malformed line: {e}", input.display(), idx + 1);
                stats.malformed += 1;
                continue;
            }
        };
        if skip.contains(&locator) {
            stats.skipped += 1;
            continue;
        }
        if !pipeline.work.submit(locator) {
            log::debug!("run stopped, input feeding ends at line {}", idx + 1);
            break;
        }
        stats.submitted += 1;
    }
    Ok(stats)
}

/// Poll until the pipeline has been idle for more than `idle_rounds`
/// consecutive polls, or the run is stopped.
fn wait_for_quiescence(pipeline: &Pipeline) {
    let config = &pipeline.config;
    let stop = pipeline.stop_signal();
    let mut idle = 0u32;

    loop {
        if let Err(RecvTimeoutError::Disconnected) =
            stop.receiver().recv_timeout(config.poll_interval)
        {
            return;
        }
        if pipeline.is_idle() {
            idle += 1;
            if idle > config.idle_rounds {
                log::info!("Pipeline idle, shutting down");
                return;
            }
        } else {
            idle = 0;
            log::info!(
                "Remaining: {} in flight, {} queued, {} unarchived, {} open shards",
                fmt_num(pipeline.work.in_flight()),
                fmt_num(pipeline.queued()),
                fmt_num(pipeline.unarchived()),
                pipeline.open_shards()
            );
        }
    }
}
