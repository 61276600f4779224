//! Bandwidth reporter and signal watcher

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam::channel::RecvTimeoutError;
use indicatif::ProgressBar;

use crate::config::fmt_bytes;
use crate::pipeline::Pipeline;
use crate::progress::{ProgressContext, fmt_num};
use crate::shutdown::is_shutdown_requested;

/// How often the shutdown flag is checked
const SIGNAL_POLL: Duration = Duration::from_millis(250);

/// Download rate over one report interval
pub fn rate_mib_per_sec(delta_bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    delta_bytes as f64 / 1024.0 / 1024.0 / secs
}

/// Periodically report download bandwidth until the run stops.
///
/// TTY: a status line under the log output. Non-TTY: one log line per report.
/// Also turns a SIGINT/SIGTERM into a stop of the run.
pub fn run_monitor(pipeline: &Pipeline, progress: &ProgressContext) {
    let stop = pipeline.stop_signal();
    let line: ProgressBar = progress.stage_line("fetch");
    let interval = pipeline.config.report_interval;

    let mut prev_bytes = pipeline.bandwidth.load(Ordering::Relaxed);
    let mut last_report = Instant::now();

    loop {
        if let Err(RecvTimeoutError::Disconnected) =
            stop.receiver().recv_timeout(SIGNAL_POLL.min(interval))
        {
            break;
        }
        if is_shutdown_requested() && !stop.is_triggered() {
            log::warn!("Shutdown requested, stopping pipeline");
            stop.trigger();
            break;
        }

        let elapsed = last_report.elapsed();
        if elapsed < interval {
            continue;
        }
        let current = pipeline.bandwidth.load(Ordering::Relaxed);
        let rate = rate_mib_per_sec(current.saturating_sub(prev_bytes), elapsed);
        prev_bytes = current;
        last_report = Instant::now();

        let status = format!(
            "{rate:.2} MB/s, {} total, {} in flight, {} queued, {} open shards, {} failed",
            fmt_bytes(current),
            fmt_num(pipeline.work.in_flight()),
            fmt_num(pipeline.queued()),
            pipeline.open_shards(),
            fmt_num(pipeline.work.failure_count()),
        );
        if progress.is_tty() {
            line.set_message(status);
        } else {
            log::info!("Downloaded: {status}");
        }
    }

    line.finish_and_clear();
}
