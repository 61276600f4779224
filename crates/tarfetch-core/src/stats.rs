//! End-of-run summary

use std::sync::atomic::Ordering;
use std::time::Duration;

use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use crate::config::fmt_bytes;
use crate::pipeline::Pipeline;
use crate::progress::fmt_num;

/// What one run did, collected after all workers have stopped.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    /// Locators handed to the fetch pool
    pub submitted: usize,
    /// Locators dropped because they were on the skip list
    pub skipped: usize,
    /// Input lines that could not be decoded
    pub malformed: usize,
    pub records_archived: u64,
    pub bytes_archived: u64,
    pub shards_committed: u64,
    pub commit_failures: u64,
    pub requeued: u64,
    /// Locators whose download failed permanently
    pub failed: usize,
    /// Payload bytes received, including retried attempts
    pub downloaded_bytes: u64,
    pub elapsed: Duration,
    /// The run was cut short by a signal
    pub interrupted: bool,
}

impl RunSummary {
    /// Snapshot the counters of a finished pipeline.
    pub fn collect(pipeline: &Pipeline, submitted: usize, skipped: usize, malformed: usize) -> Self {
        let c = &pipeline.counters;
        Self {
            submitted,
            skipped,
            malformed,
            records_archived: c.records_archived.load(Ordering::Relaxed),
            bytes_archived: c.bytes_archived.load(Ordering::Relaxed),
            shards_committed: c.shards_committed.load(Ordering::Relaxed),
            commit_failures: c.commit_failures.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            failed: pipeline.work.failure_count(),
            downloaded_bytes: pipeline.bandwidth.load(Ordering::Relaxed),
            ..Default::default()
        }
    }

    /// Average download rate in MiB/s over the whole run
    pub fn throughput(&self) -> f64 {
        crate::monitor::rate_mib_per_sec(self.downloaded_bytes, self.elapsed)
    }

    /// Format summary table as a string.
    pub fn format_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Run Summary")
                    .fg(Color::Cyan)
                    .add_attribute(comfy_table::Attribute::Bold),
                Cell::new("Value").fg(Color::Cyan),
            ]);

        table.add_row(vec![Cell::new("Submitted"), Cell::new(fmt_num(self.submitted))]);
        if self.skipped > 0 {
            table.add_row(vec![Cell::new("Skipped"), Cell::new(fmt_num(self.skipped))]);
        }
        if self.malformed > 0 {
            table.add_row(vec![
                Cell::new("Malformed lines").fg(Color::Yellow),
                Cell::new(fmt_num(self.malformed)).fg(Color::Yellow),
            ]);
        }
        table.add_row(vec![
            Cell::new("Archived").fg(Color::Green),
            Cell::new(format!(
                "{} ({})",
                fmt_num(self.records_archived as usize),
                fmt_bytes(self.bytes_archived)
            ))
            .fg(Color::Green),
        ]);
        table.add_row(vec![
            Cell::new("Shards"),
            Cell::new(fmt_num(self.shards_committed as usize)),
        ]);
        if self.commit_failures > 0 {
            table.add_row(vec![
                Cell::new("Commit failures").fg(Color::Yellow),
                Cell::new(format!(
                    "{} ({} re-queued)",
                    self.commit_failures,
                    fmt_num(self.requeued as usize)
                ))
                .fg(Color::Yellow),
            ]);
        }
        let failed = Cell::new(fmt_num(self.failed));
        table.add_row(vec![
            Cell::new("Failed"),
            if self.failed > 0 {
                failed.fg(Color::Red)
            } else {
                failed
            },
        ]);
        table.add_row(vec![
            Cell::new("Downloaded"),
            Cell::new(format!(
                "{} ({:.2} MB/s)",
                fmt_bytes(self.downloaded_bytes),
                self.throughput()
            )),
        ]);
        table.add_row(vec![
            Cell::new("Elapsed"),
            Cell::new(format!("{:.1}s", self.elapsed.as_secs_f64())),
        ]);

        let mut out = format!("\n{table}");
        if self.interrupted {
            out.push_str("\n  Interrupted: open shards were committed, remaining work was dropped");
        }
        out
    }

    /// Print the summary table to stderr (TTY mode).
    pub fn print(&self) {
        eprintln!("{}", self.format_table());
    }

    /// Log minimal summary (non-TTY mode).
    pub fn log(&self) {
        log::info!(
            "{} {} records in {} shards ({}), {} failed, {:.1}s",
            if self.interrupted { "Interrupted:" } else { "Done:" },
            fmt_num(self.records_archived as usize),
            self.shards_committed,
            fmt_bytes(self.bytes_archived),
            fmt_num(self.failed),
            self.elapsed.as_secs_f64()
        );
    }
}
