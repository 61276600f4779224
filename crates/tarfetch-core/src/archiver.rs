//! Archiving pool worker: batches fetched records into size-bounded shards
//!
//! Per worker:
//! ```text
//! NoShard → Open → {size full | idle drain} → finalize → Closed
//!                                                     ↘ commit failed → re-queue members
//!                                                       → Open (same sequence id, reopened at once)
//! ```

use std::sync::atomic::Ordering;

use crossbeam::select;

use crate::config::fmt_bytes;
use crate::error::ArchiveError;
use crate::pipeline::Pipeline;
use crate::record::FetchedRecord;
use crate::shard::Shard;

enum Wake {
    Record(FetchedRecord),
    Idle,
    Stop,
}

/// One archiving worker; owns at most one open shard.
pub struct ArchiveWorker<'a> {
    pipeline: &'a Pipeline,
    id: usize,
    shard: Option<Shard>,
    /// Sequence id to reuse after a failed commit
    pending_seq: Option<u64>,
}

impl<'a> ArchiveWorker<'a> {
    pub fn new(pipeline: &'a Pipeline, id: usize) -> Self {
        Self {
            pipeline,
            id,
            shard: None,
            pending_seq: None,
        }
    }

    /// Consume records until the run stops or an unrecoverable error occurs.
    pub fn run(mut self) {
        let p = self.pipeline;
        log::debug!("archive worker {} started", self.id);

        loop {
            let wake = select! {
                recv(p.items()) -> msg => msg.map_or(Wake::Stop, Wake::Record),
                recv(p.stop_signal().receiver()) -> _ => Wake::Stop,
                default(p.config.idle_timeout) => Wake::Idle,
            };
            let step = match wake {
                Wake::Record(record) => self.accept(record),
                Wake::Idle => self.on_idle(),
                Wake::Stop => break,
            };
            if let Err(e) = step {
                p.fail(&e);
                self.abandon();
                return;
            }
        }

        if p.is_failed() {
            self.abandon();
        } else if let Err(e) = self.close_current() {
            p.fail(&e);
        }
        log::debug!("archive worker {} stopped", self.id);
    }

    /// Idle drain: close the open shard once nothing is left to fetch or archive.
    ///
    /// A shard whose commit fails is reopened under the same name right away.
    /// Its re-fetched members may land with another worker, so the reopened
    /// shard can end up committed empty; the name is never skipped.
    fn on_idle(&mut self) -> Result<(), ArchiveError> {
        if self.shard.is_some() && self.pipeline.is_drained() {
            log::debug!("archive worker {}: idle, draining shard", self.id);
            self.close_current()?;
            if self.pending_seq.is_some() {
                self.shard = Some(self.open_next()?);
            }
        }
        Ok(())
    }

    fn accept(&mut self, record: FetchedRecord) -> Result<(), ArchiveError> {
        let max = self.pipeline.config.max_shard_size;
        let mut shard = match self.shard.take() {
            Some(shard) if shard.fits(record.len(), max) => shard,
            full => {
                self.close(full)?;
                self.open_next()?
            }
        };

        let appended = shard.append(&record, &self.pipeline.config.pax_namespace);
        let name = shard.name().to_string();
        self.shard = Some(shard);
        appended?;
        self.pipeline.mark_archived();
        if record.len() > max {
            log::warn!(
                "{name}: {} ({}) exceeds the shard size limit, stored alone",
                record.url,
                fmt_bytes(record.len())
            );
        }
        Ok(())
    }

    fn open_next(&mut self) -> Result<Shard, ArchiveError> {
        let p = self.pipeline;
        let seq = self.pending_seq.take().unwrap_or_else(|| p.sequence.next());
        match Shard::open(p.store.as_ref(), &p.config.output_prefix, seq) {
            Ok(shard) => {
                log::info!("opened shard {}", shard.name());
                p.shard_opened();
                Ok(shard)
            }
            Err(e) => {
                self.pending_seq = Some(seq);
                Err(e)
            }
        }
    }

    fn close_current(&mut self) -> Result<(), ArchiveError> {
        let shard = self.shard.take();
        self.close(shard)
    }

    /// Finalize a shard, if any.
    ///
    /// A failed commit is not an error here: the members go back to the work
    /// source and the sequence id is kept for the next shard.
    fn close(&mut self, shard: Option<Shard>) -> Result<(), ArchiveError> {
        let Some(shard) = shard else {
            return Ok(());
        };
        let p = self.pipeline;
        log::info!("closing shard {}", shard.name());

        let (closed, result) = shard.finalize();
        let outcome = match result {
            Ok(()) => {
                p.counters.shards_committed.fetch_add(1, Ordering::Relaxed);
                p.counters
                    .records_archived
                    .fetch_add(closed.members.len() as u64, Ordering::Relaxed);
                p.counters
                    .bytes_archived
                    .fetch_add(closed.size, Ordering::Relaxed);
                log::info!(
                    "committed {}: {} records, {}",
                    closed.name,
                    closed.members.len(),
                    fmt_bytes(closed.size)
                );
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                log::warn!(
                    "{e}; re-queueing {} locators, {} will be rewritten",
                    closed.members.len(),
                    closed.name
                );
                p.counters.commit_failures.fetch_add(1, Ordering::Relaxed);
                p.requeue(closed.members);
                self.pending_seq = Some(closed.seq);
                Ok(())
            }
            Err(e) => Err(e),
        };
        p.shard_closed();
        outcome
    }

    /// Drop the open shard without committing it.
    fn abandon(&mut self) {
        if let Some(shard) = self.shard.take() {
            log::warn!(
                "abandoning shard {} with {} records",
                shard.name(),
                shard.members().len()
            );
            drop(shard);
            self.pipeline.shard_closed();
        }
    }
}

/// Entry point for an archiving worker thread
pub fn run_archive_worker(pipeline: &Pipeline, worker_id: usize) {
    ArchiveWorker::new(pipeline, worker_id).run();
}
