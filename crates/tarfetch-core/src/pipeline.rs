//! State shared by every worker of one run

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;

use crate::config::Config;
use crate::error::{ArchiveError, FetchError};
use crate::record::FetchedRecord;
use crate::shard::ShardSequence;
use crate::shutdown::StopSignal;
use crate::sink::ObjectStore;
use crate::stream::{ByteCounter, Fetcher};
use crate::work_source::WorkSource;

/// Monotonic counters for the run summary
#[derive(Debug, Default)]
pub struct RunCounters {
    pub records_archived: AtomicU64,
    pub bytes_archived: AtomicU64,
    pub shards_committed: AtomicU64,
    pub commit_failures: AtomicU64,
    pub requeued: AtomicU64,
}

/// Shared pipeline state: channels, counters, sink and stop signal.
pub struct Pipeline {
    pub config: Config,
    pub work: Arc<WorkSource>,
    pub store: Arc<dyn ObjectStore>,
    pub fetcher: Fetcher,
    pub sequence: ShardSequence,
    pub bandwidth: ByteCounter,
    pub counters: RunCounters,
    items_tx: Sender<FetchedRecord>,
    items_rx: Receiver<FetchedRecord>,
    open_shards: AtomicUsize,
    unarchived: AtomicUsize,
    stop: StopSignal,
    fatal: Mutex<Option<String>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("in_flight", &self.work.in_flight())
            .field("unarchived", &self.unarchived())
            .field("open_shards", &self.open_shards())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: Config, store: Arc<dyn ObjectStore>) -> Result<Self, FetchError> {
        let stop = StopSignal::new();
        let bandwidth = ByteCounter::default();
        let fetcher = Fetcher::new(&config.http, config.fetch_workers, bandwidth.clone())?;
        let (items_tx, items_rx) = channel::bounded(config.queue_capacity);
        Ok(Self {
            work: Arc::new(WorkSource::new(config.work_capacity, stop.clone())),
            store,
            fetcher,
            sequence: ShardSequence::new(),
            bandwidth,
            counters: RunCounters::default(),
            items_tx,
            items_rx,
            open_shards: AtomicUsize::new(0),
            unarchived: AtomicUsize::new(0),
            stop,
            fatal: Mutex::new(None),
            config,
        })
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Queue a fetched record for archiving, blocking while the queue is full.
    ///
    /// The record counts as unarchived from here until a worker appends it.
    /// Returns `false` if the run stopped first.
    pub fn enqueue(&self, record: FetchedRecord) -> bool {
        self.unarchived.fetch_add(1, Ordering::SeqCst);
        select! {
            send(self.items_tx, record) -> res => res.is_ok(),
            recv(self.stop.receiver()) -> _ => {
                self.unarchived.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn items(&self) -> &Receiver<FetchedRecord> {
        &self.items_rx
    }

    /// Records waiting in the queue
    pub fn queued(&self) -> usize {
        self.items_rx.len()
    }

    pub fn mark_archived(&self) {
        self.unarchived.fetch_sub(1, Ordering::SeqCst);
    }

    /// Fetched records not yet appended to a shard
    pub fn unarchived(&self) -> usize {
        self.unarchived.load(Ordering::SeqCst)
    }

    pub fn shard_opened(&self) {
        self.open_shards.fetch_add(1, Ordering::SeqCst);
    }

    pub fn shard_closed(&self) {
        self.open_shards.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn open_shards(&self) -> usize {
        self.open_shards.load(Ordering::SeqCst)
    }

    /// No locator is being fetched and every fetched record sits in a shard.
    ///
    /// Archiving workers close idle shards only in this state.
    pub fn is_drained(&self) -> bool {
        self.work.in_flight() == 0 && self.unarchived() == 0
    }

    /// Drained with no open shard: one poll's worth of quiescence.
    pub fn is_idle(&self) -> bool {
        self.open_shards() == 0 && self.is_drained()
    }

    /// Give the members of a shard whose commit failed back to the fetch pool.
    ///
    /// They are counted as in flight before this returns; the hand-over
    /// happens on a detached thread so the archiving worker never waits on
    /// the fetch pool.
    pub fn requeue(&self, members: Vec<String>) {
        if members.is_empty() {
            return;
        }
        let n = members.len();
        self.work.admit(n);
        self.counters.requeued.fetch_add(n as u64, Ordering::Relaxed);

        let work = self.work.clone();
        let spawned = std::thread::Builder::new()
            .name("requeue".into())
            .spawn(move || {
                for url in members {
                    work.deliver(url);
                }
            });
        if let Err(e) = spawned {
            log::error!("cannot spawn requeue thread ({e}), dropping {n} locators");
            for _ in 0..n {
                self.work.complete();
            }
        }
    }

    /// Abort the run after an unrecoverable archiving error.
    pub fn fail(&self, error: &ArchiveError) {
        log::error!("{error}");
        let mut fatal = self.fatal.lock().expect("fatal lock poisoned");
        if fatal.is_none() {
            *fatal = Some(error.to_string());
        }
        drop(fatal);
        self.stop.trigger();
    }

    /// First unrecoverable error, if the run was aborted
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().expect("fatal lock poisoned").clone()
    }

    pub fn is_failed(&self) -> bool {
        self.fatal_error().is_some()
    }
}
