//! Locator distribution, in-flight accounting and the failure set

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use rustc_hash::FxHashSet;

use crate::shutdown::StopSignal;

/// Hands locators to fetch workers and tracks their outcome.
///
/// Every admitted locator bumps the in-flight counter once; the fetch worker
/// that resolves it (record queued, or failure recorded) calls
/// [`complete`](WorkSource::complete) exactly once.
pub struct WorkSource {
    tx: Sender<String>,
    rx: Receiver<String>,
    in_flight: AtomicUsize,
    failures: Mutex<FxHashSet<String>>,
    stop: StopSignal,
}

impl WorkSource {
    /// `capacity` 0 makes every submission a rendezvous with a fetch worker.
    pub fn new(capacity: usize, stop: StopSignal) -> Self {
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx,
            rx,
            in_flight: AtomicUsize::new(0),
            failures: Mutex::new(FxHashSet::default()),
            stop,
        }
    }

    /// Admit one locator and block until a fetch worker can take it.
    ///
    /// Returns `false` if the run stopped before the locator was handed over.
    pub fn submit(&self, locator: String) -> bool {
        self.admit(1);
        self.deliver(locator)
    }

    /// Count `n` locators as in flight ahead of [`deliver`](WorkSource::deliver).
    pub fn admit(&self, n: usize) {
        self.in_flight.fetch_add(n, Ordering::SeqCst);
    }

    /// Hand an already admitted locator to the fetch pool.
    pub fn deliver(&self, locator: String) -> bool {
        select! {
            send(self.tx, locator) -> res => {
                if res.is_err() {
                    self.complete();
                }
                res.is_ok()
            }
            recv(self.stop.receiver()) -> _ => {
                self.complete();
                false
            }
        }
    }

    /// Channel fetch workers pull from
    pub fn receiver(&self) -> &Receiver<String> {
        &self.rx
    }

    /// A locator reached its terminal outcome
    pub fn complete(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Record a permanent failure. Returns `false` if already recorded.
    pub fn record_failure(&self, locator: &str) -> bool {
        self.failures
            .lock()
            .expect("failure set lock poisoned")
            .insert(locator.to_string())
    }

    /// Momentary snapshot of admitted-but-unresolved locators
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().expect("failure set lock poisoned").len()
    }

    /// Recorded failures, sorted for stable output
    pub fn failures(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .failures
            .lock()
            .expect("failure set lock poisoned")
            .iter()
            .cloned()
            .collect();
        out.sort_unstable();
        out
    }
}

impl std::fmt::Debug for WorkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkSource")
            .field("in_flight", &self.in_flight())
            .field("failures", &self.failure_count())
            .finish_non_exhaustive()
    }
}
