//! Fetch pool worker: locator → FetchedRecord, with fixed-delay retries

use crossbeam::select;

use crate::pipeline::Pipeline;
use crate::retry::retry_fixed;

/// Pull locators until the run stops.
///
/// Each locator resolves exactly once: its record is queued for archiving,
/// or, after the last attempt fails, it is recorded as a permanent failure.
pub fn run_fetch_worker(pipeline: &Pipeline, worker_id: usize) {
    let stop = pipeline.stop_signal();
    let config = &pipeline.config;
    log::debug!("fetch worker {worker_id} started");

    loop {
        let next = select! {
            recv(pipeline.work.receiver()) -> msg => msg.ok(),
            recv(stop.receiver()) -> _ => None,
        };
        let Some(locator) = next else { break };

        let result = retry_fixed(
            &locator,
            config.fetch_attempts,
            config.retry_delay,
            stop,
            || pipeline.fetcher.fetch(&locator),
        );

        match result {
            Ok(record) => {
                log::debug!("{locator}: fetched {} bytes", record.len());
                let queued = pipeline.enqueue(record);
                pipeline.work.complete();
                if !queued {
                    break;
                }
            }
            Err(e) if stop.is_triggered() => {
                log::debug!("{locator}: abandoned on shutdown: {e}");
                pipeline.work.complete();
                break;
            }
            Err(e) => {
                log::warn!("failed to download {locator}: {e}");
                pipeline.work.record_failure(&locator);
                pipeline.work.complete();
            }
        }
    }

    log::debug!("fetch worker {worker_id} stopped");
}
