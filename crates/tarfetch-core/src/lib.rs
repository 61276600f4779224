//! tarfetch core - bulk HTTP fetching into size-bounded tar shards
//!
//! A work source feeds locators to a pool of fetch workers; fetched records
//! pass through a bounded queue to a pool of archiving workers, each writing
//! one tar shard at a time into an [`ObjectStore`]. Shards whose commit fails
//! are rebuilt from re-fetched members under the same name.

pub mod archiver;
pub mod config;
pub mod error;
pub mod fetch;
pub mod input;
pub mod logging;
pub mod monitor;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod retry;
pub mod runner;
pub mod shard;
pub mod shutdown;
pub mod sink;
pub mod stats;
pub mod stream;
pub mod work_source;

// Re-exports for convenience
pub use config::{Config, DEFAULT_MAX_SHARD_SIZE, DEFAULT_PAX_NAMESPACE, HttpConfig, fmt_bytes, parse_size};
pub use error::{ArchiveError, FetchError};
pub use input::{LineOutcome, fails_path, parse_line};
pub use logging::{IndicatifLogger, init_logging};
pub use pipeline::Pipeline;
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use record::{FetchedRecord, REQ_HEADERS_KEY, RESP_HEADERS_KEY};
pub use runner::run;
pub use shard::{SHARD_EXTENSION, shard_name};
pub use shutdown::{StopSignal, is_shutdown_requested, request_shutdown, shutdown_flag};
pub use sink::{CommandStore, LocalStore, ObjectStore, ShardWriter, cleanup_tmp_files};
pub use stats::RunSummary;
pub use stream::{ByteCounter, Fetcher, SHARED_RUNTIME};
