//! Pipeline configuration and size-string parsing

use std::path::PathBuf;
use std::time::Duration;

/// Default maximum shard size: 10 GiB
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 10 << 30;

/// Default PAX key namespace for per-entry provenance metadata
pub const DEFAULT_PAX_NAMESPACE: &str = "MISTYWARC.";

/// HTTP client settings for fetch workers
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Stall detection: no body bytes for this long fails the attempt
    pub read_timeout: Duration,
    /// Optional deadline for a whole request (headers + body)
    pub request_timeout: Option<Duration>,
    /// `User-Agent` sent with every request
    pub user_agent: String,
    /// Idle connections kept per host; `None` = fetch workers + 10
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            request_timeout: None,
            user_agent: concat!("tarfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            pool_max_idle_per_host: None,
        }
    }
}

/// Runtime configuration for one pipeline run
#[derive(Debug, Clone)]
pub struct Config {
    /// Input list, one locator per line
    pub input: PathBuf,
    /// Locators to leave out (e.g. a previous run's `_fails` file)
    pub skip_list: Option<PathBuf>,
    /// Fetch pool size
    pub fetch_workers: usize,
    /// Archiving pool size
    pub archive_workers: usize,
    /// Maximum cumulative payload bytes per shard
    pub max_shard_size: u64,
    /// Shard names are `<prefix><sequence>.tar`
    pub output_prefix: String,
    /// Capacity of the fetched-record queue between the pools
    pub queue_capacity: usize,
    /// Capacity of the locator channel feeding the fetch pool (0 = rendezvous)
    pub work_capacity: usize,
    /// Attempts per locator before it is recorded as failed
    pub fetch_attempts: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
    /// Archiving worker wakeup when no record arrives
    pub idle_timeout: Duration,
    /// Orchestrator quiescence poll period
    pub poll_interval: Duration,
    /// Consecutive idle polls that must be exceeded before shutdown
    pub idle_rounds: u32,
    /// Bandwidth report period
    pub report_interval: Duration,
    /// PAX key prefix for `req_headers` / `resp_headers`
    pub pax_namespace: String,
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            skip_list: None,
            fetch_workers: 64,
            archive_workers: 10,
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            output_prefix: String::new(),
            queue_capacity: 10,
            work_capacity: 0,
            fetch_attempts: 5,
            retry_delay: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            idle_rounds: 5,
            report_interval: Duration::from_secs(1),
            pax_namespace: DEFAULT_PAX_NAMESPACE.to_string(),
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.fetch_workers > 0, "fetch workers must be at least 1");
        anyhow::ensure!(
            self.archive_workers > 0,
            "archive workers must be at least 1"
        );
        anyhow::ensure!(self.fetch_attempts > 0, "fetch attempts must be at least 1");
        anyhow::ensure!(self.max_shard_size > 0, "max shard size must be positive");
        anyhow::ensure!(!self.idle_timeout.is_zero(), "idle timeout must be positive");
        anyhow::ensure!(!self.poll_interval.is_zero(), "poll interval must be positive");
        anyhow::ensure!(
            !self.report_interval.is_zero(),
            "report interval must be positive"
        );
        Ok(())
    }
}

/// Parse a size with an optional binary suffix.
///
/// Accepts `b`, `k`, `M`, `G`, `T`, `P` (case-insensitive, optionally followed
/// by `i` or `iB`). A bare number is KiB. `off` means unlimited.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("off") {
        return Ok(u64::MAX);
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    if num.is_empty() {
        return Err(format!("invalid size: {s:?}"));
    }
    let value: f64 = num.parse().map_err(|_| format!("invalid size: {s:?}"))?;

    let unit = suffix
        .strip_suffix("iB")
        .or_else(|| suffix.strip_suffix('i'))
        .unwrap_or(suffix);
    let shift = match unit.to_ascii_lowercase().as_str() {
        "" | "k" => 10,
        "b" => 0,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        "p" => 50,
        _ => return Err(format!("unknown size suffix {suffix:?} in {s:?}")),
    };

    let bytes = value * (1u64 << shift) as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(format!("size out of range: {s:?}"));
    }
    Ok(bytes as u64)
}

/// Render a byte count with binary units (e.g. `1.5 GiB`).
pub fn fmt_bytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if n < 1024 {
        return format!("{n} B");
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
