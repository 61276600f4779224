//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Settings file for tarfetch; every section is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub http: HttpConfig,
    pub store: StoreConfig,
}

/// Pipeline tunables not covered by positional arguments
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Fetched-record queue capacity between the pools
    pub queue: usize,
    /// Attempts per locator
    pub fetch_attempts: u32,
    /// Pause between attempts (seconds)
    pub retry_delay: f64,
    /// Archiver idle wakeup (seconds)
    pub idle_timeout: f64,
    /// Quiescence poll period (seconds)
    pub poll_interval: f64,
    /// Idle polls to exceed before shutdown
    pub idle_rounds: u32,
    /// Bandwidth report period (seconds)
    pub report_interval: f64,
    /// PAX key prefix for header metadata
    pub pax_namespace: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let core = tarfetch_core::Config::default();
        Self {
            queue: core.queue_capacity,
            fetch_attempts: core.fetch_attempts,
            retry_delay: core.retry_delay.as_secs_f64(),
            idle_timeout: core.idle_timeout.as_secs_f64(),
            poll_interval: core.poll_interval.as_secs_f64(),
            idle_rounds: core.idle_rounds,
            report_interval: core.report_interval.as_secs_f64(),
            pax_namespace: core.pax_namespace,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Connect timeout (seconds)
    pub connect_timeout: u64,
    /// Stall timeout: no body bytes for this long fails the attempt (seconds)
    pub read_timeout: u64,
    /// Deadline for a whole request (seconds, unset = none)
    pub request_timeout: Option<u64>,
    pub user_agent: String,
    /// Idle connections kept per host (unset = fetch workers + 10)
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let core = tarfetch_core::HttpConfig::default();
        Self {
            connect_timeout: core.connect_timeout.as_secs(),
            read_timeout: core.read_timeout.as_secs(),
            request_timeout: None,
            user_agent: core.user_agent,
            pool_max_idle_per_host: None,
        }
    }
}

/// Where shards go: a local directory, or an external upload command
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// e.g. `rclone rcat remote:bucket/{name}`; takes precedence over `dir`
    #[serde(deserialize_with = "deserialize_env_var")]
    pub write_cmd: Option<String>,
    /// e.g. `rclone cat remote:bucket/{name}`, used by `inspect`
    #[serde(deserialize_with = "deserialize_env_var")]
    pub read_cmd: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            write_cmd: None,
            read_cmd: None,
        }
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    opt.map(|s| expand_env_var(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Expand every `${VAR}` in `s`; an unset variable is an error.
fn expand_env_var(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated ${{ in \"{s}\""))?;
        let name = &after[..end];
        let value = std::env::var(name)
            .map_err(|_| format!("environment variable {name} is not set"))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn secs(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {what}: {value}"))
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./tarfetch.toml (current directory)
    /// 2. ~/.config/tarfetch/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("tarfetch.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "tarfetch") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Pipeline config with this file's settings; run arguments fill the rest.
    pub fn to_core(&self) -> Result<tarfetch_core::Config> {
        let p = &self.pipeline;
        let h = &self.http;
        let http = tarfetch_core::HttpConfig {
            connect_timeout: Duration::from_secs(h.connect_timeout),
            read_timeout: Duration::from_secs(h.read_timeout),
            request_timeout: h.request_timeout.map(Duration::from_secs),
            user_agent: h.user_agent.clone(),
            pool_max_idle_per_host: h.pool_max_idle_per_host,
        };
        Ok(tarfetch_core::Config {
            queue_capacity: p.queue,
            fetch_attempts: p.fetch_attempts,
            retry_delay: secs(p.retry_delay, "retry_delay")?,
            idle_timeout: secs(p.idle_timeout, "idle_timeout")?,
            poll_interval: secs(p.poll_interval, "poll_interval")?,
            idle_rounds: p.idle_rounds,
            report_interval: secs(p.report_interval, "report_interval")?,
            pax_namespace: p.pax_namespace.clone(),
            http,
            ..Default::default()
        })
    }
}
