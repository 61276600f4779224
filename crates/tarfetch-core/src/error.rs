//! Error types for fetch attempts and shard archiving

use std::io;

/// Failure of a single fetch attempt.
///
/// Only transport and body-read problems are errors: a response with a
/// non-success status is still a successful fetch.
#[derive(Debug)]
pub enum FetchError {
    /// The locator cannot be turned into a request (unparseable URL)
    InvalidUrl(String),
    /// Request could not be sent (DNS, connect, TLS, redirect loop)
    Transport(String),
    /// Body stream broke after the response headers arrived
    Read(String),
    /// No body bytes within the stall timeout, or request deadline exceeded
    Timeout(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(msg) => write!(f, "invalid url: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Read(msg) => write!(f, "read error: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Read(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }

    /// A bad locator fails the same way every time; everything else may be transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidUrl(_))
    }
}

/// Failure while building or storing a shard
#[derive(Debug)]
pub enum ArchiveError {
    /// Sink refused to open a write for the shard
    Open { name: String, source: io::Error },
    /// Writing a tar header or payload, or finishing the archive, failed.
    /// The archive structure can no longer be trusted.
    Encode { name: String, source: io::Error },
    /// The durable commit of a finished shard failed
    Commit { name: String, source: io::Error },
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { name, source } => write!(f, "{name}: cannot open sink: {source}"),
            Self::Encode { name, source } => write!(f, "{name}: tar encoding failed: {source}"),
            Self::Commit { name, source } => write!(f, "{name}: sink commit failed: {source}"),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } | Self::Encode { source, .. } | Self::Commit { source, .. } => {
                Some(source)
            }
        }
    }
}

impl ArchiveError {
    /// Only a failed commit is recovered (by re-queueing the shard's members);
    /// everything else aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Commit { .. })
    }
}
