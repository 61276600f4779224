//! Downloaded objects waiting to be archived

use std::collections::BTreeMap;

/// Metadata key holding the serialized request headers
pub const REQ_HEADERS_KEY: &str = "req_headers";
/// Metadata key holding the serialized response headers
pub const RESP_HEADERS_KEY: &str = "resp_headers";

/// A fully downloaded object plus its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    /// Archive entry name, derived from the locator
    pub name: String,
    /// Source locator, kept for re-queue on sink failure
    pub url: String,
    pub data: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

impl FetchedRecord {
    pub fn new(url: String, data: Vec<u8>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            name: entry_name(&url),
            url,
            data,
            metadata,
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Last path segment of a locator, trailing slashes ignored.
///
/// Names that cannot be stored as a tar path (`""`, `.`, `..`) become `_`.
pub fn entry_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or(trimmed);
    match base {
        "" | "." | ".." => "_".to_string(),
        _ => base.to_string(),
    }
}
