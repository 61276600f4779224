//! HTTP GET into memory with stall detection and byte counting.
//!
//! Uses async reqwest internally with tokio::time::timeout for stall detection,
//! but presents a sync interface for the fetch worker threads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderMap, USER_AGENT};

use crate::config::HttpConfig;
use crate::error::FetchError;
use crate::record::{FetchedRecord, REQ_HEADERS_KEY, RESP_HEADERS_KEY};

/// Upper bound for pre-allocating a body buffer from `Content-Length`
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Shared byte counter for bandwidth reporting
pub type ByteCounter = Arc<AtomicU64>;

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("tarfetch-http")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Downloads locators into [`FetchedRecord`]s.
///
/// One instance is shared by all fetch workers; the underlying client pools
/// connections across them.
pub struct Fetcher {
    client: reqwest::Client,
    user_agent: String,
    read_timeout: Duration,
    request_timeout: Option<Duration>,
    bandwidth: ByteCounter,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("read_timeout", &self.read_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn new(
        http: &HttpConfig,
        fetch_workers: usize,
        bandwidth: ByteCounter,
    ) -> Result<Self, FetchError> {
        let idle = http.pool_max_idle_per_host.unwrap_or(fetch_workers + 10);
        let client = reqwest::Client::builder()
            .connect_timeout(http.connect_timeout)
            .pool_max_idle_per_host(idle)
            .build()
            .map_err(|e| FetchError::from_reqwest(&e))?;
        Ok(Self {
            client,
            user_agent: http.user_agent.clone(),
            read_timeout: http.read_timeout,
            request_timeout: http.request_timeout,
            bandwidth,
        })
    }

    /// One GET attempt. Blocks the calling thread until the body is read.
    pub fn fetch(&self, url: &str) -> Result<FetchedRecord, FetchError> {
        SHARED_RUNTIME.handle().block_on(async {
            match self.request_timeout {
                Some(limit) => tokio::time::timeout(limit, self.fetch_async(url))
                    .await
                    .map_err(|_| {
                        FetchError::Timeout(format!(
                            "request exceeded {:.1}s",
                            limit.as_secs_f64()
                        ))
                    })?,
                None => self.fetch_async(url).await,
            }
        })
    }

    async fn fetch_async(&self, url: &str) -> Result<FetchedRecord, FetchError> {
        let request = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "*/*")
            .build()
            .map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        let req_headers = serialize_headers(request.headers());

        let mut response = self
            .client
            .execute(request)
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;

        if !response.status().is_success() {
            log::debug!("{url}: HTTP {}, keeping body", response.status().as_u16());
        }
        let resp_headers = serialize_headers(response.headers());

        let hint = response.content_length().unwrap_or(0).min(MAX_PREALLOC);
        let mut data = Vec::with_capacity(hint as usize);
        loop {
            let chunk = tokio::time::timeout(self.read_timeout, response.chunk())
                .await
                .map_err(|_| {
                    FetchError::Timeout(format!(
                        "no data for {:.1}s",
                        self.read_timeout.as_secs_f64()
                    ))
                })?
                .map_err(|e| FetchError::Read(e.to_string()))?;
            let Some(bytes) = chunk else { break };
            self.bandwidth
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            data.extend_from_slice(&bytes);
        }

        let mut metadata = BTreeMap::new();
        metadata.insert(REQ_HEADERS_KEY.to_string(), req_headers);
        metadata.insert(RESP_HEADERS_KEY.to_string(), resp_headers);
        Ok(FetchedRecord::new(url.to_string(), data, metadata))
    }
}

/// Serialize headers as a JSON object of canonical name → list of values.
pub fn serialize_headers(headers: &HeaderMap) -> String {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(canonical_header_name(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

/// `content-type` → `Content-Type`
fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper = c == '-';
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-amz-request-id"), "X-Amz-Request-Id");
        assert_eq!(canonical_header_name("etag"), "Etag");
    }

    #[test]
    fn serialize_headers_groups_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));

        let json = serialize_headers(&headers);
        let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["Content-Type"], vec!["text/plain"]);
        assert_eq!(parsed["Set-Cookie"], vec!["a=1", "b=2"]);
    }

    #[test]
    fn serialize_empty_headers() {
        assert_eq!(serialize_headers(&HeaderMap::new()), "{}");
    }

    #[test]
    fn fetch_unparseable_url_is_not_retryable() {
        let fetcher = Fetcher::new(&HttpConfig::default(), 1, ByteCounter::default()).unwrap();
        let err = fetcher.fetch("not a url").unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)), "got {err:?}");
        assert!(!err.is_retryable());
    }
}
