//! End-to-end runs against a local HTTP origin
//!
//! Each test starts a wiremock server on its own runtime and drives a full
//! `tarfetch_core::run` with shrunk timings.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tarfetch_core::{
    Config, LocalStore, ObjectStore, ProgressContext, RunSummary, ShardWriter, fails_path,
};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

struct Origin {
    server: MockServer,
    rt: Runtime,
}

impl Origin {
    fn start() -> Self {
        let rt = Runtime::new().unwrap();
        let server = rt.block_on(MockServer::start());
        Self { server, rt }
    }

    fn serve(&self, route: &str, status: u16, body: &[u8]) {
        self.rt.block_on(
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(status).set_body_bytes(body.to_vec()))
                .mount(&self.server),
        );
    }

    fn serve_slow(&self, route: &str, delay: Duration) {
        self.rt.block_on(
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(200).set_delay(delay))
                .mount(&self.server),
        );
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.server.uri())
    }

    fn hits(&self, route: &str) -> usize {
        self.rt
            .block_on(self.server.received_requests())
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == route)
            .count()
    }
}

/// A URL on a local port nothing listens on
fn closed_port_url(route: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}{route}")
}

fn write_input(dir: &TempDir, lines: &[String]) -> PathBuf {
    let input = dir.path().join("urls.txt");
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(&input, body).unwrap();
    input
}

fn fast_config(input: PathBuf, prefix: &str) -> Config {
    let mut config = Config {
        input,
        fetch_workers: 4,
        archive_workers: 1,
        max_shard_size: 1 << 20,
        output_prefix: prefix.to_string(),
        retry_delay: Duration::from_millis(10),
        idle_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
        idle_rounds: 3,
        report_interval: Duration::from_millis(50),
        ..Default::default()
    };
    config.http.read_timeout = Duration::from_secs(5);
    config
}

fn run(config: &Config, store: Arc<dyn ObjectStore>) -> anyhow::Result<RunSummary> {
    tarfetch_core::run(config, store, &ProgressContext::with_tty(false))
}

/// Committed shards in `dir`: name → [(entry name, payload, pax attributes)]
type Entries = Vec<(String, Vec<u8>, BTreeMap<String, String>)>;

fn read_shards(dir: &Path) -> BTreeMap<String, Entries> {
    let mut out = BTreeMap::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_none_or(|e| e != "tar") {
            continue;
        }
        let mut archive = tar::Archive::new(std::fs::File::open(&path).unwrap());
        let mut entries = Vec::new();
        for e in archive.entries().unwrap() {
            let mut e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().into_owned();
            let pax = match e.pax_extensions().unwrap() {
                Some(exts) => exts
                    .map(|x| {
                        let x = x.unwrap();
                        (x.key().unwrap().to_string(), x.value().unwrap().to_string())
                    })
                    .collect(),
                None => BTreeMap::new(),
            };
            let mut body = Vec::new();
            e.read_to_end(&mut body).unwrap();
            entries.push((name, body, pax));
        }
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        out.insert(name, entries);
    }
    out
}

fn read_fails(input: &Path) -> Vec<String> {
    std::fs::read_to_string(fails_path(input))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn quoted_and_raw_lines_land_in_one_shard() {
    let origin = Origin::start();
    origin.serve("/alpha", 200, b"first payload");
    origin.serve("/beta", 200, b"second");
    let gone = closed_port_url("/gone");

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let input = write_input(
        &dir,
        &[
            serde_json::to_string(&origin.url("/alpha")).unwrap(),
            origin.url("/beta"),
            gone.clone(),
        ],
    );
    let config = fast_config(input.clone(), "e2e-");
    let store = Arc::new(LocalStore::new(&out).unwrap());

    let summary = run(&config, store).unwrap();

    let shards = read_shards(&out);
    assert_eq!(shards.keys().collect::<Vec<_>>(), ["e2e-1.tar"]);
    let mut entries: Vec<(String, Vec<u8>)> = shards["e2e-1.tar"]
        .iter()
        .map(|(n, b, _)| (n.clone(), b.clone()))
        .collect();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("alpha".to_string(), b"first payload".to_vec()),
            ("beta".to_string(), b"second".to_vec()),
        ]
    );

    let pax = &shards["e2e-1.tar"][0].2;
    assert!(pax["MISTYWARC.req_headers"].contains("User-Agent"));
    assert!(pax.contains_key("MISTYWARC.resp_headers"));

    assert_eq!(read_fails(&input), vec![gone]);
    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.records_archived, 2);
    assert_eq!(summary.shards_committed, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.interrupted);
}

#[test]
fn error_status_is_archived_not_failed() {
    let origin = Origin::start();
    origin.serve("/missing", 404, b"not here");

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let input = write_input(&dir, &[origin.url("/missing")]);
    let config = fast_config(input.clone(), "s-");

    let summary = run(&config, Arc::new(LocalStore::new(&out).unwrap())).unwrap();

    let shards = read_shards(&out);
    assert_eq!(shards["s-1.tar"][0].1, b"not here");
    assert!(read_fails(&input).is_empty());
    assert_eq!(summary.failed, 0);
    assert_eq!(origin.hits("/missing"), 1);
}

#[test]
fn exhausted_retries_fail_once_after_five_attempts() {
    let origin = Origin::start();
    origin.serve_slow("/slow", Duration::from_secs(5));

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let url = origin.url("/slow");
    let input = write_input(&dir, &[url.clone()]);
    let mut config = fast_config(input.clone(), "r-");
    config.http.request_timeout = Some(Duration::from_millis(100));

    let summary = run(&config, Arc::new(LocalStore::new(&out).unwrap())).unwrap();

    assert_eq!(origin.hits("/slow"), 5);
    assert_eq!(read_fails(&input), vec![url]);
    assert!(read_shards(&out).is_empty());
    assert_eq!(summary.records_archived, 0);
    assert_eq!(summary.shards_committed, 0);
}

#[test]
fn multi_member_shards_respect_the_size_limit() {
    let origin = Origin::start();
    let mut lines = Vec::new();
    for i in 0..7 {
        let route = format!("/r{i}");
        origin.serve(&route, 200, &[b'x'; 40]);
        lines.push(origin.url(&route));
    }
    origin.serve("/big", 200, &[b'y'; 250]);
    lines.push(origin.url("/big"));

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let input = write_input(&dir, &lines);
    let mut config = fast_config(input, "z-");
    config.max_shard_size = 100;
    config.archive_workers = 2;

    let summary = run(&config, Arc::new(LocalStore::new(&out).unwrap())).unwrap();

    let shards = read_shards(&out);
    let mut names = Vec::new();
    for entries in shards.values() {
        let size: usize = entries.iter().map(|(_, b, _)| b.len()).sum();
        if entries.len() > 1 {
            assert!(size <= 100, "shard holds {size} bytes");
        }
        names.extend(entries.iter().map(|(n, _, _)| n.clone()));
    }
    names.sort();
    assert_eq!(names, ["big", "r0", "r1", "r2", "r3", "r4", "r5", "r6"]);
    assert_eq!(summary.records_archived, 8);
    assert_eq!(summary.shards_committed as usize, shards.len());
}

/// Local store whose first `fail_first` commits fail
struct FlakyStore {
    inner: LocalStore,
    fail_first: usize,
    commits: Arc<Mutex<Vec<(String, bool)>>>,
    attempts: Arc<AtomicUsize>,
}

struct FlakyWriter {
    inner: Box<dyn ShardWriter>,
    name: String,
    fail: bool,
    commits: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Write for FlakyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl ShardWriter for FlakyWriter {
    fn commit(self: Box<Self>) -> io::Result<()> {
        self.commits
            .lock()
            .unwrap()
            .push((self.name.clone(), !self.fail));
        if self.fail {
            // inner writer dropped uncommitted
            return Err(io::Error::other("upload rejected"));
        }
        self.inner.commit()
    }
}

impl ObjectStore for FlakyStore {
    fn open_write(&self, name: &str) -> io::Result<Box<dyn ShardWriter>> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FlakyWriter {
            inner: self.inner.open_write(name)?,
            name: name.to_string(),
            fail: n < self.fail_first,
            commits: self.commits.clone(),
        }))
    }

    fn read(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        self.inner.read(name)
    }
}

#[test]
fn failed_commit_requeues_members_under_the_same_name() {
    let origin = Origin::start();
    let mut lines = Vec::new();
    for name in ["a", "b", "c"] {
        let route = format!("/{name}");
        origin.serve(&route, 200, name.as_bytes());
        lines.push(origin.url(&route));
    }

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let input = write_input(&dir, &lines);
    let config = fast_config(input.clone(), "f-");
    let commits = Arc::new(Mutex::new(Vec::new()));
    let store = FlakyStore {
        inner: LocalStore::new(&out).unwrap(),
        fail_first: 1,
        commits: commits.clone(),
        attempts: Arc::new(AtomicUsize::new(0)),
    };

    let summary = run(&config, Arc::new(store)).unwrap();

    assert_eq!(
        *commits.lock().unwrap(),
        vec![("f-1.tar".to_string(), false), ("f-1.tar".to_string(), true)]
    );
    let shards = read_shards(&out);
    let mut names: Vec<&str> = shards["f-1.tar"].iter().map(|(n, _, _)| n.as_str()).collect();
    names.sort();
    assert_eq!(names, ["a", "b", "c"]);
    assert_eq!(shards.len(), 1);
    assert!(read_fails(&input).is_empty());

    assert_eq!(summary.commit_failures, 1);
    assert_eq!(summary.requeued, 3);
    assert_eq!(summary.records_archived, 3);
    for route in ["/a", "/b", "/c"] {
        assert_eq!(origin.hits(route), 2, "{route} fetched twice");
    }
}

#[test]
fn every_locator_is_archived_or_failed_exactly_once() {
    let origin = Origin::start();
    let mut ok = Vec::new();
    for i in 0..12 {
        let route = format!("/ok{i}");
        origin.serve(&route, 200, format!("body {i}").as_bytes());
        ok.push(origin.url(&route));
    }
    let bad: Vec<String> = (0..3).map(|i| closed_port_url(&format!("/bad{i}"))).collect();

    let mut lines = ok.clone();
    lines.extend(bad.iter().cloned());
    lines.insert(5, String::new());
    lines.insert(2, r#""broken"#.to_string());

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let input = write_input(&dir, &lines);
    let mut config = fast_config(input.clone(), "q-");
    config.fetch_workers = 6;
    config.archive_workers = 3;
    config.max_shard_size = 24;

    let summary = run(&config, Arc::new(LocalStore::new(&out).unwrap())).unwrap();

    let mut archived: Vec<String> = read_shards(&out)
        .into_values()
        .flatten()
        .map(|(n, _, _)| n)
        .collect();
    archived.sort();
    let mut expected: Vec<String> = (0..12).map(|i| format!("ok{i}")).collect();
    expected.sort();
    assert_eq!(archived, expected);

    let mut fails = read_fails(&input);
    fails.sort();
    let mut bad_sorted = bad.clone();
    bad_sorted.sort();
    assert_eq!(fails, bad_sorted);

    assert_eq!(summary.submitted, 15);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.records_archived, 12);
    assert_eq!(summary.failed, 3);
}

#[test]
fn skip_list_locators_are_not_fetched() {
    let origin = Origin::start();
    origin.serve("/keep", 200, b"k");
    origin.serve("/drop", 200, b"d");

    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let input = write_input(&dir, &[origin.url("/keep"), origin.url("/drop")]);
    let skip = dir.path().join("previous_fails");
    std::fs::write(&skip, format!("{}\n", origin.url("/drop"))).unwrap();

    let mut config = fast_config(input, "k-");
    config.skip_list = Some(skip);
    let summary = run(&config, Arc::new(LocalStore::new(&out).unwrap())).unwrap();

    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(origin.hits("/drop"), 0);
    assert_eq!(origin.hits("/keep"), 1);
}

/// Store whose writes always fail
struct BrokenDisk;

struct BrokenWriter;

impl Write for BrokenWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::other("disk full"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ShardWriter for BrokenWriter {
    fn commit(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

impl ObjectStore for BrokenDisk {
    fn open_write(&self, _name: &str) -> io::Result<Box<dyn ShardWriter>> {
        Ok(Box::new(BrokenWriter))
    }

    fn read(&self, _name: &str) -> io::Result<Box<dyn Read + Send>> {
        Err(io::Error::from(io::ErrorKind::NotFound))
    }
}

#[test]
fn encoding_failure_aborts_the_run() {
    let origin = Origin::start();
    origin.serve("/x", 200, b"payload");

    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, &[origin.url("/x")]);
    let config = fast_config(input.clone(), "b-");

    let err = run(&config, Arc::new(BrokenDisk)).unwrap_err();
    assert!(err.to_string().contains("tar encoding failed"), "{err:#}");
    assert!(!fails_path(&input).exists());
}

#[test]
fn missing_input_fails_before_start() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path().join("absent.txt"), "m-");
    let err = run(&config, Arc::new(LocalStore::new(dir.path()).unwrap())).unwrap_err();
    assert!(err.to_string().contains("Cannot open input"));
}
