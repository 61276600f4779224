//! Locator lists: the input file, the skip list and the failure file

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use rustc_hash::FxHashSet;

/// Suffix appended to the input path for the failure file
pub const FAILS_SUFFIX: &str = "_fails";

/// One decoded input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Locator(String),
    Blank,
    Malformed(String),
}

/// Decode one input line.
///
/// Lines starting with `"` are JSON string literals; anything else is the
/// locator verbatim (surrounding whitespace trimmed).
pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Blank;
    }
    if !line.starts_with('"') {
        return LineOutcome::Locator(line.to_string());
    }
    match serde_json::from_str::<String>(line) {
        Ok(s) if s.is_empty() => LineOutcome::Blank,
        Ok(s) => LineOutcome::Locator(s),
        Err(e) => LineOutcome::Malformed(e.to_string()),
    }
}

/// `<input>_fails`
pub fn fails_path(input: &Path) -> PathBuf {
    let mut s = input.as_os_str().to_os_string();
    s.push(FAILS_SUFFIX);
    PathBuf::from(s)
}

/// Open an input list for line-by-line reading.
pub fn open_lines(path: &Path) -> anyhow::Result<io::Lines<BufReader<File>>> {
    let file =
        File::open(path).with_context(|| format!("Cannot open input {}", path.display()))?;
    Ok(BufReader::new(file).lines())
}

/// Load every locator of a list, ignoring blank and malformed lines.
pub fn load_locators(path: &Path) -> anyhow::Result<FxHashSet<String>> {
    let mut out = FxHashSet::default();
    for (idx, line) in open_lines(path)?.enumerate() {
        let line = line.with_context(|| format!("{}: read failed", path.display()))?;
        match parse_line(&line) {
            LineOutcome::Locator(loc) => {
                out.insert(loc);
            }
            LineOutcome::Blank => {}
            LineOutcome::Malformed(e) => {
                log::warn!("{}:{}: skipping malformed line: {e}", path.display(), idx + 1);
            }
        }
    }
    Ok(out)
}

/// Write locators one per line, atomically (tmp file + rename).
pub fn write_failures(path: &Path, failures: &[String]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut w = BufWriter::new(File::create(&tmp)?);
        for loc in failures {
            writeln!(w, "{loc}")?;
        }
        w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
