//! Storage sinks that finished shards are streamed to
//!
//! A shard is written sequentially through a [`ShardWriter`] and made durable
//! by [`ShardWriter::commit`]. Dropping a writer without committing abandons
//! the object.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Placeholder substituted with the object name in command templates
pub const NAME_PLACEHOLDER: &str = "{name}";

/// Buffer size for local shard files (1MB)
const LOCAL_BUF_SIZE: usize = 1024 * 1024;

/// Streaming write of one object.
pub trait ShardWriter: Write + Send {
    /// Flush and durably commit the object. Errors mean the object must be
    /// considered lost.
    fn commit(self: Box<Self>) -> io::Result<()>;
}

/// Durable object storage the pipeline streams shards into.
pub trait ObjectStore: Send + Sync {
    /// Begin a streaming write; an existing object with the same name is
    /// replaced on commit.
    fn open_write(&self, name: &str) -> io::Result<Box<dyn ShardWriter>>;

    /// Stream an object back.
    fn read(&self, name: &str) -> io::Result<Box<dyn Read + Send>>;
}

// =============================================================================
// Local directory
// =============================================================================

/// Shards as files in a directory, with atomic tmp → rename on commit
#[derive(Debug)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ObjectStore for LocalStore {
    fn open_write(&self, name: &str) -> io::Result<Box<dyn ShardWriter>> {
        let final_path = self.dir.join(name);
        let tmp_path = self.dir.join(format!("{name}.tmp"));
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Clean up stale tmp file
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let file = File::create(&tmp_path)?;
        Ok(Box::new(LocalWriter {
            file: Some(BufWriter::with_capacity(LOCAL_BUF_SIZE, file)),
            tmp_path,
            final_path,
            committed: false,
        }))
    }

    fn read(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.dir.join(name))?))
    }
}

struct LocalWriter {
    file: Option<BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl LocalWriter {
    fn file(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("shard writer already committed"))
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl ShardWriter for LocalWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("shard writer already committed"))?;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&self.tmp_path, &self.final_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Remove stale .tmp files in the output directory
pub fn cleanup_tmp_files(output_dir: &Path) -> io::Result<()> {
    if !output_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("Removing stale tmp file: {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// =============================================================================
// External command
// =============================================================================

/// Shards streamed through the stdin of an external uploader.
///
/// Templates are whitespace-separated argv with `{name}` substituted, e.g.
/// `rclone rcat remote:bucket/{name}`. The commit succeeds when the command
/// exits successfully after stdin is closed.
#[derive(Debug, Clone)]
pub struct CommandStore {
    write_template: String,
    read_template: Option<String>,
}

impl CommandStore {
    pub fn new(write_template: &str, read_template: Option<&str>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            write_template.contains(NAME_PLACEHOLDER),
            "write command must contain {NAME_PLACEHOLDER}: {write_template:?}"
        );
        if let Some(t) = read_template {
            anyhow::ensure!(
                t.contains(NAME_PLACEHOLDER),
                "read command must contain {NAME_PLACEHOLDER}: {t:?}"
            );
        }
        Ok(Self {
            write_template: write_template.to_string(),
            read_template: read_template.map(str::to_string),
        })
    }

    fn command(template: &str, name: &str) -> io::Result<Command> {
        let mut argv = render_template(template, name).into_iter();
        let program = argv
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command template"))?;
        let mut cmd = Command::new(program);
        cmd.args(argv);
        Ok(cmd)
    }
}

/// Split a template into argv and substitute the object name.
pub fn render_template(template: &str, name: &str) -> Vec<String> {
    template
        .split_whitespace()
        .map(|arg| arg.replace(NAME_PLACEHOLDER, name))
        .collect()
}

impl ObjectStore for CommandStore {
    fn open_write(&self, name: &str) -> io::Result<Box<dyn ShardWriter>> {
        let mut child = Self::command(&self.write_template, name)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        let stdin = child.stdin.take();
        Ok(Box::new(CommandWriter {
            child,
            stdin,
            name: name.to_string(),
            broken: None,
            committed: false,
        }))
    }

    fn read(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        let template = self.read_template.as_deref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "no read command configured")
        })?;
        let mut child = Self::command(template, name)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdout = child.stdout.take();
        Ok(Box::new(CommandReader { child, stdout }))
    }
}

struct CommandWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    name: String,
    /// Pipe error from an uploader that went away mid-stream
    broken: Option<io::Error>,
    committed: bool,
}

impl CommandWriter {
    /// An uploader that exits early is a failed commit, not a broken archive:
    /// remember the pipe error, discard the rest and report it from `commit`.
    fn pipe_result<T>(&mut self, res: io::Result<T>, ok: T) -> io::Result<T> {
        match res {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.stdin.take();
                self.broken = Some(e);
                Ok(ok)
            }
            other => other,
        }
    }
}

impl Write for CommandWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(buf.len());
        };
        let res = stdin.write(buf);
        self.pipe_result(res, buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        let res = stdin.flush();
        self.pipe_result(res, ())
    }
}

impl ShardWriter for CommandWriter {
    fn commit(mut self: Box<Self>) -> io::Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let res = stdin.flush();
            drop(stdin);
            if let Err(e) = res {
                self.broken.get_or_insert(e);
            }
        }
        let status = self.child.wait()?;
        self.committed = true;
        if let Some(e) = self.broken.take() {
            return Err(io::Error::new(
                e.kind(),
                format!("uploader for {} stopped reading: {e}", self.name),
            ));
        }
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "uploader for {} exited with {status}",
                self.name
            )))
        }
    }
}

impl Drop for CommandWriter {
    fn drop(&mut self) {
        if !self.committed {
            // kill before closing stdin so the uploader never sees a clean EOF
            let _ = self.child.kill();
            self.stdin.take();
            let _ = self.child.wait();
        }
    }
}

struct CommandReader {
    child: Child,
    stdout: Option<ChildStdout>,
}

impl Read for CommandReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stdout.as_mut() {
            Some(out) => out.read(buf),
            None => Ok(0),
        }
    }
}

impl Drop for CommandReader {
    fn drop(&mut self) {
        self.stdout.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_commit_renames_tmp() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();

        let mut w = store.open_write("p1.tar").unwrap();
        w.write_all(b"payload").unwrap();
        assert!(dir.path().join("p1.tar.tmp").exists());
        assert!(!dir.path().join("p1.tar").exists());
        w.commit().unwrap();

        assert!(!dir.path().join("p1.tar.tmp").exists());
        assert_eq!(std::fs::read(dir.path().join("p1.tar")).unwrap(), b"payload");
    }

    #[test]
    fn local_drop_without_commit_abandons() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        {
            let mut w = store.open_write("p2.tar").unwrap();
            w.write_all(b"partial").unwrap();
        }
        assert!(!dir.path().join("p2.tar.tmp").exists());
        assert!(!dir.path().join("p2.tar").exists());
    }

    #[test]
    fn local_commit_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("p3.tar"), b"old").unwrap();

        let mut w = store.open_write("p3.tar").unwrap();
        w.write_all(b"new").unwrap();
        w.commit().unwrap();

        let mut back = String::new();
        store
            .read("p3.tar")
            .unwrap()
            .read_to_string(&mut back)
            .unwrap();
        assert_eq!(back, "new");
    }

    #[test]
    fn local_prefix_with_subdirectory() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        let mut w = store.open_write("batch/part-1.tar").unwrap();
        w.write_all(b"x").unwrap();
        w.commit().unwrap();
        assert!(dir.path().join("batch/part-1.tar").exists());
    }

    #[test]
    fn cleanup_tmp_files_removes_only_tmp() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.tar.tmp"), b"stale").unwrap();
        std::fs::write(dir.path().join("b.tar"), b"keep").unwrap();

        cleanup_tmp_files(dir.path()).unwrap();

        assert!(!dir.path().join("a.tar.tmp").exists());
        assert!(dir.path().join("b.tar").exists());
    }

    #[test]
    fn render_template_substitutes_name() {
        assert_eq!(
            render_template("rclone rcat remote:bucket/{name}", "p7.tar"),
            vec!["rclone", "rcat", "remote:bucket/p7.tar"]
        );
    }

    #[test]
    fn command_store_requires_placeholder() {
        assert!(CommandStore::new("rclone rcat remote:bucket/", None).is_err());
        assert!(CommandStore::new("cat", Some("cat {name}")).is_err());
        assert!(CommandStore::new("tee {name}", None).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn command_store_streams_through_stdin() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("{name}");
        let store = CommandStore::new(
            &format!("tee {}", target.display()),
            Some(&format!("cat {}", target.display())),
        )
        .unwrap();

        let mut w = store.open_write("c1.tar").unwrap();
        w.write_all(b"streamed").unwrap();
        w.commit().unwrap();
        assert_eq!(std::fs::read(dir.path().join("c1.tar")).unwrap(), b"streamed");

        let mut back = Vec::new();
        store.read("c1.tar").unwrap().read_to_end(&mut back).unwrap();
        assert_eq!(back, b"streamed");
    }

    #[cfg(unix)]
    #[test]
    fn command_store_failed_exit_fails_commit() {
        let store = CommandStore::new("false {name}", None).unwrap();
        let w = store.open_write("c2.tar").unwrap();
        assert!(w.commit().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_store_uploader_exit_mid_stream_fails_commit() {
        let store = CommandStore::new("true {name}", None).unwrap();
        let mut w = store.open_write("c3.tar").unwrap();
        // larger than any pipe buffer; `true` never reads
        w.write_all(&vec![0u8; 4 * 1024 * 1024]).unwrap();
        let err = w.commit().unwrap_err();
        assert!(err.to_string().contains("c3.tar"), "{err}");
    }
}
