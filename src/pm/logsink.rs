use crate::pm::asyncutil::{TaskKind, TaskTracker};
use crate::pm::config::LogConfig;
use anyhow::Context as _;
use chrono::Local;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

/// Append-only, size-bounded text log per instance: `${logs_directory}/${id}.log`.
///
/// Rotation is numbered (`id.log` -> `id.log.1` -> ... `id.log.<backups>`).
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    max_bytes: u64,
    backups: usize,
    files: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<OpenLog>>>>>,
}

struct OpenLog {
    f: tokio::fs::File,
    bytes_written: u64,
}

async fn open_append_log_async(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    let f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log {}", path.display()))?;
    Ok(f)
}

fn numbered(base_path: &Path, i: usize) -> PathBuf {
    PathBuf::from(format!("{}.{i}", base_path.display()))
}

async fn rotate_numbered_reopen_async(base_path: &Path, backups: usize) -> anyhow::Result<tokio::fs::File> {
    if backups == 0 {
        let _ = tokio::fs::remove_file(base_path).await;
        return open_append_log_async(base_path).await;
    }
    let _ = tokio::fs::remove_file(numbered(base_path, backups)).await;
    for i in (1..backups).rev() {
        let from = numbered(base_path, i);
        if tokio::fs::metadata(&from).await.is_ok() {
            let _ = tokio::fs::rename(&from, numbered(base_path, i + 1)).await;
        }
    }
    if tokio::fs::metadata(base_path).await.is_ok() {
        let _ = tokio::fs::rename(base_path, numbered(base_path, 1)).await;
    }
    open_append_log_async(base_path).await
}

/// Last `n` lines of a file, reading backwards in chunks.
fn tail_lines(path: &Path, n: usize) -> anyhow::Result<Vec<String>> {
    if n == 0 {
        return Ok(vec![]);
    }
    let mut f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    let len = f.metadata()?.len();
    let mut pos = len;
    let mut newline_count: usize = 0;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    while pos > 0 && newline_count <= n {
        let read_size = std::cmp::min(8192u64, pos) as usize;
        pos -= read_size as u64;
        f.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; read_size];
        f.read_exact(&mut buf)?;
        newline_count += buf.iter().filter(|&&b| b == b'\n').count();
        chunks.push(buf);
        if chunks.len() > 512 {
            break;
        }
    }
    chunks.reverse();
    let data = chunks.concat();
    let s = String::from_utf8_lossy(&data);
    let lines: Vec<&str> = s.split_terminator('\n').collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

impl LogSink {
    pub fn new(dir: &Path, cfg: &LogConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                max_bytes: cfg.max_bytes,
                backups: cfg.backups,
                files: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.inner.dir.join(format!("{id}.log"))
    }

    fn slot(&self, id: &str) -> Arc<tokio::sync::Mutex<Option<OpenLog>>> {
        let mut files = self.inner.files.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(files.entry(id.to_string()).or_default())
    }

    /// Append one timestamped line. Write failures are traced and swallowed.
    pub async fn append(&self, id: &str, line: &str) {
        if let Err(e) = self.try_append(id, line).await {
            tracing::warn!(target: "logsink", app = id, "append failed: {e:#}");
        }
    }

    async fn try_append(&self, id: &str, line: &str) -> anyhow::Result<()> {
        let path = self.path(id);
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            let f = open_append_log_async(&path).await?;
            let bytes_written = f.metadata().await.map(|m| m.len()).unwrap_or(0);
            *guard = Some(OpenLog { f, bytes_written });
        }
        let Some(log) = guard.as_mut() else {
            return Ok(());
        };

        let ts = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let s = format!("[{ts}] {}\n", line.trim_end_matches(['\r', '\n']));
        log.f.write_all(s.as_bytes()).await?;
        log.bytes_written = log.bytes_written.saturating_add(s.len() as u64);

        if self.inner.max_bytes > 0 && log.bytes_written >= self.inner.max_bytes {
            let _ = log.f.flush().await;
            log.f = rotate_numbered_reopen_async(&path, self.inner.backups).await?;
            log.bytes_written = 0;
        }
        Ok(())
    }

    pub async fn tail(&self, id: &str, n: usize) -> anyhow::Result<Vec<String>> {
        let path = self.path(id);
        tokio::task::spawn_blocking(move || tail_lines(&path, n))
            .await
            .map_err(|e| anyhow::anyhow!("tail join error: {e}"))?
    }

    /// Truncate the log and drop rotated backups.
    pub async fn clear(&self, id: &str) -> anyhow::Result<()> {
        let path = self.path(id);
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        *guard = None;
        match tokio::fs::OpenOptions::new().write(true).truncate(true).open(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("truncate {}", path.display())),
        }
        for i in 1..=self.inner.backups.max(1) {
            let _ = tokio::fs::remove_file(numbered(&path, i)).await;
        }
        Ok(())
    }

    /// Copy a child's output stream into the instance log, one line at a time.
    pub(crate) fn spawn_pump<R>(&self, tasks: &TaskTracker, id: &str, stream: R, tag: Option<&'static str>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        let id = id.to_string();
        tasks.spawn_as(TaskKind::Pump, async move {
            let mut reader = BufReader::new(stream);
            let mut buf: Vec<u8> = Vec::with_capacity(1024);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf);
                        match tag {
                            Some(t) => sink.append(&id, &format!("{t} {}", text.trim_end())).await,
                            None => sink.append(&id, text.trim_end()).await,
                        }
                    }
                    Err(e) => {
                        tracing::debug!(target: "logsink", app = %id, "pump ended: {e}");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(dir: &Path, max_bytes: u64) -> LogSink {
        LogSink::new(dir, &LogConfig { max_bytes, backups: 1 })
    }

    #[tokio::test]
    async fn append_then_tail_returns_latest_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = sink(tmp.path(), 0);
        for i in 0..5 {
            logs.append("bot1", &format!("line {i}")).await;
        }
        let tail = logs.tail("bot1", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("line 3"));
        assert!(tail[1].ends_with("line 4"));
        assert!(logs.tail("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn size_bound_rotates_into_numbered_backup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = sink(tmp.path(), 200);
        for i in 0..20 {
            logs.append("bot1", &format!("some moderately long line number {i}")).await;
        }
        let base = logs.path("bot1");
        assert!(numbered(&base, 1).exists());
        assert!(!numbered(&base, 2).exists());
        assert!(std::fs::metadata(&base).unwrap().len() < 200);
    }

    #[tokio::test]
    async fn clear_truncates_and_keeps_appending() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = sink(tmp.path(), 0);
        logs.append("bot1", "before").await;
        logs.clear("bot1").await.unwrap();
        assert!(logs.tail("bot1", 10).await.unwrap().is_empty());
        logs.append("bot1", "after").await;
        let tail = logs.tail("bot1", 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert!(tail[0].ends_with("after"));
    }

    #[tokio::test]
    async fn pump_copies_stream_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = sink(tmp.path(), 0);
        let tasks = TaskTracker::new();
        let data: &'static [u8] = b"hello\nworld\n";
        logs.spawn_pump(&tasks, "bot1", data, Some("[err]")).await.unwrap();
        let tail = logs.tail("bot1", 10).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].ends_with("[err] world"));
    }
}
