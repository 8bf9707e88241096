use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};

/// Prefix for lines tandem itself writes into a child's log.
pub const NOTE_PREFIX: &str = "[tandem]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Append-only log file that rolls over to `<path>.1 .. <path>.<keep>` once
/// `limit` bytes have been written. A `limit` of 0 never rolls.
struct RotatingFile {
    path: PathBuf,
    limit: u64,
    keep: usize,
    written: u64,
    file: tokio::fs::File,
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Renames `<path>.(n-1)` to `<path>.n` down to `<path>` itself; whatever
/// sat at `<path>.<keep>` is overwritten.
async fn shift_rotations(path: &Path, keep: usize) {
    for n in (1..=keep).rev() {
        let from = if n == 1 {
            path.to_path_buf()
        } else {
            rotated_path(path, n - 1)
        };
        if let Err(err) = tokio::fs::rename(&from, rotated_path(path, n)).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(%err, from = %from.display(), "log rotation rename failed");
        }
    }
}

impl RotatingFile {
    /// The parent directory must already exist; the workdir is never created
    /// on the caller's behalf.
    async fn open(path: PathBuf, limit: u64, keep: usize) -> std::io::Result<Self> {
        let file = open_append(&path).await?;
        let written = file.metadata().await?.len();
        Ok(Self {
            path,
            limit,
            keep,
            written,
            file,
        })
    }

    fn needs_roll(&self, incoming: u64) -> bool {
        self.limit > 0 && self.keep > 0 && self.written + incoming > self.limit
    }

    async fn roll(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        shift_rotations(&self.path, self.keep).await;
        self.file = open_append(&self.path).await?;
        self.written = 0;
        Ok(())
    }

    async fn append(&mut self, line: &str) -> std::io::Result<()> {
        let body = line.strip_suffix('\n').unwrap_or(line);
        let framed = format!("{body}\n");
        let len = framed.len() as u64;

        if self.needs_roll(len)
            && let Err(err) = self.roll().await
        {
            tracing::warn!(%err, path = %self.path.display(), "log rotation failed; appending to current file");
        }

        self.file.write_all(framed.as_bytes()).await?;
        self.written += len;
        Ok(())
    }
}

pub fn rotated_path(path: &Path, n: usize) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), n))
}

enum LogMsg {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Fan-in point for one child's output.
///
/// Lines go to an optional append-only file (owned by a single writer task)
/// and, in foreground mode, are echoed to tandem's own stdout/stderr.
#[derive(Clone)]
pub struct LogSink {
    file_tx: Option<mpsc::UnboundedSender<LogMsg>>,
    echo: bool,
}

impl LogSink {
    /// Sink that only echoes; used by `tandem run` without `--log-file`.
    pub fn echo_only() -> Self {
        Self {
            file_tx: None,
            echo: true,
        }
    }

    /// Opens (or creates) `path` for appending. Must be called inside a tokio runtime.
    pub async fn open_file(path: PathBuf, echo: bool) -> anyhow::Result<Self> {
        let (max_bytes, max_files) = crate::config::log_file_limits();
        let mut writer = RotatingFile::open(path.clone(), max_bytes, max_files)
            .await
            .with_context(|| format!("open log file {}", path.display()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<LogMsg>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    LogMsg::Line(line) => {
                        if let Err(err) = writer.append(&line).await {
                            tracing::warn!(%err, path = %writer.path.display(), "log write failed");
                        }
                    }
                    LogMsg::Flush(ack) => {
                        let _ = writer.file.flush().await;
                        let _ = ack.send(());
                    }
                }
            }
            let _ = writer.file.flush().await;
        });

        Ok(Self {
            file_tx: Some(tx),
            echo,
        })
    }

    pub fn emit(&self, stream: Stream, line: impl Into<String>) {
        let line = line.into();
        if self.echo {
            match stream {
                Stream::Stdout => println!("{line}"),
                Stream::Stderr => eprintln!("{line}"),
            }
        }
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(LogMsg::Line(line));
        }
    }

    /// Lifecycle note from tandem, e.g. `[tandem] server exited: code=1`.
    pub fn note(&self, line: impl AsRef<str>) {
        let line = format!("{NOTE_PREFIX} {}", line.as_ref());
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(LogMsg::Line(line));
        }
    }

    /// Waits until every line emitted so far has reached the file.
    pub async fn flush(&self) {
        let Some(tx) = &self.file_tx else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(LogMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_lines_and_notes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        std::fs::write(&path, "old line\n").unwrap();

        let sink = LogSink::open_file(path.clone(), false).await.unwrap();
        sink.emit(Stream::Stdout, "hello");
        sink.emit(Stream::Stderr, "oops\n");
        sink.note("server exited");
        sink.flush().await;

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "old line\nhello\noops\n[tandem] server exited\n");
    }

    #[tokio::test]
    async fn rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        let mut w = RotatingFile::open(path.clone(), 16, 2).await.unwrap();
        w.append("0123456789").await.unwrap();
        w.append("abcdefghij").await.unwrap();
        w.append("ABCDEFGHIJ").await.unwrap();
        w.file.flush().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ABCDEFGHIJ\n");
        assert_eq!(
            std::fs::read_to_string(rotated_path(&path, 1)).unwrap(),
            "abcdefghij\n"
        );
        assert_eq!(
            std::fs::read_to_string(rotated_path(&path, 2)).unwrap(),
            "0123456789\n"
        );
    }

    #[tokio::test]
    async fn oldest_rotation_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let mut w = RotatingFile::open(path.clone(), 4, 1).await.unwrap();
        for line in ["one", "two", "six"] {
            w.append(line).await.unwrap();
        }
        w.file.flush().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "six\n");
        assert_eq!(std::fs::read_to_string(rotated_path(&path, 1)).unwrap(), "two\n");
        assert!(!rotated_path(&path, 2).exists());
    }

    #[tokio::test]
    async fn missing_log_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-here").join("agent.log");

        let err = LogSink::open_file(path, false).await.err().unwrap();
        assert!(format!("{err:#}").contains("open log file"));
        assert!(!dir.path().join("not-here").exists());
    }

    #[tokio::test]
    async fn echo_only_flush_is_noop() {
        let sink = LogSink::echo_only();
        sink.note("not written anywhere");
        sink.flush().await;
    }
}
