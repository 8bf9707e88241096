use std::{
    future::Future,
    io::{ErrorKind, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use tandem_process::ProcessRole;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{config::Settings, error::TandemError};

const CHUNK: u64 = 64 * 1024;
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// `agent`/`server` map to the role's log file in the workdir; anything else
/// is taken as a path.
pub fn resolve_target(settings: &Settings, target: &str) -> PathBuf {
    match target.parse::<ProcessRole>() {
        Ok(role) => settings.log_file(role),
        Err(_) => settings.resolve(Path::new(target)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tail {
    pub lines: Vec<String>,
    /// Byte offset just past what was read; `follow` continues from here.
    pub end: u64,
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

async fn open_log(path: &Path) -> anyhow::Result<tokio::fs::File> {
    match tokio::fs::File::open(path).await {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(TandemError::LogMissing(path.to_path_buf()).into())
        }
        Err(e) => Err(e).with_context(|| format!("open {}", path.display())),
    }
}

/// Last `max_lines` lines of `path`, reading backwards from the end so large
/// logs are not loaded whole.
pub async fn tail_lines(path: &Path, max_lines: usize) -> anyhow::Result<Tail> {
    let mut f = open_log(path).await?;
    let size = f
        .metadata()
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let mut pos = size;
    let mut buf: Vec<u8> = Vec::new();
    while pos > 0 {
        let step = CHUNK.min(pos);
        pos -= step;
        f.seek(SeekFrom::Start(pos)).await?;
        let mut chunk = vec![0u8; step as usize];
        f.read_exact(&mut chunk)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        // One extra newline: the first line in the buffer may be cut off.
        let body = buf.strip_suffix(b"\n").unwrap_or(&buf);
        if body.iter().filter(|b| **b == b'\n').count() > max_lines {
            break;
        }
    }

    if pos > 0
        && let Some(nl) = buf.iter().position(|b| *b == b'\n')
    {
        buf.drain(..=nl);
    }

    Ok(Tail {
        lines: split_lines_from_tail(&buf, max_lines),
        end: size,
    })
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Streams lines appended to `path` after `offset` into `out` until `stop`
/// resolves. Truncation and rotation (a new file at the same path) restart
/// from the top of the new file.
pub async fn follow(
    path: &Path,
    mut offset: u64,
    out: &mut impl Write,
    stop: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tokio::pin!(stop);

    let mut id = tokio::fs::metadata(path).await.ok().and_then(|m| file_id(&m));
    let mut partial: Vec<u8> = Vec::new();

    loop {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let current = file_id(&meta);
                if current != id || meta.len() < offset {
                    tracing::debug!(path = %path.display(), "log rotated or truncated; reopening");
                    id = current;
                    offset = 0;
                    partial.clear();
                }
                if meta.len() > offset {
                    let mut f = tokio::fs::File::open(path)
                        .await
                        .with_context(|| format!("open {}", path.display()))?;
                    f.seek(SeekFrom::Start(offset)).await?;
                    let mut fresh = Vec::new();
                    f.read_to_end(&mut fresh)
                        .await
                        .with_context(|| format!("read {}", path.display()))?;
                    offset += fresh.len() as u64;
                    partial.extend_from_slice(&fresh);

                    if let Some(last_nl) = partial.iter().rposition(|b| *b == b'\n') {
                        let complete: Vec<u8> = partial.drain(..=last_nl).collect();
                        out.write_all(String::from_utf8_lossy(&complete).as_bytes())?;
                        out.flush()?;
                    }
                }
            }
            // Between rename and re-create during rotation.
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        }

        tokio::select! {
            _ = &mut stop => return Ok(()),
            _ = tokio::time::sleep(FOLLOW_POLL) => {}
        }
    }
}
