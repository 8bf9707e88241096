use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tandem_process::{ProcessRole, ProcessState};

use crate::{error::TandemError, signals};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunChild {
    pub role: ProcessRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub state: ProcessState,
}

/// Contents of `tandem.run.json` while `tandem up` is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub supervisor_pid: u32,
    pub started_at_unix_ms: u64,
    pub version: String,
    pub children: Vec<RunChild>,
}

impl RunState {
    fn for_current_process() -> Self {
        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            supervisor_pid: std::process::id(),
            started_at_unix_ms,
            version: env!("CARGO_PKG_VERSION").to_string(),
            children: Vec::new(),
        }
    }
}

pub fn read_run_state(path: &Path) -> anyhow::Result<Option<RunState>> {
    let data = match std::fs::read(path) {
        Ok(v) => v,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let state = serde_json::from_slice(&data)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(state))
}

fn tmp_path(path: &Path, tag: &str) -> PathBuf {
    PathBuf::from(format!("{}.{tag}.{}", path.display(), std::process::id()))
}

fn write_tmp(path: &Path, tag: &str, state: &RunState) -> anyhow::Result<PathBuf> {
    let tmp = tmp_path(path, tag);
    let data = serde_json::to_vec_pretty(state).context("serialize run state")?;
    std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    Ok(tmp)
}

/// Exclusive claim on one working directory.
///
/// Only one `tandem up` may own a directory: both would fight over port 8001
/// and append to the same log files. The file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    state: RunState,
}

impl RunLock {
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        let state = RunState::for_current_process();

        for _ in 0..3 {
            // Link a fully written temp file into place: creation and content
            // become visible atomically and an existing file is never replaced.
            let tmp = write_tmp(path, "lock", &state)?;
            let linked = std::fs::hard_link(&tmp, path);
            let _ = std::fs::remove_file(&tmp);

            match linked {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "acquired run file");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        state,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Ok(Some(existing)) = read_run_state(path)
                        && existing.supervisor_pid != state.supervisor_pid
                        && signals::is_process_running(existing.supervisor_pid)
                    {
                        return Err(TandemError::AlreadyRunning {
                            pid: existing.supervisor_pid,
                        }
                        .into());
                    }
                    tracing::info!(path = %path.display(), "removing stale run file");
                    match std::fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(e).with_context(|| format!("remove {}", path.display()));
                        }
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
            }
        }

        anyhow::bail!("could not claim {}", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn update(&mut self, children: Vec<RunChild>) -> anyhow::Result<()> {
        self.state.children = children;
        let tmp = write_tmp(&self.path, "tmp", &self.state)?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("persist {}", self.path.display()))?;
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
