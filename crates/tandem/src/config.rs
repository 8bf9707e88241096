use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_SERVER_PORT: u16 = 8001;
pub const DEFAULT_AGENT_HEALTH_PORT: u16 = 8081;
pub const DEFAULT_TAIL_LINES: usize = 50;
pub const RUN_FILE_NAME: &str = "tandem.run.json";

const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

fn env_ms(name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Time a child gets between SIGTERM and SIGKILL.
pub fn stop_grace() -> Duration {
    env_ms("TANDEM_STOP_GRACE_MS", 10_000, 500, 120_000)
}

pub fn readiness_timeout() -> Duration {
    env_ms("TANDEM_READINESS_TIMEOUT_MS", 60_000, 1000, 10 * 60 * 1000)
}

pub fn readiness_interval() -> Duration {
    env_ms("TANDEM_READINESS_INTERVAL_MS", 500, 100, 10_000)
}

pub fn reclaim_grace() -> Duration {
    env_ms("TANDEM_RECLAIM_GRACE_MS", 3000, 100, 60_000)
}

pub fn log_file_limits() -> (u64, usize) {
    let max_bytes = env_u64("TANDEM_LOG_FILE_MAX_BYTES")
        .map(|v| v.clamp(64 * 1024, 1024 * 1024 * 1024))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_BYTES);
    let max_files = env_usize("TANDEM_LOG_FILE_MAX_FILES")
        .map(|v| v.clamp(1, 20))
        .unwrap_or(DEFAULT_LOG_FILE_MAX_FILES);
    (max_bytes, max_files)
}

/// Filesystem layout of one project checkout.
///
/// Relative paths are resolved against `workdir`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub workdir: PathBuf,
    pub env_file: PathBuf,
    pub env_template: PathBuf,
    pub venv: PathBuf,
    pub python: String,
    pub manifest: PathBuf,
}

impl Settings {
    pub fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workdir.join(p)
        }
    }

    pub fn env_file(&self) -> PathBuf {
        self.resolve(&self.env_file)
    }

    pub fn env_template(&self) -> PathBuf {
        self.resolve(&self.env_template)
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.resolve(&self.venv)
    }

    pub fn manifest(&self) -> PathBuf {
        self.resolve(&self.manifest)
    }

    pub fn run_file(&self) -> PathBuf {
        self.workdir.join(RUN_FILE_NAME)
    }

    pub fn log_file(&self, role: tandem_process::ProcessRole) -> PathBuf {
        self.workdir.join(role.log_file_name())
    }
}
