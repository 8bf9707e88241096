use std::path::PathBuf;

use tandem_process::ProcessRole;

use crate::bootstrap::CREDENTIAL_KEYS;

/// Failures the operator is expected to act on. Anything else travels as a
/// plain `anyhow::Error` with context attached.
#[derive(Debug, thiserror::Error)]
pub enum TandemError {
    #[error(
        "created {} from {}\nfill in {} and re-run",
        config.display(),
        template.display(),
        CREDENTIAL_KEYS.join(", ")
    )]
    ConfigTemplateCopied { config: PathBuf, template: PathBuf },

    #[error(
        "{} not found and no template at {}\ncreate it manually with {} (one KEY=VALUE per line)",
        config.display(),
        template.display(),
        CREDENTIAL_KEYS.join(", ")
    )]
    ConfigMissing { config: PathBuf, template: PathBuf },

    #[error("{} has no entries\nadd {} and re-run", .0.display(), CREDENTIAL_KEYS.join(", "))]
    ConfigEmpty(PathBuf),

    #[error("dependency manifest not found: {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("{step} failed:\n{output}")]
    Install { step: String, output: String },

    #[error("{role} did not become ready within {timeout_ms}ms (probe: {target})")]
    ReadinessTimeout {
        role: ProcessRole,
        target: String,
        timeout_ms: u128,
    },

    #[error("{role} exited before becoming ready (exit code {exit_code:?}); see {log}")]
    ExitedBeforeReady {
        role: ProcessRole,
        exit_code: Option<i32>,
        log: String,
    },

    #[error("tandem is already running in this directory (pid {pid}); use `tandem stop` first")]
    AlreadyRunning { pid: u32 },

    #[error(
        "log file not found: {}\neither the process was never started in background mode (`tandem up`),\nor it was started before file logging was enabled",
        .0.display()
    )]
    LogMissing(PathBuf),

    #[error("tandem is not running (no run file at {})", .0.display())]
    NotRunning(PathBuf),
}
