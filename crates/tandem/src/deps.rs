use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::Context;
use sha2::{Digest, Sha256};

use crate::error::TandemError;

const STAMP_FILE: &str = ".tandem-manifest.sha256";

/// An isolated Python environment rooted at `root`.
#[derive(Debug, Clone)]
pub struct Venv {
    root: PathBuf,
}

impl Venv {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        if cfg!(windows) {
            self.root.join("Scripts")
        } else {
            self.root.join("bin")
        }
    }

    pub fn python(&self) -> PathBuf {
        if cfg!(windows) {
            self.bin_dir().join("python.exe")
        } else {
            self.bin_dir().join("python")
        }
    }

    pub fn exists(&self) -> bool {
        self.python().is_file()
    }

    fn stamp_path(&self) -> PathBuf {
        self.root.join(STAMP_FILE)
    }

    /// Environment a child needs to behave as if the venv were activated.
    pub fn activation_env(&self) -> Vec<(String, OsString)> {
        let mut paths = vec![self.bin_dir()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        let path = std::env::join_paths(paths).unwrap_or_else(|_| self.bin_dir().into_os_string());
        vec![
            ("VIRTUAL_ENV".to_string(), self.root.clone().into_os_string()),
            ("PATH".to_string(), path),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    UpToDate,
}

/// Creates the venv with `python -m venv` unless it is already there.
pub async fn ensure_venv(python: &str, root: &Path) -> anyhow::Result<Venv> {
    let venv = Venv::new(root);
    if venv.exists() {
        tracing::debug!(venv = %root.display(), "virtual environment present");
        return Ok(venv);
    }

    tracing::info!(venv = %root.display(), %python, "creating virtual environment");
    let mut cmd = tokio::process::Command::new(python);
    cmd.arg("-m").arg("venv").arg(root);
    run_tool("create virtual environment", cmd).await?;

    if !venv.exists() {
        return Err(TandemError::Install {
            step: "create virtual environment".to_string(),
            output: format!("{} was not created", venv.python().display()),
        }
        .into());
    }
    Ok(venv)
}

/// Installs every dependency listed in `manifest`.
///
/// The manifest is the only source of packages. A digest of it is stamped into
/// the venv after a successful install so repeated runs skip pip entirely.
pub async fn install_manifest(
    venv: &Venv,
    manifest: &Path,
    force: bool,
) -> anyhow::Result<InstallOutcome> {
    if !manifest.is_file() {
        return Err(TandemError::ManifestMissing(manifest.to_path_buf()).into());
    }

    let digest = manifest_digest(manifest)?;
    if !force && read_stamp(venv).as_deref() == Some(digest.as_str()) {
        tracing::info!(manifest = %manifest.display(), "dependencies up to date");
        return Ok(InstallOutcome::UpToDate);
    }

    tracing::info!(manifest = %manifest.display(), "installing dependencies");
    let mut cmd = tokio::process::Command::new(venv.python());
    cmd.args(["-m", "pip", "install", "-q", "-r"]).arg(manifest);
    for (k, v) in venv.activation_env() {
        cmd.env(k, v);
    }
    run_tool("install dependencies", cmd).await?;

    tokio::fs::write(venv.stamp_path(), format!("{digest}\n"))
        .await
        .with_context(|| format!("write {}", venv.stamp_path().display()))?;
    Ok(InstallOutcome::Installed)
}

pub fn manifest_digest(manifest: &Path) -> anyhow::Result<String> {
    let data =
        std::fs::read(manifest).with_context(|| format!("read manifest {}", manifest.display()))?;
    Ok(hex::encode(Sha256::digest(&data)))
}

fn read_stamp(venv: &Venv) -> Option<String> {
    std::fs::read_to_string(venv.stamp_path())
        .ok()
        .map(|s| s.trim().to_string())
}

async fn run_tool(step: &str, mut cmd: tokio::process::Command) -> anyhow::Result<()> {
    cmd.stdin(std::process::Stdio::null());
    let out = match cmd.output().await {
        Ok(v) => v,
        Err(err) => {
            return Err(TandemError::Install {
                step: step.to_string(),
                output: err.to_string(),
            }
            .into());
        }
    };
    if out.status.success() {
        return Ok(());
    }

    // Surface the tool's own diagnostics untouched.
    let mut output = String::from_utf8_lossy(&out.stderr).into_owned();
    let stdout = String::from_utf8_lossy(&out.stdout);
    if !stdout.trim().is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&stdout);
    }
    if output.trim().is_empty() {
        output = format!("exited with {}", out.status);
    }
    Err(TandemError::Install {
        step: step.to_string(),
        output,
    }
    .into())
}
