use std::{collections::BTreeMap, path::Path};

use anyhow::Context;

use crate::error::TandemError;

/// Keys the agent and server read from the credentials file.
pub const CREDENTIAL_KEYS: &[&str] = &[
    "LIVEKIT_URL",
    "LIVEKIT_API_KEY",
    "LIVEKIT_API_SECRET",
    "LIVEKIT_AGENT_NAME",
    "OPENAI_API_KEY",
];

/// Parsed `KEY=VALUE` pairs from the credentials file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Recognized keys that are absent or blank. Only used for a warning;
    /// validating values is the consumers' job.
    pub fn blank_known_keys(&self) -> Vec<&'static str> {
        CREDENTIAL_KEYS
            .iter()
            .copied()
            .filter(|k| self.get(k).is_none_or(|v| v.trim().is_empty()))
            .collect()
    }
}

/// Makes sure the credentials file exists before anything is started.
///
/// A missing file is copied from `template` when possible, but startup still
/// stops so the operator can fill in real values.
pub fn ensure_env_file(config: &Path, template: &Path) -> anyhow::Result<Credentials> {
    if !config.exists() {
        if template.is_file() {
            std::fs::copy(template, config).with_context(|| {
                format!("copy {} -> {}", template.display(), config.display())
            })?;
            tracing::info!(config = %config.display(), template = %template.display(), "created credentials file from template");
            return Err(TandemError::ConfigTemplateCopied {
                config: config.to_path_buf(),
                template: template.to_path_buf(),
            }
            .into());
        }
        return Err(TandemError::ConfigMissing {
            config: config.to_path_buf(),
            template: template.to_path_buf(),
        }
        .into());
    }

    let creds = load_credentials(config)?;
    if creds.is_empty() {
        return Err(TandemError::ConfigEmpty(config.to_path_buf()).into());
    }

    let blank = creds.blank_known_keys();
    if !blank.is_empty() {
        tracing::warn!(keys = %blank.join(","), "credentials file has blank or missing keys");
    }
    tracing::debug!(entries = creds.len(), path = %config.display(), "credentials file present");
    Ok(creds)
}

pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("read credentials file {}", path.display()))?;
    let mut out = BTreeMap::new();
    for item in iter {
        let (k, v) = item.with_context(|| format!("parse credentials file {}", path.display()))?;
        out.insert(k, v);
    }
    Ok(Credentials(out))
}
