use std::{ffi::OsString, path::PathBuf, time::Duration};

use tandem_process::ProcessRole;

use crate::{bootstrap::Credentials, deps::Venv, readiness::Readiness};

/// Everything needed to spawn one role.
#[derive(Debug, Clone)]
pub struct ProcessTemplate {
    pub role: ProcessRole,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, OsString)>,
    pub readiness: Readiness,
}

impl ProcessTemplate {
    pub fn display_command(&self) -> String {
        let mut s = self.command.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReadinessMode {
    /// Poll each role's health URL.
    Probe,
    /// Sleep a fixed time after each start (agent 3s, server 2s).
    Delay,
    /// Do not wait at all.
    None,
}

/// What to run for each role. Defaults match the project layout:
/// `agent.py <mode>` and `server.py` next to `.env`.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub agent_script: PathBuf,
    pub agent_mode: String,
    pub server_script: PathBuf,
    pub agent_health_url: String,
    pub server_health_url: String,
    pub readiness: ReadinessMode,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            agent_script: PathBuf::from("agent.py"),
            agent_mode: "dev".to_string(),
            server_script: PathBuf::from("server.py"),
            agent_health_url: format!(
                "http://127.0.0.1:{}/",
                crate::config::DEFAULT_AGENT_HEALTH_PORT
            ),
            server_health_url: format!(
                "http://127.0.0.1:{}/health",
                crate::config::DEFAULT_SERVER_PORT
            ),
            readiness: ReadinessMode::Probe,
        }
    }
}

impl LaunchSettings {
    fn readiness_for(&self, role: ProcessRole) -> Readiness {
        match (self.readiness, role) {
            (ReadinessMode::None, _) => Readiness::Immediate,
            (ReadinessMode::Delay, ProcessRole::Agent) => Readiness::Delay(Duration::from_secs(3)),
            (ReadinessMode::Delay, ProcessRole::Server) => Readiness::Delay(Duration::from_secs(2)),
            (ReadinessMode::Probe, ProcessRole::Agent) => {
                Readiness::Http(self.agent_health_url.clone())
            }
            (ReadinessMode::Probe, ProcessRole::Server) => {
                Readiness::Http(self.server_health_url.clone())
            }
        }
    }
}

/// Builds the spawn template for `role`, run with the venv's interpreter and
/// the credentials exported into its environment.
pub fn template_for(
    role: ProcessRole,
    launch: &LaunchSettings,
    workdir: &std::path::Path,
    venv: &Venv,
    creds: &Credentials,
) -> ProcessTemplate {
    let mut env: Vec<(String, OsString)> = creds
        .iter()
        .map(|(k, v)| (k.clone(), OsString::from(v)))
        .collect();
    env.extend(venv.activation_env());
    // Python buffers stdout when it is not a tty; log lines would arrive late.
    env.push(("PYTHONUNBUFFERED".to_string(), OsString::from("1")));

    let args = match role {
        ProcessRole::Agent => vec![
            launch.agent_script.display().to_string(),
            launch.agent_mode.clone(),
        ],
        ProcessRole::Server => vec![launch.server_script.display().to_string()],
    };

    ProcessTemplate {
        role,
        command: venv.python(),
        args,
        cwd: workdir.to_path_buf(),
        env,
        readiness: launch.readiness_for(role),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(dir: &std::path::Path) -> Credentials {
        let p = dir.join(".env");
        std::fs::write(&p, "LIVEKIT_URL=wss://lk\nLIVEKIT_AGENT_NAME=interview\n").unwrap();
        crate::bootstrap::load_credentials(&p).unwrap()
    }

    #[test]
    fn agent_template_uses_venv_python() {
        let dir = tempfile::tempdir().unwrap();
        let venv = Venv::new(dir.path().join("venv"));
        let t = template_for(
            ProcessRole::Agent,
            &LaunchSettings::default(),
            dir.path(),
            &venv,
            &creds(dir.path()),
        );
        assert_eq!(t.command, venv.python());
        assert_eq!(t.args, vec!["agent.py".to_string(), "dev".to_string()]);
        assert_eq!(t.readiness, Readiness::Http("http://127.0.0.1:8081/".to_string()));
        assert!(
            t.env
                .iter()
                .any(|(k, v)| k == "LIVEKIT_AGENT_NAME" && v == "interview")
        );
        assert!(t.env.iter().any(|(k, _)| k == "VIRTUAL_ENV"));
    }

    #[test]
    fn delay_mode_keeps_historic_settle_times() {
        let dir = tempfile::tempdir().unwrap();
        let launch = LaunchSettings {
            readiness: ReadinessMode::Delay,
            ..LaunchSettings::default()
        };
        let venv = Venv::new(dir.path().join("venv"));
        let c = creds(dir.path());
        let agent = template_for(ProcessRole::Agent, &launch, dir.path(), &venv, &c);
        let server = template_for(ProcessRole::Server, &launch, dir.path(), &venv, &c);
        assert_eq!(agent.readiness, Readiness::Delay(Duration::from_secs(3)));
        assert_eq!(server.readiness, Readiness::Delay(Duration::from_secs(2)));
        assert_eq!(server.args, vec!["server.py".to_string()]);
    }

    #[test]
    fn server_probe_targets_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let venv = Venv::new(dir.path().join("venv"));
        let t = template_for(
            ProcessRole::Server,
            &LaunchSettings::default(),
            dir.path(),
            &venv,
            &creds(dir.path()),
        );
        assert_eq!(
            t.readiness,
            Readiness::Http("http://127.0.0.1:8001/health".to_string())
        );
        assert!(t.display_command().ends_with("server.py"));
    }
}
