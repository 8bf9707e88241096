use std::{fmt, str::FromStr, time::Duration};

/// Logical role of a supervised child.
///
/// NOTE: Roles are fixed. The supervisor maps each role to a spawn template;
/// there is no way to launch an arbitrary command through it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Agent,
    Server,
}

impl ProcessRole {
    /// Launch order: the agent must be up before the server starts handing out jobs.
    pub const ALL: [ProcessRole; 2] = [ProcessRole::Agent, ProcessRole::Server];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Agent => "agent",
            ProcessRole::Server => "server",
        }
    }

    pub fn log_file_name(&self) -> &'static str {
        match self {
            ProcessRole::Agent => "agent.log",
            ProcessRole::Server => "server.log",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" | "worker" => Ok(ProcessRole::Agent),
            "server" | "api" => Ok(ProcessRole::Server),
            other => Err(format!("unknown process role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessState {
    Starting,
    Ready,
    Crashed,
    Stopping,
    Stopped,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Crashed | ProcessState::Stopped)
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Ready | ProcessState::Stopping
        )
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub role: ProcessRole,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub restart_attempts: u32,
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Off,
    Always,
    OnFailure,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "never" | "no" => Ok(RestartPolicy::Off),
            "always" => Ok(RestartPolicy::Always),
            "on-failure" | "on_failure" | "onfailure" => Ok(RestartPolicy::OnFailure),
            other => Err(format!("unknown restart policy: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartConfig {
    pub policy: RestartPolicy,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Off,
            max_retries: 5,
            backoff_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

impl RestartConfig {
    /// Clamp user supplied values into sane ranges.
    pub fn clamped(self) -> Self {
        let backoff_ms = self.backoff_ms.clamp(100, 10 * 60 * 1000);
        Self {
            policy: self.policy,
            max_retries: self.max_retries.min(1000),
            backoff_ms,
            backoff_max_ms: self.backoff_max_ms.clamp(backoff_ms, 60 * 60 * 1000),
        }
    }

    /// Decide whether a child that just exited (outside of a requested stop)
    /// should be relaunched. `attempts` counts restarts already performed.
    pub fn should_restart(&self, exit_code: Option<i32>, attempts: u32) -> bool {
        if attempts >= self.max_retries {
            return false;
        }
        // A missing exit code means the child died from a signal.
        let failed = exit_code != Some(0);
        match self.policy {
            RestartPolicy::Off => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => failed,
        }
    }

    /// Delay before restart number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(mult).min(self.backoff_max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_aliases() {
        assert_eq!("Agent".parse::<ProcessRole>().unwrap(), ProcessRole::Agent);
        assert_eq!("worker".parse::<ProcessRole>().unwrap(), ProcessRole::Agent);
        assert_eq!("api".parse::<ProcessRole>().unwrap(), ProcessRole::Server);
        assert!("db".parse::<ProcessRole>().is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&ProcessRole::Server).unwrap();
        assert_eq!(json, "\"server\"");
    }

    #[test]
    fn terminal_states() {
        assert!(ProcessState::Crashed.is_terminal());
        assert!(ProcessState::Stopped.is_terminal());
        assert!(!ProcessState::Stopping.is_terminal());
        assert!(ProcessState::Starting.is_alive());
    }

    #[test]
    fn off_policy_never_restarts() {
        let cfg = RestartConfig::default();
        assert!(!cfg.should_restart(Some(1), 0));
        assert!(!cfg.should_restart(None, 0));
    }

    #[test]
    fn on_failure_restarts_until_budget_spent() {
        let cfg = RestartConfig {
            policy: RestartPolicy::OnFailure,
            max_retries: 2,
            ..RestartConfig::default()
        };
        assert!(cfg.should_restart(Some(1), 0));
        assert!(cfg.should_restart(None, 1));
        assert!(!cfg.should_restart(Some(1), 2));
        assert!(!cfg.should_restart(Some(0), 0));
    }

    #[test]
    fn always_restarts_clean_exit() {
        let cfg = RestartConfig {
            policy: RestartPolicy::Always,
            ..RestartConfig::default()
        };
        assert!(cfg.should_restart(Some(0), 0));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RestartConfig {
            policy: RestartPolicy::Always,
            max_retries: 10,
            backoff_ms: 500,
            backoff_max_ms: 3000,
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(500));
        assert_eq!(cfg.backoff(2), Duration::from_millis(1000));
        assert_eq!(cfg.backoff(3), Duration::from_millis(2000));
        assert_eq!(cfg.backoff(4), Duration::from_millis(3000));
        assert_eq!(cfg.backoff(64), Duration::from_millis(3000));
    }

    #[test]
    fn clamped_keeps_max_above_base() {
        let cfg = RestartConfig {
            policy: RestartPolicy::Always,
            max_retries: 5000,
            backoff_ms: 10,
            backoff_max_ms: 1,
        }
        .clamped();
        assert_eq!(cfg.max_retries, 1000);
        assert_eq!(cfg.backoff_ms, 100);
        assert_eq!(cfg.backoff_max_ms, 100);
    }

    #[test]
    fn policy_parses() {
        assert_eq!(
            "on_failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure
        );
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }
}
