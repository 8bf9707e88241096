use std::{fmt, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::{
    error::TandemError,
    run_state::{RunChild, RunState, read_run_state},
    signals,
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ChildLiveness {
    pub child: RunChild,
    pub alive: bool,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub run_file: PathBuf,
    pub run: Option<RunState>,
    pub supervisor_alive: bool,
    pub children: Vec<ChildLiveness>,
    pub health_url: String,
    pub health: Result<serde_json::Value, String>,
}

impl StatusReport {
    pub fn is_running(&self) -> bool {
        self.run.is_some() && self.supervisor_alive
    }
}

fn json_field(v: &serde_json::Value, key: &str) -> String {
    match v.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.run {
            None => writeln!(f, "supervisor: not running (no {})", self.run_file.display())?,
            Some(run) if !self.supervisor_alive => writeln!(
                f,
                "supervisor: not running (stale run file, pid {} is gone)",
                run.supervisor_pid
            )?,
            Some(run) => writeln!(
                f,
                "supervisor: running (pid {}, tandem {})",
                run.supervisor_pid, run.version
            )?,
        }

        for c in &self.children {
            let pid = c
                .child
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:<7} pid={:<8} state={:?} alive={}",
                c.child.role.as_str(),
                pid,
                c.child.state,
                c.alive
            )?;
        }

        match &self.health {
            Ok(v) => write!(
                f,
                "health: status={} active_sessions={} agents_ready={}",
                json_field(v, "status"),
                json_field(v, "active_sessions"),
                json_field(v, "agents_ready")
            ),
            Err(err) => write!(f, "health: unavailable ({}: {err})", self.health_url),
        }
    }
}

/// GETs the server's health endpoint. Any JSON body is accepted; fields are
/// read by name when rendering.
pub async fn fetch_health(url: &str) -> anyhow::Result<serde_json::Value> {
    let client =
        crate::readiness::local_http_client(HEALTH_TIMEOUT).context("build http client")?;
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("GET {url}: HTTP {status}");
    }
    resp.json::<serde_json::Value>()
        .await
        .with_context(|| format!("decode {url}"))
}

pub async fn status(run_file: PathBuf, health_url: String) -> anyhow::Result<StatusReport> {
    let run = match read_run_state(&run_file) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(path = %run_file.display(), error = %format!("{err:#}"), "unreadable run file");
            None
        }
    };
    let supervisor_alive = run
        .as_ref()
        .is_some_and(|r| signals::is_process_running(r.supervisor_pid));

    let children = run
        .as_ref()
        .map(|r| {
            r.children
                .iter()
                .map(|c| ChildLiveness {
                    child: c.clone(),
                    alive: supervisor_alive && c.pid.is_some_and(signals::is_process_running),
                })
                .collect()
        })
        .unwrap_or_default();

    let health = fetch_health(&health_url)
        .await
        .map_err(|err| format!("{err:#}"));

    Ok(StatusReport {
        run_file,
        run,
        supervisor_alive,
        children,
        health_url,
        health,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32 },
    /// The recorded supervisor was already gone; its run file was removed.
    Stale { pid: u32 },
}

/// Asks a running `tandem up` to shut down and waits until it has released
/// the run file (or exited) for at most `wait`.
pub async fn stop(run_file: PathBuf, wait: Duration) -> anyhow::Result<StopOutcome> {
    let Some(run) = read_run_state(&run_file)? else {
        return Err(TandemError::NotRunning(run_file).into());
    };
    let pid = run.supervisor_pid;

    if pid == std::process::id() {
        anyhow::bail!("run file names this process (pid {pid})");
    }

    if !signals::is_process_running(pid) || !signals::terminate(pid)? {
        tracing::info!(pid, path = %run_file.display(), "supervisor already gone; removing stale run file");
        let _ = std::fs::remove_file(&run_file);
        return Ok(StopOutcome::Stale { pid });
    }
    tracing::info!(pid, "sent SIGTERM to supervisor");

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let released = !run_file.exists();
        if released || !signals::is_process_running(pid) {
            if !released {
                let _ = std::fs::remove_file(&run_file);
            }
            return Ok(StopOutcome::Stopped { pid });
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "supervisor (pid {pid}) still running after {}ms",
                wait.as_millis()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tandem_process::{ProcessRole, ProcessState};

    use super::*;

    fn write_run(path: &std::path::Path, supervisor_pid: u32, children: Vec<RunChild>) {
        let run = RunState {
            supervisor_pid,
            started_at_unix_ms: 0,
            version: "0.1.0".to_string(),
            children,
        };
        std::fs::write(path, serde_json::to_vec(&run).unwrap()).unwrap();
    }

    fn closed_url() -> String {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = l.local_addr().unwrap();
        drop(l);
        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn stop_without_run_file_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let err = stop(dir.path().join("tandem.run.json"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TandemError>(),
            Some(TandemError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn stop_cleans_up_stale_run_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.run.json");
        let mut gone = std::process::Command::new("true").spawn().unwrap();
        let pid = gone.id();
        gone.wait().unwrap();
        write_run(&path, pid, Vec::new());

        let outcome = stop(path.clone(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stale { pid });
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stop_treats_out_of_range_pid_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.run.json");
        write_run(&path, u32::MAX, Vec::new());

        let outcome = stop(path.clone(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stale { pid: u32::MAX });
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stop_terminates_live_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.run.json");
        let mut sleeper = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = sleeper.id().unwrap();
        write_run(&path, pid, Vec::new());

        // Reap in the background so the pid does not linger as a zombie.
        let reaper = tokio::spawn(async move { sleeper.wait().await });

        let outcome = stop(path.clone(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped { pid });
        assert!(!path.exists());
        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn status_reports_children_and_health() {
        let app = axum::Router::new().route(
            "/health",
            axum::routing::get(|| async {
                axum::Json(serde_json::json!({
                    "status": "healthy",
                    "active_sessions": 2,
                    "agents_ready": true,
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.run.json");
        let own = std::process::id();
        write_run(
            &path,
            own,
            vec![
                RunChild {
                    role: ProcessRole::Agent,
                    pid: Some(own),
                    state: ProcessState::Ready,
                },
                RunChild {
                    role: ProcessRole::Server,
                    pid: None,
                    state: ProcessState::Crashed,
                },
            ],
        );

        let report = status(path, format!("http://{addr}/health")).await.unwrap();
        assert!(report.is_running());
        assert!(report.children[0].alive);
        assert!(!report.children[1].alive);

        let text = report.to_string();
        assert!(text.contains(&format!("supervisor: running (pid {own}")));
        assert!(text.contains("state=Crashed"));
        assert!(text.contains("status=healthy active_sessions=2 agents_ready=true"));
    }

    #[tokio::test]
    async fn status_when_nothing_runs() {
        let dir = tempfile::tempdir().unwrap();
        let report = status(dir.path().join("tandem.run.json"), closed_url())
            .await
            .unwrap();
        assert!(!report.is_running());
        assert!(report.health.is_err());
        let text = report.to_string();
        assert!(text.contains("not running"));
        assert!(text.contains("health: unavailable"));
    }
}
