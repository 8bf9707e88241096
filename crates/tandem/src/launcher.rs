use std::{future::Future, process::ExitStatus, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};

use crate::{
    log_file::{LogSink, Stream},
    signals,
    templates::ProcessTemplate,
};

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    // If tandem dies (crash/kill), the child gets SIGTERM instead of lingering
    // on the port.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// A spawned child plus the process group its signals go to.
pub struct Spawned {
    pub child: Child,
    pub pid: Option<u32>,
    pub pgid: Option<i32>,
    readers: Vec<JoinHandle<()>>,
}

impl Spawned {
    /// Waits for the output pumps to hit EOF so the last lines land in the
    /// sink before anyone reports the exit. Bounded: a grandchild can keep the
    /// pipe open after the child itself is gone.
    pub async fn drain_output(&mut self) {
        let readers = std::mem::take(&mut self.readers);
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            for r in readers {
                let _ = r.await;
            }
        })
        .await;
    }
}

/// Spawns `t` in its own session with stdout/stderr piped into `sink`.
pub fn spawn_child(t: &ProcessTemplate, sink: &LogSink) -> anyhow::Result<Spawned> {
    let mut cmd = Command::new(&t.command);
    cmd.args(&t.args)
        .current_dir(&t.cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    for (k, v) in &t.env {
        cmd.env(k, v);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                // New session so the whole tree can be signalled at once.
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "spawn {}: {} (cwd {})",
            t.role,
            t.display_command(),
            t.cwd.display()
        )
    })?;
    let pid = child.id();
    let pgid = pid.map(|p| p as i32);

    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        let sink = sink.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.emit(Stream::Stdout, line);
            }
        }));
    }
    if let Some(err) = child.stderr.take() {
        let sink = sink.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.emit(Stream::Stderr, line);
            }
        }));
    }

    Ok(Spawned {
        child,
        pid,
        pgid,
        readers,
    })
}

/// Exit code as a shell would report it: the child's code, or 128+signal.
pub fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

/// SIGTERM to the group, SIGKILL if it is still alive after `grace`.
pub async fn stop_child(spawned: &mut Spawned, grace: Duration) -> anyhow::Result<ExitStatus> {
    if let Some(status) = spawned.child.try_wait()? {
        return Ok(status);
    }
    if let Some(pgid) = spawned.pgid {
        signals::terminate_group(pgid)?;
    }
    match tokio::time::timeout(grace, spawned.child.wait()).await {
        Ok(res) => Ok(res?),
        Err(_) => {
            tracing::warn!(pid = ?spawned.pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM; sending SIGKILL");
            if let Some(pgid) = spawned.pgid {
                signals::kill_group(pgid)?;
            }
            Ok(spawned.child.wait().await?)
        }
    }
}

/// Foreground mode: tandem lives exactly as long as the child and returns its
/// exit code. A shutdown signal is forwarded as a graceful stop.
pub async fn run_foreground(
    t: &ProcessTemplate,
    sink: LogSink,
    grace: Duration,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<i32> {
    sink.note(format!("start {}: {}", t.role, t.display_command()));
    let mut spawned = spawn_child(t, &sink)?;
    tracing::info!(role = %t.role, pid = ?spawned.pid, "started in foreground");

    tokio::pin!(shutdown);
    let status = tokio::select! {
        res = spawned.child.wait() => res.with_context(|| format!("wait for {}", t.role))?,
        _ = &mut shutdown => {
            tracing::info!(role = %t.role, "stop requested; forwarding to child");
            sink.note("stop requested");
            stop_child(&mut spawned, grace).await?
        }
    };

    spawned.drain_output().await;
    let code = exit_code_of(&status);
    sink.note(format!("{} exited: code={code}", t.role));
    sink.flush().await;
    tracing::info!(role = %t.role, code, "child exited");
    Ok(code)
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use tandem_process::ProcessRole;

    use super::*;
    use crate::readiness::Readiness;

    fn sh(script: &str) -> ProcessTemplate {
        ProcessTemplate {
            role: ProcessRole::Server,
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env: vec![("TANDEM_TEST_VALUE".to_string(), "42".into())],
            readiness: Readiness::Immediate,
        }
    }

    #[tokio::test]
    async fn foreground_returns_child_exit_code_and_tees_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("server.log");
        let sink = LogSink::open_file(log.clone(), false).await.unwrap();
        let t = sh("echo value=$TANDEM_TEST_VALUE; echo err >&2; exit 7");

        let code = run_foreground(&t, sink, Duration::from_secs(2), std::future::pending())
            .await
            .unwrap();
        assert_eq!(code, 7);

        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("value=42"));
        assert!(text.contains("err"));
        assert!(text.contains("[tandem] server exited: code=7"));
    }

    #[tokio::test]
    async fn foreground_forwards_shutdown() {
        let t = sh("exec sleep 30");
        let started = tokio::time::Instant::now();
        let code = run_foreground(
            &t,
            LogSink::echo_only(),
            Duration::from_secs(5),
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert_eq!(code, 128 + libc::SIGTERM);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let t = sh("trap '' TERM; while true; do sleep 0.1; done");
        let sink = LogSink::echo_only();
        let mut spawned = spawn_child(&t, &sink).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = stop_child(&mut spawned, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(exit_code_of(&status), 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn spawn_failure_names_the_role() {
        let mut t = sh("true");
        t.command = PathBuf::from("/nonexistent/python");
        let err = spawn_child(&t, &LogSink::echo_only()).err().unwrap();
        assert!(err.to_string().contains("spawn server"));
    }
}
