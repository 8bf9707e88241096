//! Thin wrappers over `kill(2)`.
//!
//! Every helper treats ESRCH (no such process) as "already gone" and reports
//! it as `Ok(false)` instead of an error.

use anyhow::Context;

#[cfg(unix)]
fn send(target: i32, sig: libc::c_int) -> anyhow::Result<bool> {
    if target == 0 || target == -1 {
        anyhow::bail!("refusing to signal pid {target}");
    }
    let rc = unsafe { libc::kill(target, sig) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err).with_context(|| format!("send signal {sig} to {target}"))
}

/// A pid as `kill(2)` sees it. Values that do not fit a positive `i32` (e.g.
/// from a corrupt run file) cannot name a real process.
#[cfg(unix)]
fn pid_target(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|p| *p > 0)
}

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Some(target) = pid_target(pid) else {
        return false;
    };
    // kill(pid, 0) probes existence without delivering anything. EPERM still
    // means the pid exists.
    let rc = unsafe { libc::kill(target, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
pub fn terminate(pid: u32) -> anyhow::Result<bool> {
    match pid_target(pid) {
        Some(target) => send(target, libc::SIGTERM),
        None => Ok(false),
    }
}

#[cfg(unix)]
pub fn kill(pid: u32) -> anyhow::Result<bool> {
    match pid_target(pid) {
        Some(target) => send(target, libc::SIGKILL),
        None => Ok(false),
    }
}

#[cfg(unix)]
fn send_group(pgid: i32, sig: libc::c_int) -> anyhow::Result<bool> {
    if pgid <= 1 {
        anyhow::bail!("refusing to signal process group {pgid}");
    }
    send(-pgid, sig)
}

/// SIGTERM to a whole process group (children are spawned as session leaders).
#[cfg(unix)]
pub fn terminate_group(pgid: i32) -> anyhow::Result<bool> {
    send_group(pgid, libc::SIGTERM)
}

#[cfg(unix)]
pub fn kill_group(pgid: i32) -> anyhow::Result<bool> {
    send_group(pgid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    true
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> anyhow::Result<bool> {
    anyhow::bail!("process signals are only supported on Unix")
}

#[cfg(not(unix))]
pub fn kill(_pid: u32) -> anyhow::Result<bool> {
    anyhow::bail!("process signals are only supported on Unix")
}

#[cfg(not(unix))]
pub fn terminate_group(_pgid: i32) -> anyhow::Result<bool> {
    anyhow::bail!("process signals are only supported on Unix")
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: i32) -> anyhow::Result<bool> {
    anyhow::bail!("process signals are only supported on Unix")
}

/// Resolves on the first SIGINT or SIGTERM delivered to tandem itself.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to install SIGTERM handler; only Ctrl-C will stop tandem");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
