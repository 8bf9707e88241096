use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};

use anyhow::Context;

use crate::signals;

/// A process holding a listening socket on the port being reclaimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub pid: u32,
    pub cmdline: String,
}

#[derive(Debug, Clone)]
pub struct ReclaimOptions {
    pub port: u16,
    /// Substring the owner's command line must contain. `None` accepts anything.
    pub expect: Option<String>,
    /// Terminate owners that do not match `expect`.
    pub force: bool,
    pub grace: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Owners that are gone now.
    pub terminated: Vec<u32>,
    /// Subset of `terminated` that needed SIGKILL.
    pub killed: Vec<u32>,
    /// Owners left alone because their command line did not match.
    pub skipped: Vec<Listener>,
    /// Owners that could not be signalled (e.g. EPERM), with the error.
    pub failed: Vec<(u32, String)>,
}

impl ReclaimReport {
    pub fn found_nothing(&self) -> bool {
        self.terminated.is_empty() && self.skipped.is_empty() && self.failed.is_empty()
    }

    /// Whether the port may still be held after this run.
    pub fn left_listeners(&self) -> bool {
        !self.skipped.is_empty() || !self.failed.is_empty()
    }
}

/// Signal delivery, split out so the decision logic can be exercised without
/// touching real processes.
pub trait Terminator {
    fn is_alive(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32) -> anyhow::Result<bool>;
    fn kill(&self, pid: u32) -> anyhow::Result<bool>;
}

pub struct OsTerminator;

impl Terminator for OsTerminator {
    fn is_alive(&self, pid: u32) -> bool {
        signals::is_process_running(pid)
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<bool> {
        signals::terminate(pid)
    }

    fn kill(&self, pid: u32) -> anyhow::Result<bool> {
        signals::kill(pid)
    }
}

/// Extracts socket inodes in LISTEN state on `port` from the contents of
/// `/proc/net/tcp` or `/proc/net/tcp6`.
pub fn listening_inodes(proc_net_tcp: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    let mut out = Vec::new();
    for line in proc_net_tcp.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(local), Some(state), Some(inode)) = (fields.get(1), fields.get(3), fields.get(9))
        else {
            continue;
        };
        if *state != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        if u16::from_str_radix(port_hex, 16).ok() != Some(port) {
            continue;
        }
        if let Ok(inode) = inode.parse::<u64>()
            && inode != 0
        {
            out.push(inode);
        }
    }
    out
}

fn read_cmdline(proc_root: &Path, pid: u32) -> String {
    let raw = std::fs::read(proc_root.join(pid.to_string()).join("cmdline")).unwrap_or_default();
    let joined = raw
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    if !joined.is_empty() {
        return joined;
    }
    // Kernel threads and zombies have an empty cmdline; fall back to comm.
    std::fs::read_to_string(proc_root.join(pid.to_string()).join("comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Finds processes owning a listening TCP socket on `port` by matching socket
/// inodes from `<proc_root>/net/tcp{,6}` against `<proc_root>/<pid>/fd/*`.
///
/// Processes whose fds are unreadable (other users, without root) are missed.
pub fn find_listeners_in(proc_root: &Path, port: u16) -> anyhow::Result<Vec<Listener>> {
    let mut inodes = BTreeSet::new();
    for table in ["tcp", "tcp6"] {
        let path = proc_root.join("net").join(table);
        match std::fs::read_to_string(&path) {
            Ok(text) => inodes.extend(listening_inodes(&text, port)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        }
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut owners: BTreeMap<u32, String> = BTreeMap::new();
    let entries = std::fs::read_dir(proc_root)
        .with_context(|| format!("read {}", proc_root.display()))?;
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if inodes.contains(&inode) {
                owners
                    .entry(pid)
                    .or_insert_with(|| read_cmdline(proc_root, pid));
                break;
            }
        }
    }

    Ok(owners
        .into_iter()
        .map(|(pid, cmdline)| Listener { pid, cmdline })
        .collect())
}

#[cfg(target_os = "linux")]
pub fn find_listeners(port: u16) -> anyhow::Result<Vec<Listener>> {
    find_listeners_in(Path::new("/proc"), port)
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn find_listeners(port: u16) -> anyhow::Result<Vec<Listener>> {
    let out = std::process::Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
        .context("run lsof")?;
    // lsof exits 1 when nothing matches.
    let text = String::from_utf8_lossy(&out.stdout);
    let mut pids: Vec<u32> = text
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();

    Ok(pids
        .into_iter()
        .map(|pid| {
            let cmdline = std::process::Command::new("ps")
                .args(["-o", "command=", "-p", &pid.to_string()])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .unwrap_or_default();
            Listener { pid, cmdline }
        })
        .collect())
}

#[cfg(not(unix))]
pub fn find_listeners(_port: u16) -> anyhow::Result<Vec<Listener>> {
    anyhow::bail!("port reclaiming is only supported on Unix")
}

/// Terminates every matching listener: SIGTERM first, SIGKILL for whatever is
/// still alive after `opts.grace`. A pid that cannot be signalled is recorded
/// in `failed` and does not stop the others.
pub async fn reclaim(
    listeners: Vec<Listener>,
    opts: &ReclaimOptions,
    terminator: &impl Terminator,
) -> ReclaimReport {
    let mut report = ReclaimReport::default();
    let own_pid = std::process::id();

    let mut targets = Vec::new();
    for l in listeners {
        if l.pid == own_pid {
            tracing::warn!(port = opts.port, "tandem itself holds the port; not reclaiming");
            report.skipped.push(l);
            continue;
        }
        let matches = opts
            .expect
            .as_deref()
            .is_none_or(|pat| l.cmdline.contains(pat));
        if !matches && !opts.force {
            tracing::warn!(
                pid = l.pid,
                cmdline = %l.cmdline,
                expect = ?opts.expect,
                "listener does not look like the expected process; skipping (use --force)"
            );
            report.skipped.push(l);
            continue;
        }
        targets.push(l.pid);
    }

    let mut pending = Vec::new();
    for pid in targets {
        match terminator.terminate(pid) {
            Ok(true) => {
                tracing::info!(pid, port = opts.port, "sent SIGTERM");
                pending.push(pid);
            }
            Ok(false) => {
                // Exited between lookup and signal.
                tracing::debug!(pid, "already gone");
            }
            Err(err) => {
                tracing::warn!(pid, error = %format!("{err:#}"), "SIGTERM failed");
                report.failed.push((pid, format!("{err:#}")));
            }
        }
    }

    let deadline = tokio::time::Instant::now() + opts.grace;
    while !pending.is_empty() && tokio::time::Instant::now() < deadline {
        let (gone, alive): (Vec<u32>, Vec<u32>) =
            pending.iter().partition(|pid| !terminator.is_alive(**pid));
        report.terminated.extend(gone);
        pending = alive;
        if !pending.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    for pid in pending {
        match terminator.kill(pid) {
            Ok(sent) => {
                if sent {
                    tracing::warn!(pid, "ignored SIGTERM; sent SIGKILL");
                    report.killed.push(pid);
                }
                report.terminated.push(pid);
            }
            Err(err) => {
                tracing::warn!(pid, error = %format!("{err:#}"), "SIGKILL failed");
                report.failed.push((pid, format!("{err:#}")));
            }
        }
    }

    report.terminated.sort_unstable();
    report
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const TCP_TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F41 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 424242 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F91 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 515151 1 0000000000000000 100 0 0 10 0
   2: 0100007F:1F41 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 616161 1 0000000000000000 20 4 30 10 -1
";

    const TCP6_TABLE: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:1F41 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 737373 1 0000000000000000 100 0 0 10 0
";

    #[derive(Default)]
    struct FakeTerminator {
        // pids that ignore SIGTERM
        stubborn: Vec<u32>,
        // pids owned by another user
        denied: Vec<u32>,
        dead: Mutex<Vec<u32>>,
        calls: Mutex<Vec<(&'static str, u32)>>,
    }

    impl Terminator for FakeTerminator {
        fn is_alive(&self, pid: u32) -> bool {
            !self.dead.lock().unwrap().contains(&pid)
        }

        fn terminate(&self, pid: u32) -> anyhow::Result<bool> {
            self.calls.lock().unwrap().push(("term", pid));
            if self.denied.contains(&pid) {
                anyhow::bail!("send signal 15 to {pid}: Operation not permitted");
            }
            if !self.stubborn.contains(&pid) {
                self.dead.lock().unwrap().push(pid);
            }
            Ok(true)
        }

        fn kill(&self, pid: u32) -> anyhow::Result<bool> {
            self.calls.lock().unwrap().push(("kill", pid));
            self.dead.lock().unwrap().push(pid);
            Ok(true)
        }
    }

    fn opts() -> ReclaimOptions {
        ReclaimOptions {
            port: 8001,
            expect: Some("server.py".to_string()),
            force: false,
            grace: Duration::from_millis(300),
        }
    }

    fn listener(pid: u32, cmdline: &str) -> Listener {
        Listener {
            pid,
            cmdline: cmdline.to_string(),
        }
    }

    #[test]
    fn parses_listen_rows_for_port_only() {
        assert_eq!(listening_inodes(TCP_TABLE, 8001), vec![424242]);
        assert_eq!(listening_inodes(TCP_TABLE, 8081), vec![515151]);
        assert!(listening_inodes(TCP_TABLE, 9999).is_empty());
        assert_eq!(listening_inodes(TCP6_TABLE, 8001), vec![737373]);
    }

    #[cfg(unix)]
    #[test]
    fn finds_owner_in_fake_proc_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("net")).unwrap();
        std::fs::write(root.join("net/tcp"), TCP_TABLE).unwrap();

        let owner = root.join("4321");
        std::fs::create_dir_all(owner.join("fd")).unwrap();
        std::os::unix::fs::symlink("socket:[424242]", owner.join("fd/3")).unwrap();
        std::os::unix::fs::symlink("/dev/null", owner.join("fd/0")).unwrap();
        std::fs::write(owner.join("cmdline"), b"python\0server.py\0").unwrap();

        let other = root.join("999");
        std::fs::create_dir_all(other.join("fd")).unwrap();
        std::os::unix::fs::symlink("socket:[515151]", other.join("fd/7")).unwrap();

        std::fs::create_dir_all(root.join("self")).unwrap();

        let found = find_listeners_in(root, 8001).unwrap();
        assert_eq!(found, vec![listener(4321, "python server.py")]);
        assert!(find_listeners_in(root, 9999).unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finds_real_listener_owned_by_this_process() {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = l.local_addr().unwrap().port();
        let found = find_listeners(port).unwrap();
        assert!(found.iter().any(|x| x.pid == std::process::id()));
    }

    #[tokio::test]
    async fn no_listener_sends_nothing() {
        let t = FakeTerminator::default();
        let report = reclaim(Vec::new(), &opts(), &t).await;
        assert!(report.found_nothing());
        assert!(t.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_listener_is_terminated_once() {
        let t = FakeTerminator::default();
        let report = reclaim(vec![listener(77, "python server.py")], &opts(), &t)
            .await;
        assert_eq!(report.terminated, vec![77]);
        assert!(report.killed.is_empty());
        assert_eq!(*t.calls.lock().unwrap(), vec![("term", 77)]);
    }

    #[tokio::test]
    async fn stubborn_listener_gets_exactly_one_kill() {
        let t = FakeTerminator {
            stubborn: vec![88],
            ..FakeTerminator::default()
        };
        let report = reclaim(vec![listener(88, "python server.py")], &opts(), &t)
            .await;
        assert_eq!(report.terminated, vec![88]);
        assert_eq!(report.killed, vec![88]);
        assert_eq!(*t.calls.lock().unwrap(), vec![("term", 88), ("kill", 88)]);
    }

    #[tokio::test]
    async fn permission_error_does_not_abandon_other_listeners() {
        let t = FakeTerminator {
            stubborn: vec![21],
            denied: vec![20],
            ..FakeTerminator::default()
        };
        let report = reclaim(
            vec![listener(20, "python server.py"), listener(21, "python server.py")],
            &opts(),
            &t,
        )
        .await;
        assert_eq!(report.terminated, vec![21]);
        assert_eq!(report.killed, vec![21]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 20);
        assert!(report.failed[0].1.contains("not permitted"));
        assert!(report.left_listeners());
        assert_eq!(
            *t.calls.lock().unwrap(),
            vec![("term", 20), ("term", 21), ("kill", 21)]
        );
    }

    #[tokio::test]
    async fn unexpected_owner_is_skipped_unless_forced() {
        let t = FakeTerminator::default();
        let report = reclaim(vec![listener(90, "nginx: master")], &opts(), &t)
            .await;
        assert!(report.terminated.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(!report.found_nothing());
        assert!(t.calls.lock().unwrap().is_empty());

        let forced = ReclaimOptions {
            force: true,
            ..opts()
        };
        let report = reclaim(vec![listener(90, "nginx: master")], &forced, &t)
            .await;
        assert_eq!(report.terminated, vec![90]);
    }

    #[tokio::test]
    async fn never_reclaims_itself() {
        let t = FakeTerminator::default();
        let own = listener(std::process::id(), "tandem server.py");
        let report = reclaim(vec![own], &opts(), &t).await;
        assert!(report.terminated.is_empty());
        assert!(t.calls.lock().unwrap().is_empty());
    }
}
