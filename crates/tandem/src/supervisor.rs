use std::{collections::BTreeMap, future::Future, time::Duration};

use tandem_process::{ProcessRole, ProcessState, ProcessStatus, RestartConfig};
use tokio::sync::mpsc;

use crate::{
    error::TandemError,
    launcher::{self, exit_code_of},
    log_file::LogSink,
    readiness::{self, ProbeBudget, Readiness},
    run_state::{RunChild, RunLock},
    signals,
    templates::ProcessTemplate,
};

/// After SIGKILL, how long to wait for the exit to be reported.
const KILL_SETTLE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub restart: RestartConfig,
    pub stop_grace: Duration,
    pub probe: ProbeBudget,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            restart: RestartConfig::default(),
            stop_grace: crate::config::stop_grace(),
            probe: ProbeBudget::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stopped on request (signal).
    Stopped,
    /// Every child exited on its own and nothing is left to restart.
    AllExited { crashed: bool },
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Stopped | Outcome::AllExited { crashed: false } => 0,
            Outcome::AllExited { crashed: true } => 1,
        }
    }
}

#[derive(Debug)]
enum Event {
    Exited {
        role: ProcessRole,
        generation: u64,
        exit_code: Option<i32>,
        runtime: Duration,
        wait_error: Option<String>,
    },
    Ready {
        role: ProcessRole,
        generation: u64,
    },
    NotReady {
        role: ProcessRole,
        generation: u64,
    },
    RestartDue {
        role: ProcessRole,
        generation: u64,
    },
}

struct ProcessEntry {
    template: ProcessTemplate,
    sink: LogSink,
    state: ProcessState,
    pid: Option<u32>,
    pgid: Option<i32>,
    exit_code: Option<i32>,
    message: Option<String>,
    restart_attempts: u32,
    restart_pending: bool,
    // Bumped on every spawn so events from a previous incarnation are ignored.
    generation: u64,
}

impl ProcessEntry {
    fn status(&self) -> ProcessStatus {
        ProcessStatus {
            role: self.template.role,
            state: self.state,
            pid: self.pid,
            exit_code: self.exit_code,
            restart_attempts: self.restart_attempts,
            message: self.message.clone(),
        }
    }
}

/// Owns the agent and server children for the lifetime of `tandem up`.
///
/// All state changes happen on the task running [`Supervisor::run`]; spawned
/// helper tasks (exit waiters, readiness probes, restart timers) only report
/// back through the event channel.
pub struct Supervisor {
    entries: BTreeMap<ProcessRole, ProcessEntry>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    opts: SupervisorOptions,
    run_lock: Option<RunLock>,
}

impl Supervisor {
    pub fn new(
        children: Vec<(ProcessTemplate, LogSink)>,
        opts: SupervisorOptions,
        run_lock: Option<RunLock>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let entries = children
            .into_iter()
            .map(|(template, sink)| {
                (
                    template.role,
                    ProcessEntry {
                        template,
                        sink,
                        state: ProcessState::Stopped,
                        pid: None,
                        pgid: None,
                        exit_code: None,
                        message: None,
                        restart_attempts: 0,
                        restart_pending: false,
                        generation: 0,
                    },
                )
            })
            .collect();

        Self {
            entries,
            events_tx,
            events_rx,
            opts,
            run_lock,
        }
    }

    pub fn statuses(&self) -> Vec<ProcessStatus> {
        self.entries.values().map(ProcessEntry::status).collect()
    }

    /// Starts every child in role order, each only after the previous one is
    /// ready, then supervises until `shutdown` resolves or all children are
    /// gone for good.
    ///
    /// Startup is all-or-nothing: if a child fails to spawn, exits early or
    /// misses its readiness budget, everything already started is stopped and
    /// the error is returned.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<Outcome> {
        tokio::pin!(shutdown);

        let roles: Vec<ProcessRole> = ProcessRole::ALL
            .into_iter()
            .filter(|r| self.entries.contains_key(r))
            .collect();

        for role in roles {
            if let Err(err) = self.spawn(role) {
                self.shutdown_all().await;
                return Err(err);
            }

            loop {
                if self.state_of(role) == Some(ProcessState::Ready) {
                    break;
                }
                tokio::select! {
                    Some(ev) = self.events_rx.recv() => {
                        if let Err(err) = self.startup_event(role, ev) {
                            self.shutdown_all().await;
                            return Err(err);
                        }
                    }
                    _ = &mut shutdown => {
                        tracing::info!("shutdown requested during startup");
                        self.shutdown_all().await;
                        return Ok(Outcome::Stopped);
                    }
                }
            }
        }

        tracing::info!(
            children = self.entries.len(),
            "all processes ready; waiting for Ctrl-C or SIGTERM"
        );

        loop {
            if self.all_settled() {
                let crashed = self
                    .entries
                    .values()
                    .any(|e| e.state == ProcessState::Crashed);
                tracing::warn!(crashed, "every supervised process has exited");
                self.flush_logs().await;
                return Ok(Outcome::AllExited { crashed });
            }

            tokio::select! {
                Some(ev) = self.events_rx.recv() => self.handle_event(ev),
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("shutting down");
        self.shutdown_all().await;
        tracing::info!("stopped");
        Ok(Outcome::Stopped)
    }

    fn state_of(&self, role: ProcessRole) -> Option<ProcessState> {
        self.entries.get(&role).map(|e| e.state)
    }

    fn all_settled(&self) -> bool {
        self.entries
            .values()
            .all(|e| e.state.is_terminal() && !e.restart_pending)
    }

    /// Handles an event while `waiting_for` has not reported ready yet.
    fn startup_event(&mut self, waiting_for: ProcessRole, ev: Event) -> anyhow::Result<()> {
        match ev {
            Event::NotReady { role, generation } if role == waiting_for => {
                let Some(e) = self.entries.get(&role) else {
                    return Ok(());
                };
                if e.generation != generation {
                    return Ok(());
                }
                Err(TandemError::ReadinessTimeout {
                    role,
                    target: e.template.readiness.to_string(),
                    timeout_ms: self.opts.probe.timeout.as_millis(),
                }
                .into())
            }
            Event::Exited {
                role,
                generation,
                exit_code,
                runtime,
                wait_error,
            } if role == waiting_for => {
                // No restart before the first ready signal: a child that dies
                // during startup is a configuration problem, not a blip.
                self.on_exit(role, generation, exit_code, runtime, wait_error, false);
                match self.entries.get(&role) {
                    Some(e) if e.generation == generation && e.state.is_terminal() => {
                        Err(TandemError::ExitedBeforeReady {
                            role,
                            exit_code: e.exit_code,
                            log: role.log_file_name().to_string(),
                        }
                        .into())
                    }
                    _ => Ok(()),
                }
            }
            other => {
                self.handle_event(other);
                Ok(())
            }
        }
    }

    fn spawn(&mut self, role: ProcessRole) -> anyhow::Result<()> {
        let tx = self.events_tx.clone();
        let probe = self.opts.probe;
        let e = self
            .entries
            .get_mut(&role)
            .ok_or_else(|| anyhow::anyhow!("no template for {role}"))?;

        e.generation = e.generation.saturating_add(1);
        let generation = e.generation;
        e.sink
            .note(format!("start {}: {}", role, e.template.display_command()));

        let mut spawned = match launcher::spawn_child(&e.template, &e.sink) {
            Ok(s) => s,
            Err(err) => {
                e.state = ProcessState::Crashed;
                e.message = Some(format!("{err:#}"));
                e.sink.note(format!("start failed: {err:#}"));
                return Err(err);
            }
        };

        e.pid = spawned.pid;
        e.pgid = spawned.pgid;
        e.exit_code = None;
        e.state = ProcessState::Starting;
        e.message = Some(format!("waiting for {}", e.template.readiness));
        tracing::info!(%role, pid = ?spawned.pid, generation, "started");

        let started = tokio::time::Instant::now();
        let exit_tx = tx.clone();
        tokio::spawn(async move {
            let res = spawned.child.wait().await;
            spawned.drain_output().await;
            let (exit_code, wait_error) = match res {
                Ok(status) => (Some(exit_code_of(&status)), None),
                Err(err) => (None, Some(err.to_string())),
            };
            let _ = exit_tx.send(Event::Exited {
                role,
                generation,
                exit_code,
                runtime: started.elapsed(),
                wait_error,
            });
        });

        match e.template.readiness.clone() {
            Readiness::Immediate => {
                e.state = ProcessState::Ready;
                e.message = None;
            }
            check => {
                tokio::spawn(async move {
                    let ok = readiness::wait_ready(&check, probe).await;
                    let ev = if ok {
                        Event::Ready { role, generation }
                    } else {
                        Event::NotReady { role, generation }
                    };
                    let _ = tx.send(ev);
                });
            }
        }

        self.persist();
        Ok(())
    }

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Exited {
                role,
                generation,
                exit_code,
                runtime,
                wait_error,
            } => self.on_exit(role, generation, exit_code, runtime, wait_error, true),
            Event::Ready { role, generation } => {
                let Some(e) = self.entries.get_mut(&role) else {
                    return;
                };
                if e.generation != generation || e.state != ProcessState::Starting {
                    return;
                }
                e.state = ProcessState::Ready;
                e.message = None;
                e.sink.note(format!("{role} ready"));
                tracing::info!(%role, pid = ?e.pid, "ready");
                self.persist();
            }
            Event::NotReady { role, generation } => {
                let Some(e) = self.entries.get_mut(&role) else {
                    return;
                };
                if e.generation != generation || e.state != ProcessState::Starting {
                    return;
                }
                // Past startup the child is kept; it may still come up.
                e.message = Some(format!("not ready after {}", e.template.readiness));
                tracing::warn!(%role, probe = %e.template.readiness, "readiness probe timed out");
            }
            Event::RestartDue { role, generation } => {
                let Some(e) = self.entries.get_mut(&role) else {
                    return;
                };
                // Cancelled by shutdown, or superseded by a newer incarnation.
                if e.generation != generation || !e.restart_pending {
                    return;
                }
                e.restart_pending = false;
                if let Err(err) = self.spawn(role) {
                    tracing::error!(%role, error = %format!("{err:#}"), "restart failed");
                }
            }
        }
    }

    fn on_exit(
        &mut self,
        role: ProcessRole,
        generation: u64,
        exit_code: Option<i32>,
        runtime: Duration,
        wait_error: Option<String>,
        allow_restart: bool,
    ) {
        let restart = self.opts.restart;
        let tx = self.events_tx.clone();
        let Some(e) = self.entries.get_mut(&role) else {
            return;
        };
        if e.generation != generation {
            return;
        }

        let stopping = e.state == ProcessState::Stopping;
        e.pid = None;
        e.pgid = None;
        e.exit_code = exit_code;

        if stopping {
            e.state = ProcessState::Stopped;
            e.message = Some("stopped".to_string());
        } else {
            let clean = wait_error.is_none() && exit_code == Some(0);
            if clean {
                e.state = ProcessState::Stopped;
                e.message = Some("exited".to_string());
                tracing::info!(%role, runtime_ms = runtime.as_millis() as u64, "process exited on its own");
            } else {
                e.state = ProcessState::Crashed;
                e.message = Some(match (&wait_error, exit_code) {
                    (Some(err), _) => format!("wait failed: {err}"),
                    (None, Some(code)) => format!("exited with code {code}"),
                    (None, None) => "exited".to_string(),
                });
                tracing::warn!(
                    %role,
                    exit_code = ?exit_code,
                    runtime_ms = runtime.as_millis() as u64,
                    "process crashed"
                );
            }

            if allow_restart && restart.should_restart(exit_code, e.restart_attempts) {
                e.restart_attempts = e.restart_attempts.saturating_add(1);
                e.restart_pending = true;
                let attempt = e.restart_attempts;
                let delay = restart.backoff(attempt);
                e.message = Some(format!(
                    "restarting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt,
                    restart.max_retries
                ));
                e.sink.note(format!(
                    "restart scheduled in {}ms (attempt {attempt})",
                    delay.as_millis()
                ));
                tracing::info!(%role, attempt, delay_ms = delay.as_millis() as u64, "restart scheduled");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Event::RestartDue { role, generation });
                });
            }
        }

        e.sink.note(format!(
            "{role} exited: state={:?} exit_code={:?} runtime_ms={}",
            e.state,
            exit_code,
            runtime.as_millis()
        ));
        self.persist();
    }

    /// SIGTERM every live child, then SIGKILL whatever is left after the grace
    /// period. Children that already exited are skipped silently.
    async fn shutdown_all(&mut self) {
        for (role, e) in self.entries.iter_mut() {
            e.restart_pending = false;
            if !matches!(e.state, ProcessState::Starting | ProcessState::Ready) {
                continue;
            }
            e.state = ProcessState::Stopping;
            e.message = Some("stopping".to_string());
            e.sink.note("stop requested");
            if let Some(pgid) = e.pgid {
                match signals::terminate_group(pgid) {
                    Ok(true) => tracing::info!(%role, pid = ?e.pid, "sent SIGTERM"),
                    Ok(false) => tracing::debug!(%role, "already gone"),
                    Err(err) => tracing::warn!(%role, %err, "SIGTERM failed"),
                }
            }
        }
        self.persist();

        let mut deadline = tokio::time::Instant::now() + self.opts.stop_grace;
        let mut escalated = false;
        while self
            .entries
            .values()
            .any(|e| e.state == ProcessState::Stopping)
        {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(ev @ Event::Exited { .. })) => self.handle_event(ev),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) if !escalated => {
                    escalated = true;
                    for (role, e) in self.entries.iter_mut() {
                        if e.state != ProcessState::Stopping {
                            continue;
                        }
                        if let Some(pgid) = e.pgid {
                            tracing::warn!(%role, pid = ?e.pid, "did not stop in time; sending SIGKILL");
                            e.sink.note("sent SIGKILL (timeout)");
                            if let Err(err) = signals::kill_group(pgid) {
                                tracing::warn!(%role, %err, "SIGKILL failed");
                            }
                        }
                    }
                    deadline = tokio::time::Instant::now() + KILL_SETTLE;
                }
                Err(_) => {
                    tracing::error!("children did not report exit after SIGKILL");
                    break;
                }
            }
        }

        self.flush_logs().await;
    }

    async fn flush_logs(&self) {
        for e in self.entries.values() {
            e.sink.flush().await;
        }
    }

    fn persist(&mut self) {
        let Some(lock) = self.run_lock.as_mut() else {
            return;
        };
        let children = self
            .entries
            .values()
            .map(|e| RunChild {
                role: e.template.role,
                pid: e.pid,
                state: e.state,
            })
            .collect();
        if let Err(err) = lock.update(children) {
            tracing::warn!(error = %format!("{err:#}"), "failed to update run file");
        }
    }
}
