use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use tandem::{
    app,
    config::{self, Settings},
    error::TandemError,
    log_view, port_reclaim, signals, status,
    supervisor::SupervisorOptions,
    templates::{LaunchSettings, ReadinessMode},
};
use tandem_process::{ProcessRole, RestartConfig, RestartPolicy};

/// Boots the agent worker and the API server from one checkout.
#[derive(Parser, Debug)]
#[command(name = "tandem", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct PathArgs {
    /// Project checkout holding .env, the scripts and the log files
    #[arg(long, global = true, env = "TANDEM_WORKDIR", default_value = ".")]
    workdir: PathBuf,

    /// Credentials file
    #[arg(long, global = true, env = "TANDEM_ENV_FILE", default_value = ".env")]
    env_file: PathBuf,

    /// Copied to --env-file when that is missing
    #[arg(long, global = true, env = "TANDEM_ENV_TEMPLATE", default_value = ".env.example")]
    env_template: PathBuf,

    /// Virtual environment directory
    #[arg(long, global = true, env = "TANDEM_VENV", default_value = "venv")]
    venv: PathBuf,

    /// Interpreter used to create the virtual environment
    #[arg(long, global = true, env = "TANDEM_PYTHON", default_value = "python3")]
    python: String,

    /// Dependency manifest installed into the virtual environment
    #[arg(long, global = true, env = "TANDEM_MANIFEST", default_value = "requirements.txt")]
    manifest: PathBuf,
}

impl PathArgs {
    fn settings(&self) -> anyhow::Result<Settings> {
        let workdir = std::path::absolute(&self.workdir)?;
        Ok(Settings {
            workdir,
            env_file: self.env_file.clone(),
            env_template: self.env_template.clone(),
            venv: self.venv.clone(),
            python: self.python.clone(),
            manifest: self.manifest.clone(),
        })
    }
}

#[derive(Args, Debug, Clone)]
struct LaunchArgs {
    #[arg(long, env = "TANDEM_AGENT_SCRIPT", default_value = "agent.py")]
    agent_script: PathBuf,

    /// Mode argument passed to the agent script
    #[arg(long, env = "TANDEM_AGENT_MODE", default_value = "dev")]
    agent_mode: String,

    #[arg(long, env = "TANDEM_SERVER_SCRIPT", default_value = "server.py")]
    server_script: PathBuf,

    #[arg(long, env = "TANDEM_AGENT_HEALTH_URL", default_value = "http://127.0.0.1:8081/")]
    agent_health_url: String,

    #[arg(long, env = "TANDEM_SERVER_HEALTH_URL", default_value = "http://127.0.0.1:8001/health")]
    server_health_url: String,

    /// How to decide a started process is ready
    #[arg(long, env = "TANDEM_READINESS", value_enum, default_value_t = ReadinessMode::Probe)]
    readiness: ReadinessMode,
}

impl From<LaunchArgs> for LaunchSettings {
    fn from(a: LaunchArgs) -> Self {
        LaunchSettings {
            agent_script: a.agent_script,
            agent_mode: a.agent_mode,
            server_script: a.server_script,
            agent_health_url: a.agent_health_url,
            server_health_url: a.server_health_url,
            readiness: a.readiness,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct RestartArgs {
    /// off | on-failure | always
    #[arg(long = "restart", env = "TANDEM_RESTART", default_value = "off")]
    policy: RestartPolicy,

    #[arg(long, env = "TANDEM_RESTART_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    #[arg(long, env = "TANDEM_RESTART_BACKOFF_MS", default_value_t = 1000)]
    backoff_ms: u64,

    #[arg(long, env = "TANDEM_RESTART_BACKOFF_MAX_MS", default_value_t = 30_000)]
    backoff_max_ms: u64,
}

impl From<RestartArgs> for RestartConfig {
    fn from(a: RestartArgs) -> Self {
        RestartConfig {
            policy: a.policy,
            max_retries: a.max_retries,
            backoff_ms: a.backoff_ms,
            backoff_max_ms: a.backoff_max_ms,
        }
        .clamped()
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the agent and then the server in the background, logging to
    /// agent.log / server.log, until interrupted
    Up {
        #[command(flatten)]
        launch: LaunchArgs,

        #[command(flatten)]
        restart: RestartArgs,
    },

    /// Run one process in the foreground
    Run {
        /// agent | server
        role: ProcessRole,

        /// Also append the output to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Check the credentials file and install dependencies, then exit
    Install {
        /// Install even if the manifest did not change
        #[arg(long)]
        reinstall: bool,
    },

    /// Show the end of a log file
    Logs {
        /// agent | server | path to a log file
        target: String,

        #[arg(short = 'n', long, default_value_t = config::DEFAULT_TAIL_LINES)]
        lines: usize,

        /// Keep printing new lines until interrupted
        #[arg(short, long)]
        follow: bool,
    },

    /// Terminate whatever is listening on the server port
    ReclaimPort {
        #[arg(long, default_value_t = config::DEFAULT_SERVER_PORT)]
        port: u16,

        /// Only terminate listeners whose command line contains this
        #[arg(long, default_value = "server.py")]
        expect: String,

        /// Terminate listeners that do not match --expect too
        #[arg(long)]
        force: bool,
    },

    /// Show whether tandem and its processes are running
    Status {
        #[arg(long, env = "TANDEM_SERVER_HEALTH_URL", default_value = "http://127.0.0.1:8001/health")]
        health_url: String,
    },

    /// Stop a running `tandem up`
    Stop,
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let settings = cli.paths.settings()?;

    match cli.command {
        Command::Up { launch, restart } => {
            let opts = SupervisorOptions {
                restart: restart.into(),
                ..SupervisorOptions::default()
            };
            app::up(&settings, &launch.into(), opts, signals::shutdown_signal()).await
        }
        Command::Run {
            role,
            log_file,
            launch,
        } => {
            app::run_single(
                &settings,
                &launch.into(),
                role,
                log_file,
                SupervisorOptions::default(),
                signals::shutdown_signal(),
            )
            .await
        }
        Command::Install { reinstall } => {
            let (venv, _) = app::prepare(&settings, reinstall).await?;
            println!("environment ready: {}", venv.root().display());
            Ok(0)
        }
        Command::Logs {
            target,
            lines,
            follow,
        } => {
            let path = log_view::resolve_target(&settings, &target);
            let tail = log_view::tail_lines(&path, lines).await?;
            for line in &tail.lines {
                println!("{line}");
            }
            if follow {
                log_view::follow(
                    &path,
                    tail.end,
                    &mut std::io::stdout(),
                    signals::shutdown_signal(),
                )
                .await?;
            }
            Ok(0)
        }
        Command::ReclaimPort {
            port,
            expect,
            force,
        } => {
            let opts = port_reclaim::ReclaimOptions {
                port,
                expect: Some(expect).filter(|s| !s.is_empty()),
                force,
                grace: config::reclaim_grace(),
            };
            let listeners = port_reclaim::find_listeners(port)?;
            let report =
                port_reclaim::reclaim(listeners, &opts, &port_reclaim::OsTerminator).await;
            if report.found_nothing() {
                println!("no listener on port {port}");
                return Ok(0);
            }
            for pid in &report.terminated {
                let how = if report.killed.contains(pid) {
                    "killed"
                } else {
                    "terminated"
                };
                println!("{how} pid {pid}");
            }
            for l in &report.skipped {
                println!("skipped pid {} ({})", l.pid, l.cmdline);
            }
            for (pid, err) in &report.failed {
                println!("failed pid {pid}: {err}");
            }
            Ok(if report.left_listeners() { 1 } else { 0 })
        }
        Command::Status { health_url } => {
            let report = status::status(settings.run_file(), health_url).await?;
            println!("{report}");
            Ok(if report.is_running() { 0 } else { 1 })
        }
        Command::Stop => {
            // The supervisor may spend a full grace period plus the kill
            // settle time on its children.
            let wait = config::stop_grace() + Duration::from_secs(10);
            match status::stop(settings.run_file(), wait).await? {
                status::StopOutcome::Stopped { pid } => println!("stopped tandem (pid {pid})"),
                status::StopOutcome::Stale { pid } => {
                    println!("tandem (pid {pid}) was not running; removed stale run file")
                }
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<TandemError>() {
                Some(e) => eprintln!("tandem: {e}"),
                None => eprintln!("tandem: {err:#}"),
            }
            1
        }
    };
    std::process::exit(code);
}
