use std::{future::Future, path::PathBuf};

use tandem_process::ProcessRole;

use crate::{
    bootstrap::{self, Credentials},
    config::Settings,
    deps::{self, InstallOutcome, Venv},
    launcher,
    log_file::LogSink,
    run_state::RunLock,
    supervisor::{Supervisor, SupervisorOptions},
    templates::{self, LaunchSettings},
};

/// Venv creation plus manifest install. Does not look at the credentials file.
pub async fn install_deps(settings: &Settings, reinstall: bool) -> anyhow::Result<Venv> {
    let venv = deps::ensure_venv(&settings.python, &settings.venv_dir()).await?;
    match deps::install_manifest(&venv, &settings.manifest(), reinstall).await? {
        InstallOutcome::Installed => {
            tracing::info!(venv = %venv.root().display(), "dependencies installed")
        }
        InstallOutcome::UpToDate => {}
    }
    Ok(venv)
}

/// Bootstrap plus dependency install: everything that has to hold before a
/// child may be started.
pub async fn prepare(settings: &Settings, reinstall: bool) -> anyhow::Result<(Venv, Credentials)> {
    let creds = bootstrap::ensure_env_file(&settings.env_file(), &settings.env_template())?;
    let venv = install_deps(settings, reinstall).await?;
    Ok((venv, creds))
}

/// `tandem up`: both roles in the background, each logging to its own file,
/// supervised until `shutdown` resolves. Returns the process exit code.
pub async fn up(
    settings: &Settings,
    launch: &LaunchSettings,
    opts: SupervisorOptions,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<i32> {
    // Checked before the lock so a missing `.env` never leaves state behind.
    let creds = bootstrap::ensure_env_file(&settings.env_file(), &settings.env_template())?;
    let lock = RunLock::acquire(&settings.run_file())?;
    let venv = install_deps(settings, false).await?;

    let mut children = Vec::with_capacity(ProcessRole::ALL.len());
    for role in ProcessRole::ALL {
        let log = settings.log_file(role);
        let sink = LogSink::open_file(log.clone(), false).await?;
        let template = templates::template_for(role, launch, &settings.workdir, &venv, &creds);
        tracing::info!(%role, command = %template.display_command(), log = %log.display(), readiness = %template.readiness, "configured");
        children.push((template, sink));
    }

    let outcome = Supervisor::new(children, opts, Some(lock))
        .run(shutdown)
        .await?;
    tracing::info!(?outcome, "supervisor finished");
    Ok(outcome.exit_code())
}

/// `tandem run <role>`: one child in the foreground. Output is echoed and,
/// with `log_file`, also appended there.
pub async fn run_single(
    settings: &Settings,
    launch: &LaunchSettings,
    role: ProcessRole,
    log_file: Option<PathBuf>,
    opts: SupervisorOptions,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<i32> {
    let (venv, creds) = prepare(settings, false).await?;
    let template = templates::template_for(role, launch, &settings.workdir, &venv, &creds);
    let sink = match log_file {
        Some(path) => LogSink::open_file(settings.resolve(&path), true).await?,
        None => LogSink::echo_only(),
    };
    launcher::run_foreground(&template, sink, opts.stop_grace, shutdown).await
}
