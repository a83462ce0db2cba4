use anyhow::{Context, Result};
use comfy_table::Table;
use comfy_table::presets::UTF8_FULL;
use futures::future::join_all;
use libbackup::report::{EXIT_CONFIG, EXIT_INTERNAL, EXIT_OK, EXIT_VERIFICATION};
use libbackup::{Artifact, BackupError, ConfigError, Orchestrator, RetentionPlan, VerifyOutcome};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{JobConfig, RkbakConfig, load_config};

/// Run the selected subcommand and return the process exit code.
pub async fn dispatch(cli: Cli) -> i32 {
    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e:#}");
            return EXIT_CONFIG;
        }
    };
    if let Err(e) = cfg.validate() {
        error!("invalid config {}: {e}", cli.config.display());
        return EXIT_CONFIG;
    }
    for warning in cfg.warnings() {
        warn!("{warning}");
    }

    let result = match &cli.command {
        Commands::Run { jobs } => run(&cfg, jobs).await,
        Commands::List { job } => list(&cfg, job).await,
        Commands::Verify { job } => verify(&cfg, job).await,
        Commands::Plan { job } => plan(&cfg, job).await,
    };
    result.unwrap_or_else(|e| {
        error!("{e:#}");
        if e.downcast_ref::<ConfigError>().is_some() {
            EXIT_CONFIG
        } else {
            EXIT_INTERNAL
        }
    })
}

fn select<'a>(cfg: &'a RkbakConfig, names: &[String]) -> Result<Vec<&'a JobConfig>, ConfigError> {
    if names.is_empty() {
        return Ok(cfg.jobs.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            cfg.job(name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown job {name}")))
        })
        .collect()
}

fn orchestrator(cfg: &RkbakConfig, name: &str) -> Result<Orchestrator> {
    let job = select(cfg, &[name.to_string()])?.remove(0);
    Ok(Orchestrator::new(job.to_spec()?, cfg.backends(job)))
}

async fn run(cfg: &RkbakConfig, names: &[String]) -> Result<i32> {
    let jobs = select(cfg, names)?;
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(shutdown_signal(cancel.clone()));

    let codes = join_all(jobs.into_iter().map(|job| run_job(cfg, job, &cancel))).await;

    watcher.abort();
    Ok(codes.into_iter().max().unwrap_or(EXIT_OK))
}

async fn run_job(cfg: &RkbakConfig, job: &JobConfig, cancel: &CancellationToken) -> i32 {
    let spec = match job.to_spec() {
        Ok(spec) => spec,
        Err(e) => {
            error!(job = %job.name, "{e}");
            return EXIT_CONFIG;
        }
    };
    let orchestrator = Orchestrator::new(spec, cfg.backends(job));
    let code = match orchestrator.run(cancel).await {
        Ok(report) => {
            println!("{report}");
            report.exit_code()
        }
        Err(BackupError::Config(e)) => {
            error!(job = %job.name, "{e}");
            EXIT_CONFIG
        }
        Err(e) => {
            error!(job = %job.name, "run aborted: {e}");
            EXIT_INTERNAL
        }
    };
    // failures are already logged by the orchestrator
    let detached = orchestrator.drain_detached().await;
    if !detached.is_empty() {
        info!(job = %job.name, pushes = detached.len(), "detached syncs finished");
    }
    code
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("shutdown requested, cancelling in-flight runs");
    cancel.cancel();
}

async fn list(cfg: &RkbakConfig, name: &str) -> Result<i32> {
    let catalog = orchestrator(cfg, name)?
        .catalog()
        .await
        .with_context(|| format!("Failed to load catalog of job {name}"))?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec![
        "id", "created", "tier", "kind", "base", "status", "size", "digest", "location",
    ]);
    for artifact in catalog.entries() {
        table.add_row(artifact_row(artifact));
    }
    println!("{table}");
    Ok(EXIT_OK)
}

fn artifact_row(artifact: &Artifact) -> Vec<String> {
    let digest = artifact
        .digest
        .strip_prefix("sha256:")
        .map(|hex| hex.chars().take(12).collect())
        .unwrap_or_else(|| artifact.digest.clone());
    let location = match &artifact.failure {
        Some(reason) => format!("{} ({reason})", artifact.location),
        None => artifact.location.clone(),
    };
    vec![
        artifact.id.to_string(),
        artifact.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        artifact.tier.to_string(),
        artifact.kind.to_string(),
        artifact
            .based_on
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string()),
        artifact.status.to_string(),
        artifact.size_bytes.to_string(),
        digest,
        location,
    ]
}

async fn verify(cfg: &RkbakConfig, name: &str) -> Result<i32> {
    let audit = orchestrator(cfg, name)?
        .audit()
        .await
        .with_context(|| format!("Failed to audit job {name}"))?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["id", "result", "location"]);
    let mut bad = 0;
    for entry in &audit {
        let result = match &entry.outcome {
            Ok(VerifyOutcome::Match) => "ok".to_string(),
            Ok(VerifyOutcome::Mismatch { actual, .. }) => format!("MISMATCH ({actual})"),
            Err(reason) => format!("ERROR ({reason})"),
        };
        if !entry.is_ok() {
            bad += 1;
            warn!(job = name, artifact = %entry.id, "integrity check failed: {result}");
        }
        table.add_row(vec![entry.id.to_string(), result, entry.location.clone()]);
    }
    println!("{table}");
    println!("{} verified, {bad} failed", audit.len() - bad);
    Ok(if bad == 0 { EXIT_OK } else { EXIT_VERIFICATION })
}

async fn plan(cfg: &RkbakConfig, name: &str) -> Result<i32> {
    let orchestrator = orchestrator(cfg, name)?;
    let catalog = orchestrator.catalog().await?;
    let plan = orchestrator.plan().await?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["id", "created", "tier", "kind", "action"]);
    for artifact in catalog.entries().iter().filter(|a| a.is_verified()) {
        table.add_row(vec![
            artifact.id.to_string(),
            artifact.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            artifact.tier.to_string(),
            artifact.kind.to_string(),
            action(&plan, artifact).to_string(),
        ]);
    }
    println!("{table}");
    println!(
        "keep {}, delete {}, deferred {}",
        plan.keep.len(),
        plan.delete.len(),
        plan.deferred.len()
    );
    Ok(EXIT_OK)
}

fn action(plan: &RetentionPlan, artifact: &Artifact) -> &'static str {
    if plan.delete.contains(&artifact.id) {
        "delete"
    } else if plan.deferred.contains(&artifact.id) {
        "deferred"
    } else {
        "keep"
    }
}
