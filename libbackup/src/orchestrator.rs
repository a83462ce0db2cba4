//! Sequencing of a single backup run.
//!
//! ```text
//! IDLE -> LOCKED -> PRODUCING -> VERIFYING -> CATALOGING -> RETAINING -> SYNCING -> DONE
//!   |                   |            |
//!   +-> DONE (busy)     +-> FAILED   +-> FAILED
//! ```
//!
//! The orchestrator is the only component with side effects; everything else
//! is either a pure function or a collaborator it calls. A failed or cancelled
//! production or verification never reaches the retention pass, so older good
//! backups are untouched. Once the lease is held it is released on every exit
//! path; its expiry covers a crashed process.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{ArtifactDraft, Catalog, CatalogStore};
use crate::clock::Clock;
use crate::error::{BackupError, ConfigError};
use crate::lock::{Acquired, LockManager};
use crate::model::{Artifact, ArtifactId, Kind};
use crate::producer::{ArchiveProducer, ProduceRequest};
use crate::remote::{RemoteSync, SyncMode};
use crate::report::{FailureStage, RunOutcome, RunReport, SyncResult, Verification};
use crate::retention::{RetentionPlan, RetentionPolicy, evaluate};
use crate::schedule::{Schedule, decide_tier};
use crate::verify::{AuditEntry, IntegrityVerifier, verify_artifact};

/// Everything that identifies and parameterises one backup job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: String,
    pub source_path: String,
    pub policy: RetentionPolicy,
    pub schedule: Schedule,
    /// Start a fresh FULL once the current chain holds this many artifacts.
    pub max_chain_length: Option<u32>,
    pub sync_mode: SyncMode,
}

impl JobSpec {
    pub fn new(job_id: impl Into<String>, source_path: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            source_path: source_path.into(),
            policy: RetentionPolicy::gfs(),
            schedule: Schedule::default(),
            max_chain_length: None,
            sync_mode: SyncMode::Inline,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_id.trim().is_empty() {
            return Err(ConfigError::EmptyJobName);
        }
        if self.source_path.trim().is_empty() {
            return Err(ConfigError::EmptySource(self.job_id.clone()));
        }
        if self.max_chain_length == Some(0) {
            return Err(ConfigError::ZeroChainLength);
        }
        self.policy.validate()
    }
}

/// Collaborators an orchestrator drives. Cheap to clone; jobs may share them.
#[derive(Clone)]
pub struct Backends {
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<dyn LockManager>,
    pub catalogs: Arc<dyn CatalogStore>,
    pub producer: Arc<dyn ArchiveProducer>,
    pub verifier: Arc<dyn IntegrityVerifier>,
    pub remote: Option<Arc<dyn RemoteSync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Locked,
    Producing,
    Verifying,
    Cataloging,
    Retaining,
    Syncing,
    Done,
    Failed,
}

impl RunState {
    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Locked)
                | (Idle, Done)
                | (Locked, Producing)
                | (Producing, Verifying)
                | (Producing, Failed)
                | (Verifying, Cataloging)
                | (Verifying, Failed)
                | (Cataloging, Retaining)
                | (Retaining, Syncing)
                | (Syncing, Done)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "IDLE",
            RunState::Locked => "LOCKED",
            RunState::Producing => "PRODUCING",
            RunState::Verifying => "VERIFYING",
            RunState::Cataloging => "CATALOGING",
            RunState::Retaining => "RETAINING",
            RunState::Syncing => "SYNCING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

struct StateTracker<'a> {
    job_id: &'a str,
    state: RunState,
}

impl<'a> StateTracker<'a> {
    fn new(job_id: &'a str) -> Self {
        Self {
            job_id,
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal run state transition {} -> {}",
            self.state,
            next
        );
        debug!(job = self.job_id, from = %self.state, to = %next, "run state");
        self.state = next;
    }
}

struct Cancelled;

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, Cancelled> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        out = fut => Ok(out),
    }
}

pub struct Orchestrator {
    job: JobSpec,
    backends: Backends,
    detached: Mutex<JoinSet<SyncResult>>,
}

impl Orchestrator {
    pub fn new(job: JobSpec, backends: Backends) -> Self {
        Self {
            job,
            backends,
            detached: Mutex::new(JoinSet::new()),
        }
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    /// Execute one run. Production and verification failures are reported in
    /// the returned [`RunReport`]; `Err` means the run could not even be
    /// attempted or the catalog/lock storage failed underneath it.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport, BackupError> {
        self.job.validate()?;
        let job_id = self.job.job_id.as_str();
        let mut tracker = StateTracker::new(job_id);

        let lease = match self.backends.locks.acquire(job_id).await? {
            Acquired::Lease(lease) => lease,
            Acquired::Busy { holder } => {
                match holder {
                    Some(h) => info!(
                        job = job_id,
                        holder_pid = h.pid,
                        holder_host = %h.host,
                        expires_at = %h.expires_at,
                        "another run holds the lease, skipping"
                    ),
                    None => info!(job = job_id, "lease is held, skipping"),
                }
                tracker.advance(RunState::Done);
                let report = RunReport::skipped(job_id);
                info!(job = job_id, "{report}");
                return Ok(report);
            }
        };
        tracker.advance(RunState::Locked);

        let result = self.run_locked(&mut tracker, cancel).await;
        if let Err(e) = self.backends.locks.release(lease).await {
            error!(job = job_id, "failed to release lease, it will expire on its own: {e}");
        }

        let report = result?;
        info!(job = job_id, "{report}");
        Ok(report)
    }

    async fn run_locked(
        &self,
        tracker: &mut StateTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, BackupError> {
        let job = &self.job;
        let mut catalog = self.backends.catalogs.load(&job.source_path).await?;
        let now = self.backends.clock.now();
        let tier = decide_tier(now, &job.schedule);
        let (kind, base) = self.decide_kind(&catalog);

        let mut report = RunReport::new(&job.job_id);
        report.tier = Some(tier);
        report.kind = Some(kind);
        info!(
            job = %job.job_id,
            %tier,
            %kind,
            base = ?base.map(|b| b.id.0),
            "starting backup of {}",
            job.source_path
        );

        let draft = ArtifactDraft {
            job_id: job.job_id.clone(),
            tier,
            kind,
            created_at: now,
            location: String::new(),
            size_bytes: 0,
            based_on: base.map(|b| b.id),
        };
        let request = ProduceRequest {
            job_id: job.job_id.clone(),
            source_path: job.source_path.clone(),
            kind,
            base_location: base.map(|b| b.location.clone()),
            base_created_at: base.map(|b| b.created_at),
            started_at: now,
            cancel: cancel.clone(),
        };

        tracker.advance(RunState::Producing);
        let produced = match cancellable(cancel, self.backends.producer.produce(&request)).await {
            Ok(Ok(produced)) => produced,
            Ok(Err(e)) => {
                let reason = format!("{e:#}");
                return self
                    .fail_production(tracker, &mut catalog, draft, report, reason)
                    .await;
            }
            Err(Cancelled) => {
                let reason = "cancelled during production".to_string();
                return self
                    .fail_production(tracker, &mut catalog, draft, report, reason)
                    .await;
            }
        };

        let id = catalog.insert_pending(ArtifactDraft {
            location: produced.location.clone(),
            size_bytes: produced.size_bytes,
            ..draft
        })?;
        self.backends.catalogs.save(&catalog).await?;
        report.artifact_id = Some(id);

        tracker.advance(RunState::Verifying);
        let checked = match cancellable(cancel, self.backends.verifier.digest(&produced.location))
            .await
        {
            Ok(Ok(digest)) if digest.is_empty() => {
                Err("verifier returned an empty digest".to_string())
            }
            Ok(Ok(digest)) => match &produced.digest {
                Some(expected) if *expected != digest => Err(format!(
                    "digest mismatch: producer reported {expected}, verifier computed {digest}"
                )),
                _ => Ok(digest),
            },
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(Cancelled) => Err("cancelled during verification".to_string()),
        };
        let digest = match checked {
            Ok(digest) => digest,
            Err(reason) => {
                error!(job = %job.job_id, artifact = %id, "verification failed: {reason}");
                catalog.mark_failed(id, reason.clone())?;
                self.backends.catalogs.save(&catalog).await?;
                tracker.advance(RunState::Failed);
                report.verification = Verification::Failed(reason);
                report.outcome = RunOutcome::Failed(FailureStage::Verification);
                return Ok(report);
            }
        };

        tracker.advance(RunState::Cataloging);
        catalog.mark_verified(id, digest.clone())?;
        self.backends.catalogs.save(&catalog).await?;
        report.verification = Verification::Verified(digest);

        tracker.advance(RunState::Retaining);
        self.apply_retention(&mut catalog, &mut report).await?;

        tracker.advance(RunState::Syncing);
        report.sync = self.dispatch_sync(&produced.location, id).await;

        tracker.advance(RunState::Done);
        Ok(report)
    }

    fn decide_kind<'c>(&self, catalog: &'c Catalog) -> (Kind, Option<&'c Artifact>) {
        let Some(latest) = catalog.latest_verified() else {
            return (Kind::Full, None);
        };
        if let Some(max) = self.job.max_chain_length {
            let length = catalog.chain_length(latest.id);
            if length >= max as usize {
                debug!(job = %self.job.job_id, length, max, "chain is full, starting a new full backup");
                return (Kind::Full, None);
            }
        }
        (Kind::Incremental, Some(latest))
    }

    async fn fail_production(
        &self,
        tracker: &mut StateTracker<'_>,
        catalog: &mut Catalog,
        draft: ArtifactDraft,
        mut report: RunReport,
        reason: String,
    ) -> Result<RunReport, BackupError> {
        error!(job = %self.job.job_id, "archive production failed: {reason}");
        let id = catalog.record_failed_production(draft, reason)?;
        self.backends.catalogs.save(catalog).await?;
        tracker.advance(RunState::Failed);
        report.artifact_id = Some(id);
        report.outcome = RunOutcome::Failed(FailureStage::Production);
        Ok(report)
    }

    /// Delete what the plan marks. The file goes first; the catalog entry is
    /// only marked DELETED once the file is gone.
    async fn apply_retention(
        &self,
        catalog: &mut Catalog,
        report: &mut RunReport,
    ) -> Result<(), BackupError> {
        let job_id = self.job.job_id.as_str();
        let plan = evaluate(catalog.entries(), &self.job.policy);
        let mut deferred = plan.deferred.len();
        for id in &plan.deferred {
            info!(job = job_id, artifact = %id, "retention deferred: artifact is the base of a live incremental");
        }

        for id in plan.delete {
            if catalog.live_dependents(id).next().is_some() {
                info!(job = job_id, artifact = %id, "retention deferred: artifact is the base of a live incremental");
                deferred += 1;
                continue;
            }
            let Some(location) = catalog.get(id).map(|a| a.location.clone()) else {
                continue;
            };
            match self.backends.producer.delete(&location).await {
                Ok(()) => {
                    catalog.mark_deleted(id)?;
                    self.backends.catalogs.save(catalog).await?;
                    report.deleted += 1;
                    info!(job = job_id, artifact = %id, "pruned {location}");
                }
                Err(e) => {
                    warn!(job = job_id, artifact = %id, "failed to delete {location}, will retry next run: {e:#}");
                    report.delete_failures += 1;
                }
            }
        }
        report.deferred = deferred;
        Ok(())
    }

    async fn dispatch_sync(&self, location: &str, id: ArtifactId) -> SyncResult {
        let Some(remote) = self.backends.remote.clone() else {
            return SyncResult::NotConfigured;
        };
        let job_id = self.job.job_id.clone();
        match self.job.sync_mode {
            SyncMode::Inline => push_logged(remote, &job_id, id, location).await,
            SyncMode::Detached => {
                let location = location.to_string();
                self.detached
                    .lock()
                    .await
                    .spawn(async move { push_logged(remote, &job_id, id, &location).await });
                SyncResult::Dispatched
            }
        }
    }

    /// Wait for every detached push this orchestrator started.
    pub async fn drain_detached(&self) -> Vec<SyncResult> {
        let mut pending = self.detached.lock().await;
        let mut results = Vec::new();
        while let Some(joined) = pending.join_next().await {
            results.push(joined.unwrap_or_else(|e| SyncResult::Failed(format!("sync task aborted: {e}"))));
        }
        results
    }

    pub async fn catalog(&self) -> Result<Catalog, BackupError> {
        Ok(self.backends.catalogs.load(&self.job.source_path).await?)
    }

    /// What retention would do right now, without touching anything.
    pub async fn plan(&self) -> Result<RetentionPlan, BackupError> {
        self.job.validate()?;
        let catalog = self.catalog().await?;
        Ok(evaluate(catalog.entries(), &self.job.policy))
    }

    /// Re-verify every VERIFIED artifact against its stored digest. Read-only.
    pub async fn audit(&self) -> Result<Vec<AuditEntry>, BackupError> {
        let catalog = self.catalog().await?;
        let mut entries = Vec::new();
        for artifact in catalog.entries().iter().filter(|a| a.is_verified()) {
            let outcome = verify_artifact(self.backends.verifier.as_ref(), artifact)
                .await
                .map_err(|e| format!("{e:#}"));
            entries.push(AuditEntry {
                id: artifact.id,
                location: artifact.location.clone(),
                outcome,
            });
        }
        Ok(entries)
    }
}

async fn push_logged(
    remote: Arc<dyn RemoteSync>,
    job_id: &str,
    id: ArtifactId,
    location: &str,
) -> SyncResult {
    match remote.push(location).await {
        Ok(()) => {
            info!(job = job_id, artifact = %id, "artifact pushed to remote");
            SyncResult::Pushed
        }
        Err(e) => {
            warn!(job = job_id, artifact = %id, "remote sync failed: {e:#}");
            SyncResult::Failed(format!("{e:#}"))
        }
    }
}
