use std::fmt;

use crate::model::{ArtifactId, Kind, Tier};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_PRODUCTION: i32 = 3;
pub const EXIT_VERIFICATION: i32 = 4;
pub const EXIT_INTERNAL: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Production,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    /// Another run holds the lease for this job.
    Skipped,
    Failed(FailureStage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    NotRun,
    Verified(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    NotRun,
    NotConfigured,
    Pushed,
    /// Handed to a detached task; the outcome is logged when it completes.
    Dispatched,
    Failed(String),
}

/// Summary of one orchestrator run. `Display` renders the terminal status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub job_id: String,
    pub outcome: RunOutcome,
    pub tier: Option<Tier>,
    pub kind: Option<Kind>,
    pub artifact_id: Option<ArtifactId>,
    pub verification: Verification,
    pub deleted: usize,
    pub deferred: usize,
    pub delete_failures: usize,
    pub sync: SyncResult,
}

impl RunReport {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            outcome: RunOutcome::Done,
            tier: None,
            kind: None,
            artifact_id: None,
            verification: Verification::NotRun,
            deleted: 0,
            deferred: 0,
            delete_failures: 0,
            sync: SyncResult::NotRun,
        }
    }

    pub fn skipped(job_id: impl Into<String>) -> Self {
        Self {
            outcome: RunOutcome::Skipped,
            ..Self::new(job_id)
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed(_))
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Done | RunOutcome::Skipped => EXIT_OK,
            RunOutcome::Failed(FailureStage::Production) => EXIT_PRODUCTION,
            RunOutcome::Failed(FailureStage::Verification) => EXIT_VERIFICATION,
        }
    }
}

fn or_dash<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.outcome {
            RunOutcome::Done => "done",
            RunOutcome::Skipped => "skipped (already running)",
            RunOutcome::Failed(FailureStage::Production) => "failed (production)",
            RunOutcome::Failed(FailureStage::Verification) => "failed (verification)",
        };
        let verification = match &self.verification {
            Verification::NotRun => "-".to_string(),
            Verification::Verified(_) => "ok".to_string(),
            Verification::Failed(reason) => format!("failed: {reason}"),
        };
        let sync = match &self.sync {
            SyncResult::NotRun => "-".to_string(),
            SyncResult::NotConfigured => "none".to_string(),
            SyncResult::Pushed => "pushed".to_string(),
            SyncResult::Dispatched => "dispatched".to_string(),
            SyncResult::Failed(reason) => format!("failed: {reason}"),
        };
        write!(
            f,
            "[{}] {} tier={} kind={} artifact={} verify={} deleted={} deferred={}",
            self.job_id,
            outcome,
            or_dash(&self.tier),
            or_dash(&self.kind),
            or_dash(&self.artifact_id),
            verification,
            self.deleted,
            self.deferred,
        )?;
        if self.delete_failures > 0 {
            write!(f, " delete_failures={}", self.delete_failures)?;
        }
        write!(f, " sync={sync}")
    }
}
