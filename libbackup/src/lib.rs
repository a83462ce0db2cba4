//! Backup retention engine for rk8s nodes.
//!
//! One [`Orchestrator`] run per job acquires a lease, decides the retention
//! tier and production kind, asks the [`ArchiveProducer`] for a new artifact,
//! verifies it, records everything in the per-source [`Catalog`], prunes aged
//! out artifacts per [`RetentionPolicy`] and finally hands the artifact to a
//! [`RemoteSync`] backend.

pub mod catalog;
pub mod clock;
pub mod error;
pub mod lock;
pub mod model;
pub mod orchestrator;
pub mod producer;
pub mod remote;
pub mod report;
pub mod retention;
pub mod schedule;
pub mod verify;

pub use catalog::{Catalog, CatalogStore, FileCatalogStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackupError, CatalogError, ConfigError, LockError};
pub use lock::{Acquired, FileLockManager, Lease, LockManager};
pub use model::{Artifact, ArtifactId, ArtifactStatus, Kind, Tier};
pub use orchestrator::{Backends, JobSpec, Orchestrator, RunState};
pub use producer::{ArchiveProducer, ProduceRequest, ProducedArchive, TarGzProducer};
pub use remote::{CommandSync, DirectorySync, RemoteSync, SyncMode};
pub use report::{FailureStage, RunOutcome, RunReport, SyncResult, Verification};
pub use retention::{RetentionPlan, RetentionPolicy, evaluate};
pub use schedule::{Schedule, TierPrecedence, decide_tier};
pub use verify::{AuditEntry, IntegrityVerifier, Sha256Verifier, VerifyOutcome};
