use std::io;

use thiserror::Error;

use crate::model::{ArtifactId, ArtifactStatus, Kind, Tier};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("retention keep count for {0} must be at least 1")]
    ZeroKeepCount(Tier),

    #[error("unknown retention tier: {0}")]
    UnknownTier(String),

    #[error("unknown weekday: {0}")]
    UnknownWeekday(String),

    #[error("lock lease duration must be positive")]
    ZeroLease,

    #[error("max_chain_length must be at least 1")]
    ZeroChainLength,

    #[error("job name must not be empty")]
    EmptyJobName,

    #[error("job {0} has an empty source")]
    EmptySource(String),

    #[error("job name {0} is declared more than once")]
    DuplicateJob(String),

    #[error("source {path} is claimed by both {first} and {second}")]
    DuplicateSource {
        path: String,
        first: String,
        second: String,
    },

    #[error("no jobs configured")]
    NoJobs,

    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("artifact {0} not found in catalog")]
    UnknownArtifact(ArtifactId),

    #[error("artifact {id}: illegal status transition {from} -> {to}")]
    IllegalTransition {
        id: ArtifactId,
        from: ArtifactStatus,
        to: ArtifactStatus,
    },

    #[error("artifact {0} cannot be verified with an empty digest")]
    EmptyDigest(ArtifactId),

    #[error("base artifact {0} is missing or deleted")]
    InvalidBase(ArtifactId),

    #[error("{kind} artifact has an inconsistent base reference")]
    InconsistentChain { kind: Kind },

    #[error("catalog belongs to source {found}, expected {expected}")]
    SourceMismatch { expected: String, found: String },

    #[error("unsupported catalog version {0}")]
    UnsupportedVersion(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("catalog encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("invalid job id for lock: {0:?}")]
    InvalidJobId(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("lock record encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors that abort a run before it can report an outcome. Production and
/// verification failures are not errors at this level; they are recorded in
/// the catalog and reported through [`crate::RunReport`].
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}
