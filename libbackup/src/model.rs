use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Retention bucket an artifact counts against. Assigned once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "DAILY",
            Tier::Weekly => "WEEKLY",
            Tier::Monthly => "MONTHLY",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DAILY" => Ok(Tier::Daily),
            "WEEKLY" => Ok(Tier::Weekly),
            "MONTHLY" => Ok(Tier::Monthly),
            _ => Err(ConfigError::UnknownTier(s.to_string())),
        }
    }
}

/// How the artifact bytes were derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    Full,
    Incremental,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Full => "FULL",
            Kind::Incremental => "INCREMENTAL",
        }
    }

    /// Suffix used in archive file names.
    pub fn short(&self) -> &'static str {
        match self {
            Kind::Full => "full",
            Kind::Incremental => "incr",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub u64);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Pending,
    Verified,
    Failed,
    Deleted,
}

impl ArtifactStatus {
    /// PENDING -> {VERIFIED, FAILED}, VERIFIED -> DELETED. Nothing else.
    pub fn can_transition_to(&self, next: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        matches!(
            (self, next),
            (Pending, Verified) | (Pending, Failed) | (Verified, Deleted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "PENDING",
            ArtifactStatus::Verified => "VERIFIED",
            ArtifactStatus::Failed => "FAILED",
            ArtifactStatus::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One produced backup unit and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: String,
    pub tier: Tier,
    pub kind: Kind,
    pub created_at: DateTime<Utc>,
    pub source_path: String,
    /// Empty when production never returned a location.
    pub location: String,
    pub size_bytes: u64,
    /// Empty until the artifact is verified.
    #[serde(default)]
    pub digest: String,
    pub status: ArtifactStatus,
    #[serde(default)]
    pub based_on: Option<ArtifactId>,
    /// Why the artifact ended up FAILED, for operator review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Artifact {
    pub fn is_verified(&self) -> bool {
        self.status == ArtifactStatus::Verified
    }
}
