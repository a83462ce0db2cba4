//! Tiered keep-count evaluation.
//!
//! Tiers are evaluated independently: an artifact only ever competes with
//! artifacts of the tier it was assigned at creation. Within a tier the newest
//! `keep` VERIFIED artifacts survive. The rest are deleted unless a live
//! incremental still depends on them, in which case they are deferred and come
//! up again on the next evaluation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::{Artifact, ArtifactId, ArtifactStatus, Tier};

/// Per-tier keep counts. A tier without an entry is never pruned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionPolicy {
    keep: BTreeMap<Tier, usize>,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// 7 daily, 4 weekly, 12 monthly.
    pub fn gfs() -> Self {
        Self::new()
            .with(Tier::Daily, 7)
            .with(Tier::Weekly, 4)
            .with(Tier::Monthly, 12)
    }

    pub fn with(mut self, tier: Tier, keep: usize) -> Self {
        self.keep.insert(tier, keep);
        self
    }

    pub fn keep_count(&self, tier: Tier) -> Option<usize> {
        self.keep.get(&tier).copied()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.keep.iter().find(|(_, keep)| **keep == 0) {
            Some((tier, _)) => Err(ConfigError::ZeroKeepCount(*tier)),
            None => Ok(()),
        }
    }
}

impl FromIterator<(Tier, usize)> for RetentionPolicy {
    fn from_iter<T: IntoIterator<Item = (Tier, usize)>>(iter: T) -> Self {
        Self {
            keep: iter.into_iter().collect(),
        }
    }
}

/// Advisory output of [`evaluate`]. Every VERIFIED artifact lands in exactly
/// one of the three sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: BTreeSet<ArtifactId>,
    pub delete: Vec<ArtifactId>,
    /// Over the keep count but still the base of a live incremental.
    pub deferred: Vec<ArtifactId>,
}

pub fn evaluate(entries: &[Artifact], policy: &RetentionPolicy) -> RetentionPlan {
    let live_bases: HashSet<ArtifactId> = entries
        .iter()
        .filter(|a| a.status == ArtifactStatus::Verified)
        .filter_map(|a| a.based_on)
        .collect();

    let mut plan = RetentionPlan::default();
    for tier in Tier::ALL {
        let mut candidates: Vec<(usize, &Artifact)> = entries
            .iter()
            .enumerate()
            .filter(|(_, a)| a.status == ArtifactStatus::Verified && a.tier == tier)
            .collect();
        // newest first; later insertion is newer on equal timestamps
        candidates.sort_by(|(i, a), (j, b)| b.created_at.cmp(&a.created_at).then(j.cmp(i)));

        let keep = policy.keep_count(tier).unwrap_or(usize::MAX);
        for (rank, (_, artifact)) in candidates.into_iter().enumerate() {
            if rank < keep {
                plan.keep.insert(artifact.id);
            } else if live_bases.contains(&artifact.id) {
                plan.deferred.push(artifact.id);
            } else {
                plan.delete.push(artifact.id);
            }
        }
    }
    plan.delete.sort();
    plan.deferred.sort();
    plan
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::model::Kind;

    fn artifact(id: u64, tier: Tier, at: DateTime<Utc>, based_on: Option<u64>) -> Artifact {
        Artifact {
            id: ArtifactId(id),
            job_id: "job".to_string(),
            tier,
            kind: if based_on.is_some() {
                Kind::Incremental
            } else {
                Kind::Full
            },
            created_at: at,
            source_path: "/srv/data".to_string(),
            location: format!("/archives/{id}"),
            size_bytes: 1,
            digest: format!("sha256:{id:02}"),
            status: ArtifactStatus::Verified,
            based_on: based_on.map(ArtifactId),
            failure: None,
        }
    }

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap() + Duration::days(n)
    }

    #[test]
    fn test_keeps_newest_per_tier() {
        let entries = vec![
            artifact(1, Tier::Daily, day(1), None),
            artifact(2, Tier::Daily, day(2), None),
            artifact(3, Tier::Weekly, day(3), None),
            artifact(4, Tier::Daily, day(4), None),
        ];
        let policy = RetentionPolicy::new()
            .with(Tier::Daily, 2)
            .with(Tier::Weekly, 1);

        let plan = evaluate(&entries, &policy);
        assert_eq!(plan.delete, vec![ArtifactId(1)]);
        assert!(plan.deferred.is_empty());
        assert_eq!(
            plan.keep,
            BTreeSet::from([ArtifactId(2), ArtifactId(3), ArtifactId(4)])
        );
    }

    #[test]
    fn test_tiers_never_merge() {
        // the weekly artifact is the oldest overall but only competes with weeklies
        let entries = vec![
            artifact(1, Tier::Weekly, day(0), None),
            artifact(2, Tier::Daily, day(1), None),
            artifact(3, Tier::Daily, day(2), None),
        ];
        let policy = RetentionPolicy::new()
            .with(Tier::Daily, 1)
            .with(Tier::Weekly, 1);

        let plan = evaluate(&entries, &policy);
        assert_eq!(plan.delete, vec![ArtifactId(2)]);
        assert!(plan.keep.contains(&ArtifactId(1)));
    }

    #[test]
    fn test_unlisted_tier_is_unbounded() {
        let entries: Vec<_> = (1..=5)
            .map(|i| artifact(i, Tier::Monthly, day(i as i64), None))
            .collect();
        let plan = evaluate(&entries, &RetentionPolicy::new().with(Tier::Daily, 1));
        assert!(plan.delete.is_empty());
        assert_eq!(plan.keep.len(), 5);
    }

    #[test]
    fn test_live_base_is_deferred() {
        let entries = vec![
            artifact(1, Tier::Daily, day(1), None),
            artifact(2, Tier::Daily, day(2), Some(1)),
            artifact(3, Tier::Daily, day(3), Some(2)),
        ];
        let plan = evaluate(&entries, &RetentionPolicy::new().with(Tier::Daily, 1));
        assert_eq!(plan.keep, BTreeSet::from([ArtifactId(3)]));
        assert!(plan.delete.is_empty());
        assert_eq!(plan.deferred, vec![ArtifactId(1), ArtifactId(2)]);
    }

    #[test]
    fn test_failed_and_deleted_are_never_candidates() {
        let mut failed = artifact(1, Tier::Daily, day(1), None);
        failed.status = ArtifactStatus::Failed;
        failed.digest.clear();
        let mut deleted = artifact(2, Tier::Daily, day(2), None);
        deleted.status = ArtifactStatus::Deleted;
        // a FAILED incremental does not hold its base alive
        let mut failed_child = artifact(5, Tier::Daily, day(5), Some(3));
        failed_child.status = ArtifactStatus::Failed;
        let entries = vec![
            failed,
            deleted,
            artifact(3, Tier::Daily, day(3), None),
            artifact(4, Tier::Daily, day(4), None),
            failed_child,
        ];

        let plan = evaluate(&entries, &RetentionPolicy::new().with(Tier::Daily, 1));
        assert_eq!(plan.delete, vec![ArtifactId(3)]);
        assert_eq!(plan.keep, BTreeSet::from([ArtifactId(4)]));
    }

    #[test]
    fn test_equal_timestamps_break_ties_by_insertion() {
        let entries = vec![
            artifact(1, Tier::Daily, day(1), None),
            artifact(2, Tier::Daily, day(1), None),
        ];
        let plan = evaluate(&entries, &RetentionPolicy::new().with(Tier::Daily, 1));
        assert_eq!(plan.keep, BTreeSet::from([ArtifactId(2)]));
        assert_eq!(plan.delete, vec![ArtifactId(1)]);
    }

    #[test]
    fn test_zero_keep_is_rejected() {
        assert!(RetentionPolicy::gfs().validate().is_ok());
        let err = RetentionPolicy::new()
            .with(Tier::Weekly, 0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroKeepCount(Tier::Weekly)));
    }
}
