use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libbackup::schedule::parse_weekday;
use libbackup::{
    Backends, CommandSync, ConfigError, DirectorySync, FileCatalogStore, FileLockManager, JobSpec,
    RemoteSync, RetentionPolicy, Schedule, Sha256Verifier, SyncMode, SystemClock, TarGzProducer,
    Tier, TierPrecedence,
};
use serde::Deserialize;

fn default_lease_secs() -> u64 {
    6 * 60 * 60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RkbakConfig {
    pub catalog_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub archive_dir: PathBuf,
    #[serde(default = "default_lease_secs")]
    pub lock_lease_secs: u64,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub name: String,
    pub source: String,
    /// Tier name to keep count. Omitted entirely means 7/4/12.
    pub retention: Option<BTreeMap<String, usize>>,
    pub weekly_anchor: Option<String>,
    #[serde(default)]
    pub precedence: TierPrecedence,
    pub max_chain_length: Option<u32>,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(flatten)]
    pub target: RemoteTarget,
    #[serde(default)]
    pub mode: SyncMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteTarget {
    Directory {
        path: PathBuf,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RkbakConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: RkbakConfig = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

impl RkbakConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }
        if self.lock_lease_secs == 0 {
            return Err(ConfigError::ZeroLease);
        }

        let mut names = HashSet::new();
        let mut sources: HashMap<&str, &str> = HashMap::new();
        for job in &self.jobs {
            job.to_spec()?.validate()?;
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            if let Some(first) = sources.insert(job.source.as_str(), job.name.as_str()) {
                return Err(ConfigError::DuplicateSource {
                    path: job.source.clone(),
                    first: first.to_string(),
                    second: job.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Settings that are valid but almost certainly not what the operator wants.
    pub fn warnings(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|job| job.max_chain_length.is_none())
            .map(|job| {
                format!(
                    "job {} sets no max_chain_length: every backup stays the base of the next one, \
                     so retention can never delete anything (7 pairs with daily runs)",
                    job.name
                )
            })
            .collect()
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    /// Shared collaborators for `job`. Everything but the remote is common to
    /// all jobs of this config.
    pub fn backends(&self, job: &JobConfig) -> Backends {
        let clock = Arc::new(SystemClock);
        Backends {
            clock: clock.clone(),
            locks: Arc::new(FileLockManager::new(&self.lock_dir, self.lease(), clock)),
            catalogs: Arc::new(FileCatalogStore::new(&self.catalog_dir)),
            producer: Arc::new(TarGzProducer::new(&self.archive_dir)),
            verifier: Arc::new(Sha256Verifier),
            remote: job.remote.as_ref().map(RemoteConfig::build),
        }
    }
}

impl JobConfig {
    pub fn policy(&self) -> Result<RetentionPolicy, ConfigError> {
        let Some(retention) = &self.retention else {
            return Ok(RetentionPolicy::gfs());
        };
        retention
            .iter()
            .map(|(tier, keep)| tier.parse::<Tier>().map(|tier| (tier, *keep)))
            .collect()
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        let anchor = match &self.weekly_anchor {
            Some(day) => parse_weekday(day)?,
            None => Schedule::default().weekly_anchor,
        };
        Ok(Schedule::new(anchor, self.precedence))
    }

    pub fn to_spec(&self) -> Result<JobSpec, ConfigError> {
        Ok(JobSpec {
            policy: self.policy()?,
            schedule: self.schedule()?,
            max_chain_length: self.max_chain_length,
            sync_mode: self.remote.as_ref().map(|r| r.mode).unwrap_or_default(),
            ..JobSpec::new(&self.name, &self.source)
        })
    }
}

impl RemoteConfig {
    fn build(&self) -> Arc<dyn RemoteSync> {
        match &self.target {
            RemoteTarget::Directory { path } => Arc::new(DirectorySync::new(path)),
            RemoteTarget::Command { program, args } => {
                Arc::new(CommandSync::new(program.clone(), args.clone()))
            }
        }
    }
}
