//! Per-source ledger of every artifact ever produced.
//!
//! The catalog is the source of truth: artifact files are subordinate to it.
//! Every mutation goes through the methods below, which enforce the status
//! state machine and the chain invariant, and the caller persists the result
//! through a [`CatalogStore`] after each mutation.
//!
//! On-disk layout of [`FileCatalogStore`]:
//!
//! ```text
//! <root>
//! ├── <sha256(source)>.json
//! └── .<sha256(source)>.json.<uuid>.tmp   (only while a write is in flight)
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::error::CatalogError;
use crate::model::{Artifact, ArtifactId, ArtifactStatus, Kind, Tier};

pub const CATALOG_VERSION: u32 = 1;

/// Everything needed to record a new artifact. The catalog assigns the id.
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    pub job_id: String,
    pub tier: Tier,
    pub kind: Kind,
    pub created_at: DateTime<Utc>,
    pub location: String,
    pub size_bytes: u64,
    pub based_on: Option<ArtifactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    version: u32,
    source_path: String,
    next_id: u64,
    artifacts: Vec<Artifact>,
}

impl Catalog {
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            version: CATALOG_VERSION,
            source_path: source_path.into(),
            next_id: 1,
            artifacts: Vec::new(),
        }
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// All artifacts in insertion order.
    pub fn entries(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn get(&self, id: ArtifactId) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// The most recent VERIFIED artifact. Later insertion wins on equal timestamps.
    pub fn latest_verified(&self) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_verified())
            .max_by(|(i, a), (j, b)| a.created_at.cmp(&b.created_at).then(i.cmp(j)))
            .map(|(_, a)| a)
    }

    /// VERIFIED artifacts whose chain parent is `id`.
    pub fn live_dependents(&self, id: ArtifactId) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(move |a| a.is_verified() && a.based_on == Some(id))
    }

    pub fn verified_in_tier(&self, tier: Tier) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(move |a| a.is_verified() && a.tier == tier)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(|a| a.status == ArtifactStatus::Failed)
    }

    /// Number of artifacts in the chain ending at `id`, its full root included.
    pub fn chain_length(&self, id: ArtifactId) -> usize {
        let mut length = 0;
        let mut cursor = self.get(id);
        while let Some(artifact) = cursor {
            length += 1;
            // a corrupt catalog could loop; a chain can never be longer than the catalog
            if length > self.artifacts.len() {
                break;
            }
            cursor = artifact.based_on.and_then(|parent| self.get(parent));
        }
        length
    }

    pub fn insert_pending(&mut self, draft: ArtifactDraft) -> Result<ArtifactId, CatalogError> {
        self.insert(draft, ArtifactStatus::Pending, None)
    }

    /// Record a production attempt that never yielded an artifact.
    pub fn record_failed_production(
        &mut self,
        draft: ArtifactDraft,
        reason: impl Into<String>,
    ) -> Result<ArtifactId, CatalogError> {
        self.insert(draft, ArtifactStatus::Failed, Some(reason.into()))
    }

    pub fn mark_verified(
        &mut self,
        id: ArtifactId,
        digest: impl Into<String>,
    ) -> Result<(), CatalogError> {
        let digest = digest.into();
        if digest.is_empty() {
            return Err(CatalogError::EmptyDigest(id));
        }
        let artifact = self.transition(id, ArtifactStatus::Verified)?;
        artifact.digest = digest;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        id: ArtifactId,
        reason: impl Into<String>,
    ) -> Result<(), CatalogError> {
        let artifact = self.transition(id, ArtifactStatus::Failed)?;
        artifact.failure = Some(reason.into());
        Ok(())
    }

    /// Only call once the artifact file is gone.
    pub fn mark_deleted(&mut self, id: ArtifactId) -> Result<(), CatalogError> {
        self.transition(id, ArtifactStatus::Deleted).map(|_| ())
    }

    fn insert(
        &mut self,
        draft: ArtifactDraft,
        status: ArtifactStatus,
        failure: Option<String>,
    ) -> Result<ArtifactId, CatalogError> {
        match (draft.kind, draft.based_on) {
            (Kind::Full, None) => {}
            (Kind::Incremental, Some(base)) => match self.get(base) {
                Some(parent) if parent.status != ArtifactStatus::Deleted => {}
                _ => return Err(CatalogError::InvalidBase(base)),
            },
            (kind, _) => return Err(CatalogError::InconsistentChain { kind }),
        }

        let id = ArtifactId(self.next_id);
        self.next_id += 1;
        self.artifacts.push(Artifact {
            id,
            job_id: draft.job_id,
            tier: draft.tier,
            kind: draft.kind,
            created_at: draft.created_at,
            source_path: self.source_path.clone(),
            location: draft.location,
            size_bytes: draft.size_bytes,
            digest: String::new(),
            status,
            based_on: draft.based_on,
            failure,
        });
        Ok(id)
    }

    fn transition(
        &mut self,
        id: ArtifactId,
        to: ArtifactStatus,
    ) -> Result<&mut Artifact, CatalogError> {
        let artifact = self
            .artifacts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(CatalogError::UnknownArtifact(id))?;
        if !artifact.status.can_transition_to(to) {
            return Err(CatalogError::IllegalTransition {
                id,
                from: artifact.status,
                to,
            });
        }
        artifact.status = to;
        Ok(artifact)
    }
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Load the catalog for `source_path`; a source never seen before yields an empty catalog.
    async fn load(&self, source_path: &str) -> Result<Catalog, CatalogError>;
    /// Durably replace the stored catalog. Must be atomic.
    async fn save(&self, catalog: &Catalog) -> Result<(), CatalogError>;
}

pub struct FileCatalogStore {
    root: PathBuf,
}

impl FileCatalogStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, source_path: &str) -> PathBuf {
        let key = hex::encode(Sha256::digest(source_path.as_bytes()));
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl CatalogStore for FileCatalogStore {
    async fn load(&self, source_path: &str) -> Result<Catalog, CatalogError> {
        let path = self.path_for(source_path);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(source = source_path, "no catalog yet, starting empty");
                return Ok(Catalog::new(source_path));
            }
            Err(e) => return Err(e.into()),
        };

        let catalog: Catalog = serde_json::from_slice(&bytes)?;
        if catalog.version != CATALOG_VERSION {
            return Err(CatalogError::UnsupportedVersion(catalog.version));
        }
        if catalog.source_path != source_path {
            return Err(CatalogError::SourceMismatch {
                expected: source_path.to_string(),
                found: catalog.source_path,
            });
        }
        Ok(catalog)
    }

    async fn save(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        fs::create_dir_all(&self.root).await?;
        let target = self.path_for(&catalog.source_path);
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self
            .root
            .join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let bytes = serde_json::to_vec_pretty(catalog)?;
        let written = async {
            let mut file = File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        // the rename is only durable once the directory entry is
        File::open(&self.root).await?.sync_all().await?;
        Ok(())
    }
}
