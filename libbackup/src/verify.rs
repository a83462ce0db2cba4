use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::model::{Artifact, ArtifactId};

pub const DIGEST_PREFIX: &str = "sha256:";

#[async_trait]
pub trait IntegrityVerifier: Send + Sync {
    /// Content digest of the artifact at `location`.
    async fn digest(&self, location: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    Mismatch { expected: String, actual: String },
}

/// Result of re-verifying one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: ArtifactId,
    pub location: String,
    /// `Err` when the digest could not be computed at all (missing file, IO error).
    pub outcome: Result<VerifyOutcome, String>,
}

impl AuditEntry {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Ok(VerifyOutcome::Match))
    }
}

/// SHA-256 over a file, or over every regular file of a directory artifact
/// in sorted path order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Verifier;

#[async_trait]
impl IntegrityVerifier for Sha256Verifier {
    async fn digest(&self, location: &str) -> Result<String> {
        let path = PathBuf::from(location);
        tokio::task::spawn_blocking(move || digest_path(&path))
            .await
            .context("digest task panicked")?
    }
}

pub fn digest_path(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat artifact {}", path.display()))?;
    let mut hasher = Sha256::new();
    if meta.is_file() {
        hash_file(&mut hasher, path)?;
    } else if meta.is_dir() {
        for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .into_owned();
            hasher.update(relative.as_bytes());
            hasher.update([0u8]);
            hash_file(&mut hasher, entry.path())?;
        }
    } else {
        bail!("Artifact {} is neither a file nor a directory", path.display());
    }
    Ok(format!("{DIGEST_PREFIX}{}", hex::encode(hasher.finalize())))
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        hasher.update(&buf[..n]);
    }
    Ok(())
}

/// Recompute the digest of a VERIFIED artifact and compare it with the stored one.
pub async fn verify_artifact(
    verifier: &dyn IntegrityVerifier,
    artifact: &Artifact,
) -> Result<VerifyOutcome> {
    if artifact.digest.is_empty() {
        bail!("artifact {} has no stored digest", artifact.id);
    }
    let actual = verifier.digest(&artifact.location).await?;
    if actual == artifact.digest {
        Ok(VerifyOutcome::Match)
    } else {
        Ok(VerifyOutcome::Mismatch {
            expected: artifact.digest.clone(),
            actual,
        })
    }
}
