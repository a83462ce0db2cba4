use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::{Compression, write::GzEncoder};
use tar::Builder;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::model::Kind;
use crate::verify::digest_path;

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub job_id: String,
    pub source_path: String,
    pub kind: Kind,
    /// Location of the chain parent; `None` for a full backup.
    pub base_location: Option<String>,
    /// Start time of the run that produced the chain parent. Files modified
    /// at or after it belong in the incremental.
    pub base_created_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    /// Stops a production in progress. The backend must not leave an archive behind.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedArchive {
    pub location: String,
    pub size_bytes: u64,
    /// Digest observed while writing, if the backend computes one.
    pub digest: Option<String>,
}

/// Creates and removes the opaque artifacts the engine keeps track of.
#[async_trait]
pub trait ArchiveProducer: Send + Sync {
    async fn produce(&self, request: &ProduceRequest) -> Result<ProducedArchive>;
    /// Remove an artifact. Removing one that is already gone succeeds.
    async fn delete(&self, location: &str) -> Result<()>;
}

/// Writes `<archive_root>/<job>/<timestamp>-<full|incr>.tar.gz`.
///
/// An incremental archive holds every directory and symlink of the source but
/// only the regular files modified since the base run started. Cancellation is
/// checked once per walked entry and removes the partial archive.
#[derive(Debug, Clone)]
pub struct TarGzProducer {
    archive_root: PathBuf,
}

impl TarGzProducer {
    pub fn new<P: AsRef<Path>>(archive_root: P) -> Self {
        Self {
            archive_root: archive_root.as_ref().to_path_buf(),
        }
    }

    fn build(&self, request: &ProduceRequest) -> Result<ProducedArchive> {
        let source = Path::new(&request.source_path);
        if !source.exists() {
            bail!("Source path doesn't exist: {}", source.display());
        }
        if !source.is_dir() {
            bail!("Source path is not a directory: {}", source.display());
        }

        // the base archive's own mtime is too late: its walk may have missed
        // files rewritten while it was running
        let newer_than = match (request.kind, request.base_created_at) {
            (Kind::Full, _) => None,
            (Kind::Incremental, Some(created_at)) => Some(SystemTime::from(created_at)),
            (Kind::Incremental, None) => bail!("Incremental archive requested without a base"),
        };

        let out_dir = self.archive_root.join(&request.job_id);
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("Failed to create archive directory {}", out_dir.display()))?;
        let name = format!(
            "{}-{}.tar.gz",
            request.started_at.format("%Y%m%dT%H%M%SZ"),
            request.kind.short()
        );
        let final_path = out_dir.join(&name);
        if final_path.exists() {
            bail!("Archive {} already exists", final_path.display());
        }
        let partial_path = out_dir.join(format!(".{name}.partial"));

        let written = self.write_archive(source, &partial_path, newer_than, &request.cancel);
        let entries = match written {
            Ok(entries) if !request.cancel.is_cancelled() => entries,
            Ok(_) => {
                let _ = fs::remove_file(&partial_path);
                bail!("Archive of {} cancelled", source.display());
            }
            Err(e) => {
                let _ = fs::remove_file(&partial_path);
                return Err(e);
            }
        };
        fs::rename(&partial_path, &final_path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                partial_path.display(),
                final_path.display()
            )
        })?;

        let size_bytes = fs::metadata(&final_path)
            .with_context(|| format!("Failed to read size of {}", final_path.display()))?
            .len();
        let digest = digest_path(&final_path)?;
        if request.cancel.is_cancelled() {
            let _ = fs::remove_file(&final_path);
            bail!("Archive of {} cancelled", source.display());
        }
        tracing::info!(
            job = %request.job_id,
            kind = %request.kind,
            entries,
            size_bytes,
            "archive written to {}",
            final_path.display()
        );

        Ok(ProducedArchive {
            location: final_path.to_string_lossy().into_owned(),
            size_bytes,
            digest: Some(digest),
        })
    }

    /// Returns the number of entries appended.
    fn write_archive(
        &self,
        source: &Path,
        target: &Path,
        newer_than: Option<SystemTime>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let file = File::create(target)
            .with_context(|| format!("Cannot create {}", target.display()))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut tar_builder = Builder::new(encoder);
        tar_builder.follow_symlinks(false);

        let mut entries = 0;
        for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
            if cancel.is_cancelled() {
                bail!("Archive of {} cancelled", source.display());
            }
            let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
            let path = entry.path();
            let relative = match path.strip_prefix(source) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };

            let file_type = entry.file_type();
            if file_type.is_file() {
                if let Some(cutoff) = newer_than {
                    let modified = entry
                        .metadata()
                        .with_context(|| format!("Failed to get metadata from {}", path.display()))?
                        .modified()?;
                    if modified < cutoff {
                        continue;
                    }
                }
            } else if !file_type.is_dir() && !file_type.is_symlink() {
                tracing::warn!("Skip unsupported file type: {}", path.display());
                continue;
            }

            tar_builder
                .append_path_with_name(path, relative)
                .with_context(|| format!("Failed to append {} to archive", path.display()))?;
            entries += 1;
        }

        let encoder = tar_builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
        Ok(entries)
    }
}

#[async_trait]
impl ArchiveProducer for TarGzProducer {
    async fn produce(&self, request: &ProduceRequest) -> Result<ProducedArchive> {
        let producer = self.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || producer.build(&request))
            .await
            .context("archive task panicked")?
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = Path::new(location);
        let result = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("artifact {location} already removed");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete artifact {location}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Read;
    use std::time::Duration;

    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use tempfile::tempdir;

    use super::*;

    fn entry_names(archive: &str) -> BTreeSet<String> {
        let mut bytes = Vec::new();
        File::open(archive).unwrap().read_to_end(&mut bytes).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(&bytes[..]));
        tar.entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    fn request(
        source: &Path,
        kind: Kind,
        base: Option<(&str, DateTime<Utc>)>,
        day: u32,
    ) -> ProduceRequest {
        ProduceRequest {
            job_id: "home".to_string(),
            source_path: source.to_string_lossy().into_owned(),
            kind,
            base_location: base.map(|(location, _)| location.to_string()),
            base_created_at: base.map(|(_, created_at)| created_at),
            started_at: Utc.with_ymd_and_hms(2025, 3, day, 2, 0, 0).unwrap(),
            cancel: CancellationToken::new(),
        }
    }

    fn set_mtime(path: &Path, mtime: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    fn read_member(archive: &str, member: &str) -> String {
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == member {
                let mut content = String::new();
                entry.read_to_string(&mut content).unwrap();
                return content;
            }
        }
        panic!("{member} not found in {archive}");
    }

    #[tokio::test]
    async fn test_full_then_incremental() {
        let src = tempdir().unwrap();
        fs::create_dir(src.path().join("docs")).unwrap();
        fs::write(src.path().join("docs/old.txt"), "old").unwrap();
        fs::write(src.path().join("keep.txt"), "keep").unwrap();
        let an_hour_ago = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&src.path().join("docs/old.txt"), an_hour_ago);
        set_mtime(&src.path().join("keep.txt"), an_hour_ago);

        let out = tempdir().unwrap();
        let producer = TarGzProducer::new(out.path());
        let base_started = Utc::now();
        let full = producer
            .produce(&request(src.path(), Kind::Full, None, 4))
            .await
            .unwrap();
        assert!(full.location.ends_with("home/20250304T020000Z-full.tar.gz"));
        assert_eq!(full.size_bytes, fs::metadata(&full.location).unwrap().len());
        assert_eq!(full.digest, Some(digest_path(Path::new(&full.location)).unwrap()));
        assert_eq!(
            entry_names(&full.location),
            ["docs", "docs/old.txt", "keep.txt"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<_>>()
        );

        // filesystem timestamps are coarser than the system clock
        std::thread::sleep(Duration::from_millis(20));
        fs::write(src.path().join("docs/new.txt"), "new").unwrap();

        let incr = producer
            .produce(&request(
                src.path(),
                Kind::Incremental,
                Some((&full.location, base_started)),
                5,
            ))
            .await
            .unwrap();
        assert!(incr.location.ends_with("-incr.tar.gz"));
        assert_eq!(
            entry_names(&incr.location),
            ["docs", "docs/new.txt"]
                .into_iter()
                .map(String::from)
                .collect::<BTreeSet<_>>()
        );

        // no partial files are left behind
        let leftovers = fs::read_dir(out.path().join("home"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_incremental_includes_files_rewritten_during_base_walk() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("db"), "v1").unwrap();
        set_mtime(
            &src.path().join("db"),
            SystemTime::now() - Duration::from_secs(3600),
        );

        let out = tempdir().unwrap();
        let producer = TarGzProducer::new(out.path());
        let base_started = Utc::now() - chrono::Duration::minutes(10);
        let full = producer
            .produce(&request(src.path(), Kind::Full, None, 4))
            .await
            .unwrap();
        assert_eq!(read_member(&full.location, "db"), "v1");

        // rewritten while the full archive was still being written
        let base_mtime = fs::metadata(&full.location).unwrap().modified().unwrap();
        fs::write(src.path().join("db"), "v2").unwrap();
        set_mtime(&src.path().join("db"), base_mtime - Duration::from_secs(1));

        let incr = producer
            .produce(&request(
                src.path(),
                Kind::Incremental,
                Some((&full.location, base_started)),
                5,
            ))
            .await
            .unwrap();
        assert_eq!(read_member(&incr.location, "db"), "v2");
    }

    #[tokio::test]
    async fn test_incremental_without_base_time_fails() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let producer = TarGzProducer::new(out.path());
        let mut req = request(src.path(), Kind::Incremental, None, 5);
        req.base_location = Some("/somewhere/base.tar.gz".to_string());
        let err = producer.produce(&req).await.unwrap_err();
        assert!(err.to_string().contains("without a base"));
    }

    #[tokio::test]
    async fn test_cancelled_production_leaves_no_archive() {
        let src = tempdir().unwrap();
        for i in 0..50 {
            fs::write(src.path().join(format!("file-{i}")), "payload").unwrap();
        }
        let out = tempdir().unwrap();
        let producer = TarGzProducer::new(out.path());
        let req = request(src.path(), Kind::Full, None, 4);
        req.cancel.cancel();

        let err = producer.produce(&req).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(fs::read_dir(out.path().join("home")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let out = tempdir().unwrap();
        let producer = TarGzProducer::new(out.path());
        let missing = out.path().join("nope");
        assert!(
            producer
                .produce(&request(&missing, Kind::Full, None, 4))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let out = tempdir().unwrap();
        let file = out.path().join("a.tar.gz");
        fs::write(&file, "x").unwrap();
        let producer = TarGzProducer::new(out.path());
        let location = file.to_string_lossy().into_owned();

        producer.delete(&location).await.unwrap();
        assert!(!file.exists());
        producer.delete(&location).await.unwrap();
    }
}
