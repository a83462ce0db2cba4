use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use libbackup::{
    ArtifactStatus, Backends, CatalogStore, Clock, DirectorySync, FileCatalogStore,
    FileLockManager, JobSpec, Kind, ManualClock, Orchestrator, RetentionPolicy, RunOutcome,
    Sha256Verifier, SyncResult, TarGzProducer, Tier,
};
use tar::Archive;
use tokio_util::sync::CancellationToken;

use crate::common::at;

mod common;

fn archive_entries(path: &str) -> BTreeSet<String> {
    let mut archive = Archive::new(GzDecoder::new(File::open(path).unwrap()));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            path.trim_end_matches('/').to_string()
        })
        .collect()
}

fn read_member(path: &str, member: &str) -> String {
    let mut archive = Archive::new(GzDecoder::new(File::open(path).unwrap()));
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == member {
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            return content;
        }
    }
    panic!("{member} not found in {path}");
}

fn set_mtime(path: &Path, mtime: DateTime<Utc>) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::from(mtime))
        .unwrap();
}

#[tokio::test]
async fn test_full_then_incremental_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir_all(source.join("conf")).unwrap();
    fs::write(source.join("conf/app.yaml"), "replicas: 1\n").unwrap();
    fs::write(source.join("data.db"), "v1").unwrap();
    let clock = Arc::new(ManualClock::new(at(2025, 3, 4)));
    set_mtime(&source.join("conf/app.yaml"), clock.now() - Duration::hours(2));
    set_mtime(&source.join("data.db"), clock.now() - Duration::hours(2));

    let catalogs = Arc::new(FileCatalogStore::new(dir.path().join("catalog")));
    let backends = Backends {
        clock: clock.clone(),
        locks: Arc::new(FileLockManager::new(
            dir.path().join("locks"),
            StdDuration::from_secs(3600),
            clock.clone(),
        )),
        catalogs: catalogs.clone(),
        producer: Arc::new(TarGzProducer::new(dir.path().join("archives"))),
        verifier: Arc::new(Sha256Verifier),
        remote: Some(Arc::new(DirectorySync::new(dir.path().join("remote")))),
    };
    let source_path = source.to_string_lossy().into_owned();
    let job = JobSpec {
        policy: RetentionPolicy::new().with(Tier::Daily, 3),
        ..JobSpec::new("app", source_path.clone())
    };
    let orchestrator = Orchestrator::new(job, backends);

    let first = orchestrator.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Done);
    assert_eq!(first.kind, Some(Kind::Full));
    assert_eq!(first.sync, SyncResult::Pushed);

    let catalog = catalogs.load(&source_path).await.unwrap();
    let full = catalog.entries()[0].clone();
    assert!(full.location.ends_with("app/20250304T023000Z-full.tar.gz"));
    assert_eq!(
        archive_entries(&full.location),
        BTreeSet::from([
            "conf".to_string(),
            "conf/app.yaml".to_string(),
            "data.db".to_string()
        ])
    );
    assert_eq!(full.size_bytes, fs::metadata(&full.location).unwrap().len());
    let pushed = dir.path().join("remote/20250304T023000Z-full.tar.gz");
    assert_eq!(fs::read(&pushed).unwrap(), fs::read(&full.location).unwrap());

    // data.db is rewritten after the first run started but stamped well before
    // the full archive itself hit the disk
    fs::write(source.join("data.db"), "v2").unwrap();
    set_mtime(&source.join("data.db"), full.created_at + Duration::minutes(5));
    assert!(
        fs::metadata(source.join("data.db")).unwrap().modified().unwrap()
            < fs::metadata(&full.location).unwrap().modified().unwrap()
    );
    clock.advance(Duration::days(1));

    let second = orchestrator.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(second.kind, Some(Kind::Incremental));
    let catalog = catalogs.load(&source_path).await.unwrap();
    let incremental = &catalog.entries()[1];
    assert_eq!(incremental.based_on, Some(full.id));
    assert_eq!(incremental.status, ArtifactStatus::Verified);
    let entries = archive_entries(&incremental.location);
    assert!(entries.contains("data.db"));
    assert!(!entries.contains("conf/app.yaml"));
    assert_eq!(read_member(&incremental.location, "data.db"), "v2");

    let audit = orchestrator.audit().await.unwrap();
    assert_eq!(audit.len(), 2);
    assert!(audit.iter().all(|entry| entry.is_ok()));
}

#[tokio::test]
async fn test_missing_source_is_a_production_failure() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(at(2025, 3, 4)));
    let catalogs = Arc::new(FileCatalogStore::new(dir.path().join("catalog")));
    let backends = Backends {
        clock: clock.clone(),
        locks: Arc::new(FileLockManager::new(
            dir.path().join("locks"),
            StdDuration::from_secs(3600),
            clock,
        )),
        catalogs: catalogs.clone(),
        producer: Arc::new(TarGzProducer::new(dir.path().join("archives"))),
        verifier: Arc::new(Sha256Verifier),
        remote: None,
    };
    let missing = dir.path().join("nope").to_string_lossy().into_owned();
    let orchestrator = Orchestrator::new(JobSpec::new("nope", missing.clone()), backends);

    let report = orchestrator.run(&CancellationToken::new()).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Failed(_)));
    assert_eq!(report.exit_code(), 3);

    let catalog = catalogs.load(&missing).await.unwrap();
    assert_eq!(catalog.len(), 1);
    let failed = &catalog.entries()[0];
    assert_eq!(failed.status, ArtifactStatus::Failed);
    assert!(failed.failure.as_deref().unwrap().contains("doesn't exist"));
    assert!(!dir.path().join("archives/nope").exists());
}
