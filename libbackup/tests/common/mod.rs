#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use libbackup::{
    ArchiveProducer, Backends, Catalog, CatalogStore, FileCatalogStore, FileLockManager, JobSpec,
    ManualClock, Orchestrator, ProduceRequest, ProducedArchive, RemoteSync, Sha256Verifier,
};
use tempfile::TempDir;
use tokio::sync::Notify;

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 2, 30, 0).unwrap()
}

/// Writes small payload files instead of real archives and lets tests inject
/// failures or hold production open.
#[derive(Default)]
pub struct MockProducer {
    root: PathBuf,
    counter: AtomicUsize,
    pub fail_production: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Report a digest that will not match what the verifier computes.
    pub lie_about_digest: AtomicBool,
    /// Return a location that does not exist.
    pub vanish: AtomicBool,
    /// When set, `produce` parks until the gate is notified.
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub started: Arc<Notify>,
    pub requests: Mutex<Vec<ProduceRequest>>,
    pub deleted: Mutex<Vec<String>>,
}

impl MockProducer {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ..Default::default()
        }
    }

    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn requests(&self) -> Vec<ProduceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveProducer for MockProducer {
    async fn produce(&self, request: &ProduceRequest) -> Result<ProducedArchive> {
        self.requests.lock().unwrap().push(request.clone());
        self.started.notify_one();

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_production.load(Ordering::SeqCst) {
            bail!("tar: {}: Cannot open: Permission denied", request.source_path);
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let dir = self.root.join(&request.job_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{n:04}-{}.bin", request.kind.short()));
        let payload = format!("{}|{}|{}|{n}", request.source_path, request.kind, request.started_at);
        std::fs::write(&path, &payload)?;
        if self.vanish.load(Ordering::SeqCst) {
            std::fs::remove_file(&path)?;
        }

        let digest = self
            .lie_about_digest
            .load(Ordering::SeqCst)
            .then(|| "sha256:0000".to_string());
        Ok(ProducedArchive {
            location: path.to_string_lossy().into_owned(),
            size_bytes: payload.len() as u64,
            digest,
        })
    }

    async fn delete(&self, location: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("rm: cannot remove '{location}': Device or resource busy");
        }
        match std::fs::remove_file(location) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.deleted.lock().unwrap().push(location.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSync {
    pub fail: AtomicBool,
    pub pushed: Mutex<Vec<String>>,
}

impl MockSync {
    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSync for MockSync {
    async fn push(&self, location: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("rsync: connection refused");
        }
        self.pushed.lock().unwrap().push(location.to_string());
        Ok(())
    }
}

/// Real catalog store, lock manager and verifier on a temp directory, mock
/// producer and remote.
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub producer: Arc<MockProducer>,
    pub remote: Arc<MockSync>,
    pub catalogs: Arc<FileCatalogStore>,
    pub backends: Backends,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(at(2025, 3, 4)));
        let producer = Arc::new(MockProducer::new(&dir.path().join("archives")));
        let remote = Arc::new(MockSync::default());
        let catalogs = Arc::new(FileCatalogStore::new(dir.path().join("catalog")));
        let locks = Arc::new(FileLockManager::new(
            dir.path().join("locks"),
            Duration::from_secs(6 * 3600),
            clock.clone(),
        ));
        let backends = Backends {
            clock: clock.clone(),
            locks,
            catalogs: catalogs.clone(),
            producer: producer.clone(),
            verifier: Arc::new(Sha256Verifier),
            remote: Some(remote.clone()),
        };
        Self {
            dir,
            clock,
            producer,
            remote,
            catalogs,
            backends,
        }
    }

    pub fn orchestrator(&self, job: JobSpec) -> Orchestrator {
        Orchestrator::new(job, self.backends.clone())
    }

    pub async fn catalog(&self, source: &str) -> Catalog {
        self.catalogs.load(source).await.unwrap()
    }

    pub fn lock_path(&self, job_id: &str) -> PathBuf {
        self.dir.path().join("locks").join(format!("{job_id}.lock"))
    }
}
