//! Single-instance leases per job.
//!
//! A lease is a `<lock_dir>/<job_id>.lock` file holding a JSON [`LockRecord`]:
//! who holds it and until when. Acquisition never waits: a held, unexpired
//! lease yields [`Acquired::Busy`]. A lease past its expiry is assumed to belong
//! to a crashed run and is reclaimed.
//!
//! Every read-modify-write of a lease file happens under an exclusive `flock`
//! on `<lock_dir>/<job_id>.lock.guard`, so two processes can never both judge
//! the same lease stale and replace it. The guard file is never removed.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LockError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub job_id: String,
    pub token: Uuid,
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Exclusive right to run a job until `expires_at`. Hand it back through
/// [`LockManager::release`].
#[derive(Debug)]
pub struct Lease {
    record: LockRecord,
}

impl Lease {
    pub fn job_id(&self) -> &str {
        &self.record.job_id
    }

    pub fn token(&self) -> Uuid {
        self.record.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.record.expires_at
    }
}

#[derive(Debug)]
pub enum Acquired {
    Lease(Lease),
    /// Someone else holds the lease. `holder` is `None` when the record could not be read.
    Busy { holder: Option<LockRecord> },
}

#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, job_id: &str) -> Result<Acquired, LockError>;
    async fn release(&self, lease: Lease) -> Result<(), LockError>;
}

enum Holder {
    Live(LockRecord),
    Stale(Option<LockRecord>),
    Unreadable,
    Gone,
}

struct LockPaths {
    lease: PathBuf,
    guard: PathBuf,
}

/// Take the guard `flock`. `None` means another process holds it and `arg`
/// asked not to wait.
fn lock_guard(path: &Path, arg: FlockArg) -> Result<Option<Flock<File>>, LockError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    match Flock::lock(file, arg) {
        Ok(guard) => Ok(Some(guard)),
        Err((_file, e)) if e == Errno::EWOULDBLOCK => Ok(None),
        Err((_file, e)) => Err(io::Error::from(e).into()),
    }
}

#[derive(Clone)]
pub struct FileLockManager {
    dir: PathBuf,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl FileLockManager {
    pub fn new<P: AsRef<Path>>(dir: P, lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            lease_duration,
            clock,
        }
    }

    fn paths_for(&self, job_id: &str) -> Result<LockPaths, LockError> {
        let valid = !job_id.is_empty()
            && job_id != "."
            && job_id != ".."
            && !job_id.contains(['/', '\\', '\0']);
        if !valid {
            return Err(LockError::InvalidJobId(job_id.to_string()));
        }
        Ok(LockPaths {
            lease: self.dir.join(format!("{job_id}.lock")),
            guard: self.dir.join(format!("{job_id}.lock.guard")),
        })
    }

    fn lease_span(&self) -> chrono::Duration {
        // out-of-range leases are clamped well below the DateTime overflow point
        chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
    }

    fn create(&self, path: &Path, job_id: &str) -> Result<Option<Lease>, LockError> {
        let now = self.clock.now();
        let record = LockRecord {
            job_id: job_id.to_string(),
            token: Uuid::new_v4(),
            pid: std::process::id(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            acquired_at: now,
            expires_at: now + self.lease_span(),
        };
        let bytes = serde_json::to_vec(&record)?;

        // create_new still guards against writers that ignore the flock
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let written = file.write_all(&bytes).and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(path);
            return Err(e.into());
        }
        Ok(Some(Lease { record }))
    }

    fn inspect(&self, path: &Path) -> Result<Holder, LockError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Holder::Gone),
            Err(e) => return Err(e.into()),
        };

        if let Ok(record) = serde_json::from_slice::<LockRecord>(&content) {
            return Ok(if record.expires_at <= self.clock.now() {
                Holder::Stale(Some(record))
            } else {
                Holder::Live(record)
            });
        }

        // A run that crashed mid-write; only an old file is treated as abandoned.
        let modified: DateTime<Utc> = fs::metadata(path)?.modified()?.into();
        if modified + self.lease_span() <= self.clock.now() {
            Ok(Holder::Stale(None))
        } else {
            Ok(Holder::Unreadable)
        }
    }

    fn acquire_blocking(&self, job_id: &str) -> Result<Acquired, LockError> {
        let paths = self.paths_for(job_id)?;
        fs::create_dir_all(&self.dir)?;
        let Some(_guard) = lock_guard(&paths.guard, FlockArg::LockExclusiveNonblock)? else {
            debug!(job = job_id, "lease is being acquired or released by another run");
            return Ok(Acquired::Busy { holder: None });
        };

        match self.inspect(&paths.lease)? {
            Holder::Live(record) => {
                return Ok(Acquired::Busy {
                    holder: Some(record),
                });
            }
            Holder::Unreadable => return Ok(Acquired::Busy { holder: None }),
            Holder::Gone => {}
            Holder::Stale(record) => {
                match &record {
                    Some(r) => warn!(
                        job = job_id,
                        holder_pid = r.pid,
                        holder_host = %r.host,
                        expired_at = %r.expires_at,
                        "stale lock reclaimed"
                    ),
                    None => warn!(job = job_id, "stale lock reclaimed (unreadable record)"),
                }
                match fs::remove_file(&paths.lease) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        match self.create(&paths.lease, job_id)? {
            Some(lease) => {
                debug!(job = job_id, token = %lease.token(), expires_at = %lease.expires_at(), "lease acquired");
                Ok(Acquired::Lease(lease))
            }
            None => Ok(Acquired::Busy { holder: None }),
        }
    }

    fn release_blocking(&self, lease: &Lease) -> Result<(), LockError> {
        let paths = self.paths_for(lease.job_id())?;
        // waits: an acquire holds the guard only for a few syscalls
        let _guard = lock_guard(&paths.guard, FlockArg::LockExclusive)?;

        let content = match fs::read(&paths.lease) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(job = lease.job_id(), "lease file already gone at release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<LockRecord>(&content) {
            Ok(current) if current.token == lease.token() => {
                fs::remove_file(&paths.lease)?;
                debug!(job = lease.job_id(), "lease released");
            }
            _ => warn!(
                job = lease.job_id(),
                "lease was reclaimed by another run, leaving its lock in place"
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl LockManager for FileLockManager {
    async fn acquire(&self, job_id: &str) -> Result<Acquired, LockError> {
        let locks = self.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || locks.acquire_blocking(&job_id))
            .await
            .map_err(|e| LockError::Io(io::Error::other(e)))?
    }

    async fn release(&self, lease: Lease) -> Result<(), LockError> {
        let locks = self.clone();
        tokio::task::spawn_blocking(move || locks.release_blocking(&lease))
            .await
            .map_err(|e| LockError::Io(io::Error::other(e)))?
    }
}
