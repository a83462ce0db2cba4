use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use walkdir::WalkDir;

/// Ships a finished, verified artifact off the machine.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    async fn push(&self, location: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// The run waits for the push to finish.
    #[default]
    Inline,
    /// The push is spawned and the run finishes without waiting.
    Detached,
}

/// Copies artifacts into a mounted remote directory (NFS, sshfs, ...).
#[derive(Debug, Clone)]
pub struct DirectorySync {
    dest: PathBuf,
}

impl DirectorySync {
    pub fn new<P: AsRef<Path>>(dest: P) -> Self {
        Self {
            dest: dest.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RemoteSync for DirectorySync {
    async fn push(&self, location: &str) -> Result<()> {
        let source = PathBuf::from(location);
        let dest = self.dest.clone();
        tokio::task::spawn_blocking(move || copy_into(&source, &dest))
            .await
            .context("sync task panicked")?
    }
}

fn copy_into(source: &Path, dest_dir: &Path) -> Result<()> {
    let name = source
        .file_name()
        .with_context(|| format!("Artifact {} has no file name", source.display()))?;
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    let partial = dest_dir.join(format!(".{}.partial", name.to_string_lossy()));
    let target = dest_dir.join(name);
    // a crashed push leaves its partial copy behind
    remove_path(&partial)
        .with_context(|| format!("Failed to clear stale {}", partial.display()))?;
    let copied = if source.is_dir() {
        copy_tree(source, &partial)
    } else {
        std::fs::copy(source, &partial)
            .map(|_| ())
            .with_context(|| format!("Failed to copy {}", source.display()))
    };
    if let Err(e) = copied {
        let _ = remove_path(&partial);
        return Err(e);
    }
    // rename replaces a file but not a non-empty directory
    if target.is_dir() {
        remove_path(&target)
            .with_context(|| format!("Failed to replace {}", target.display()))?;
    }
    std::fs::rename(&partial, &target)
        .with_context(|| format!("Failed to move artifact into {}", target.display()))
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(source)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        } else {
            tracing::warn!("Skip non-regular file during sync: {}", entry.path().display());
        }
    }
    Ok(())
}

/// Runs an external transfer tool such as `rsync` or `aws s3 cp`.
///
/// Every `{}` in the arguments is replaced by the artifact location; if no
/// argument contains `{}` the location is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandSync {
    program: String,
    args: Vec<String>,
}

impl CommandSync {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn render_args(&self, location: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{}", location))
            .collect();
        if !self.args.iter().any(|arg| arg.contains("{}")) {
            args.push(location.to_string());
        }
        args
    }
}

#[async_trait]
impl RemoteSync for CommandSync {
    async fn push(&self, location: &str) -> Result<()> {
        let args = self.render_args(location);
        tracing::debug!(program = %self.program, ?args, "running sync command");
        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
