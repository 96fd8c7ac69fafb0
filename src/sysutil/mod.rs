//! System utilities: wall clock abstraction, per-run temporary directories
//! and the startup wait for the repository working tree.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Wall clock abstraction so that run timestamps can be fixed in tests
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Elapsed time since the given instant
    fn since(&self, t: DateTime<Utc>) -> Duration;
}

/// Clock backed by the system time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn since(&self, t: DateTime<Utc>) -> Duration {
        (Utc::now() - t).to_std().unwrap_or(Duration::ZERO)
    }
}

/// The per-run workspace: a temporary home directory and a temporary
/// repository clone directory.
///
/// Both directories are removed when the workspace is dropped, which happens
/// on every exit path of a run, including cancellation. No two runs share a
/// workspace.
#[derive(Debug)]
pub struct Workspace {
    home: TempDir,
    repo: TempDir,
}

impl Workspace {
    /// Create the temporary directory pair for a run of the given Waybill
    pub fn create(namespace: &str, name: &str) -> Result<Self, Error> {
        let home = tempfile::Builder::new()
            .prefix(&format!("run_{}_{}_home_", namespace, name))
            .tempdir()?;
        let repo = tempfile::Builder::new()
            .prefix(&format!("run_{}_{}_repo_", namespace, name))
            .tempdir()?;
        Ok(Self { home, repo })
    }

    /// Path of the temporary home directory
    pub fn home(&self) -> &Path {
        self.home.path()
    }

    /// Path of the temporary repository directory
    pub fn repo(&self) -> &Path {
        self.repo.path()
    }
}

/// Wait for a directory to appear at the given path.
///
/// The repository mirror places the working tree at the configured path
/// atomically once its initial pull finishes, so it may not be present when
/// the process starts.
pub async fn wait_for_dir(path: &Path, interval: Duration, timeout: Duration) -> Result<(), Error> {
    info!(path = %path.display(), "waiting for directory");
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                info!(path = %path.display(), "found directory");
                return Ok(());
            }
            Ok(_) => {
                return Err(Error::config(format!(
                    "{} is not a directory",
                    path.display()
                )));
            }
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(Error::config(format!(
                    "error opening the directory at {}: {}",
                    path.display(),
                    e
                )));
            }
            Err(_) => {}
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(Error::config(format!(
                "timed out waiting for the directory at {}",
                path.display()
            )));
        }
        tokio::time::sleep(interval).await;
    }
}
