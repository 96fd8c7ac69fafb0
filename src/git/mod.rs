//! Access to the git working tree maintained by the external mirror.
//!
//! The mirror atomically places a working tree at the configured path; this
//! module reads commit hashes from it and clones subtrees of it into per-run
//! workspaces. All operations shell out to the `git` binary so that the
//! in-repo decryption filter configured for a run participates in checkout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Read-only view of the mirrored repository
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    /// Hash of the most recent commit that touched the given subtree
    async fn hash_for_path(&self, subpath: &str) -> Result<String, Error>;

    /// Clone the working tree into `dest_dir`, checking out only the given
    /// subtree, and return the subtree's head hash. The provided environment
    /// is applied to the git subprocesses so that checkout filters (for
    /// example the decryption filter) see the per-run home.
    async fn clone_local(
        &self,
        environment: &[(String, String)],
        dest_dir: &Path,
        subpath: &str,
    ) -> Result<String, Error>;
}

/// [`Repository`] implementation over a local working tree
pub struct GitRepository {
    path: PathBuf,
}

impl GitRepository {
    /// Create a repository rooted at the mirror's working tree
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn run_git(
        &self,
        environment: &[(String, String)],
        cwd: &Path,
        args: &[&str],
    ) -> Result<String, Error> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in environment {
            cmd.env(k, v);
        }
        debug!(?args, cwd = %cwd.display(), "running git");
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::git(format!("failed to run git {}: {}", args.join(" "), e)))?;
        if !output.status.success() {
            return Err(Error::git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Repository for GitRepository {
    async fn hash_for_path(&self, subpath: &str) -> Result<String, Error> {
        let spec = if subpath.is_empty() { "." } else { subpath };
        let hash = self
            .run_git(
                &[],
                &self.path,
                &["log", "--pretty=format:%H", "-n", "1", "--", spec],
            )
            .await?;
        if hash.is_empty() {
            return Err(Error::git(format!(
                "no commits found for path {:?} in {}",
                spec,
                self.path.display()
            )));
        }
        Ok(hash)
    }

    async fn clone_local(
        &self,
        environment: &[(String, String)],
        dest_dir: &Path,
        subpath: &str,
    ) -> Result<String, Error> {
        let hash = self.hash_for_path(subpath).await?;
        let src = self.path.to_string_lossy().into_owned();
        let dst = dest_dir.to_string_lossy().into_owned();
        self.run_git(
            environment,
            dest_dir,
            &["clone", "--no-checkout", &src, &dst],
        )
        .await?;
        let spec = if subpath.is_empty() { "." } else { subpath };
        self.run_git(environment, dest_dir, &["checkout", &hash, "--", spec])
            .await?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn git_available() -> bool {
        StdCommand::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        let run = |args: &[&str]| {
            let out = StdCommand::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@localhost")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@localhost")
                .output()
                .unwrap();
            assert!(
                out.status.success(),
                "git {:?}: {}",
                args,
                String::from_utf8_lossy(&out.stderr)
            );
        };
        run(&["init", "-q"]);
        std::fs::create_dir(dir.join("app-a")).unwrap();
        std::fs::write(dir.join("app-a/deploy.yaml"), "kind: Deployment\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
    }

    #[tokio::test]
    async fn hash_for_path_returns_the_subtree_head() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let repo = GitRepository::new(dir.path());
        let head = repo.hash_for_path("").await.unwrap();
        let sub = repo.hash_for_path("app-a").await.unwrap();
        assert_eq!(head.len(), 40);
        assert_eq!(head, sub);
    }

    #[tokio::test]
    async fn hash_for_path_fails_for_unknown_subtree() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let repo = GitRepository::new(dir.path());
        assert!(repo.hash_for_path("no-such-dir").await.is_err());
    }

    #[tokio::test]
    async fn clone_local_checks_out_only_the_subtree() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::create_dir(dir.path().join("app-b")).unwrap();
        std::fs::write(dir.path().join("app-b/svc.yaml"), "kind: Service\n").unwrap();
        let run = |args: &[&str]| {
            StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@localhost")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@localhost")
                .output()
                .unwrap()
        };
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "add app-b"]);

        let repo = GitRepository::new(dir.path());
        let dest = tempfile::tempdir().unwrap();
        let hash = repo.clone_local(&[], dest.path(), "app-a").await.unwrap();
        assert_eq!(hash.len(), 40);
        assert!(dest.path().join("app-a/deploy.yaml").is_file());
        assert!(!dest.path().join("app-b/svc.yaml").exists());
    }
}
