//! Mirroring stored files to a durable remote.
//!
//! After the identity index or a page result is written locally, the written
//! files are handed to a [`MetadataSink`]. The local write is the source of
//! truth: a sink failure is logged and otherwise ignored.

use std::time::Duration;

use tokio::{process::Command, sync::Mutex};

use crate::{
    async_utils::{check_for_command_failure, output_with_timeout},
    prelude::*,
};

/// Somewhere to mirror files after each successful local write.
#[async_trait]
pub trait MetadataSink: Send + Sync + 'static {
    /// Mirror `paths`. Never fails; problems are logged.
    async fn mirror(&self, paths: &[PathBuf]);
}

/// A sink which does nothing.
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl MetadataSink for NoopSink {
    async fn mirror(&self, _paths: &[PathBuf]) {}
}

/// Commits files to a git working tree and pushes them.
#[derive(Debug)]
pub struct GitSink {
    /// The root of the git working tree.
    repo_dir: PathBuf,
    /// The remote to push to.
    remote: String,
    /// The branch to push.
    branch: String,
    /// Upper bound for each git invocation.
    timeout: Duration,
    /// Only one add/commit/push sequence may run at a time, or git's own
    /// index lock will make the others fail.
    lock: Mutex<()>,
}

impl GitSink {
    /// Create a new git sink.
    pub fn new(repo_dir: PathBuf, remote: String, branch: String, timeout: Duration) -> Self {
        Self {
            repo_dir,
            remote,
            branch,
            timeout,
            lock: Mutex::new(()),
        }
    }

    /// Build a `git` command which runs inside our working tree.
    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_dir);
        cmd
    }

    /// Add, commit and push `paths`.
    async fn try_mirror(&self, paths: &[PathBuf]) -> Result<()> {
        // `git -C` resolves relative paths against the working tree, not our
        // current directory.
        let paths = paths
            .iter()
            .map(std::path::absolute)
            .collect::<std::io::Result<Vec<_>>>()
            .context("cannot resolve paths to mirror")?;
        let _guard = self.lock.lock().await;

        let mut add = self.git();
        add.arg("add").arg("--").args(&paths);
        let output = output_with_timeout("git add", add, self.timeout).await?;
        check_for_command_failure("git add", &output, None)?;

        let mut commit = self.git();
        commit
            .arg("commit")
            .arg("-m")
            .arg("Update OCR results")
            .arg("--")
            .args(&paths);
        let output = output_with_timeout("git commit", commit, self.timeout).await?;
        if !output.status.success() {
            // Rewriting a file with identical contents leaves nothing to commit.
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("nothing to commit") {
                debug!("Nothing to commit");
                return Ok(());
            }
            check_for_command_failure("git commit", &output, None)?;
        }

        let mut push = self.git();
        push.arg("push").arg(&self.remote).arg(&self.branch);
        let output = output_with_timeout("git push", push, self.timeout).await?;
        check_for_command_failure("git push", &output, None)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataSink for GitSink {
    #[instrument(level = "debug", skip_all, fields(repo = %self.repo_dir.display()))]
    async fn mirror(&self, paths: &[PathBuf]) {
        if paths.is_empty() {
            return;
        }
        if let Err(err) = self.try_mirror(paths).await {
            warn!("Could not mirror {} file(s) to git: {:#}", paths.len(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn git_sink_failures_are_not_fatal() {
        // Not a git repository, so every git command fails.
        let dir = tempfile::TempDir::with_prefix("not-a-repo").unwrap();
        let sink = GitSink::new(
            dir.path().to_owned(),
            "origin".to_owned(),
            "main".to_owned(),
            Duration::from_secs(5),
        );
        sink.mirror(&[dir.path().join("index.json")]).await;
    }
}
