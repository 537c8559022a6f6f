//! A version-control backed archive producer: checks out a detached
//! worktree at the requested revision (with submodules), tars it excluding
//! VCS metadata, and cleans the worktree up afterward.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::{Result, Section, SectionExt, eyre::{Context, bail}};
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument, warn};

/// Produces a source archive from a git working tree at a given revision.
///
/// `worktree_lock` must be shared (the same `Arc`) across every producer
/// instance for the same `source_dir`: `git worktree add`/`prune` mutate
/// shared repository metadata, so concurrent archive builds against
/// different revisions of the *same* repository must not interleave those
/// calls, independently of the archive cache's own per-key lock.
pub struct GitArchiveProducer {
    source_dir: PathBuf,
    revision: String,
    worktree_lock: Arc<Mutex<()>>,
    resolved: OnceCell<String>,
}

impl GitArchiveProducer {
    pub fn new(source_dir: PathBuf, revision: impl Into<String>, worktree_lock: Arc<Mutex<()>>) -> Self {
        Self {
            source_dir,
            revision: revision.into(),
            worktree_lock,
            resolved: OnceCell::new(),
        }
    }
}

impl super::cache::ArchiveProducer for GitArchiveProducer {
    fn repo_name(&self) -> String {
        self.source_dir
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| self.source_dir.to_string_lossy().into_owned())
    }

    async fn resolve_revision(&self) -> Result<String> {
        self.resolved
            .get_or_try_init(|| async {
                let output = Command::new("git")
                    .arg("rev-parse")
                    .arg(&self.revision)
                    .current_dir(&self.source_dir)
                    .output()
                    .await
                    .context("run git rev-parse")?;
                if !output.status.success() {
                    bail!(
                        "git rev-parse {} failed in {:?}: {}",
                        self.revision,
                        self.source_dir,
                        String::from_utf8_lossy(&output.stderr)
                    );
                }
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            })
            .await
            .cloned()
    }

    #[instrument(skip(self), fields(source_dir = ?self.source_dir, revision = %self.revision))]
    async fn build(&self, scratch_dir: PathBuf) -> Result<PathBuf> {
        let commit_id = self.resolve_revision().await?;
        let worktree = scratch_dir.join("worktree");
        let basename = format!("{}-{commit_id}.tar.xz", self.repo_name());
        let archive_path = scratch_dir.join(&basename);

        let _guard = self.worktree_lock.lock().await;

        let add = run(
            Command::new("git")
                .arg("worktree")
                .arg("add")
                .arg("--detach")
                .arg(&worktree)
                .arg(&commit_id)
                .current_dir(&self.source_dir),
        )
        .await;

        let result = match add {
            Ok(()) => self.populate_and_archive(&worktree, &archive_path).await,
            Err(err) => Err(err),
        };

        if let Err(cleanup_err) = self.cleanup(&worktree).await {
            warn!(error = ?cleanup_err, "failed to clean up git worktree");
        }

        result.map(|()| archive_path)
    }
}

impl GitArchiveProducer {
    async fn populate_and_archive(&self, worktree: &Path, archive_path: &Path) -> Result<()> {
        run(Command::new("git")
            .arg("submodule")
            .arg("update")
            .arg("--init")
            .arg("--recursive")
            .arg("--checkout")
            .arg("--force")
            .current_dir(worktree))
        .await
        .context("update submodules")?;

        run(Command::new("tar")
            .arg("-c")
            .arg("--exclude=.git")
            .arg("--exclude=.git/*")
            .arg("-f")
            .arg(archive_path)
            .arg(".")
            .current_dir(worktree))
        .await
        .context("archive worktree")?;

        debug!(?archive_path, "archived worktree");
        Ok(())
    }

    /// Best-effort cleanup. Errors here are logged but never override a real
    /// build error, since the archive may already have been produced.
    async fn cleanup(&self, worktree: &Path) -> Result<()> {
        if crate::fs::exists(worktree).await {
            crate::fs::remove_dir_all(worktree).await.ok();
        }
        run(Command::new("git")
            .arg("worktree")
            .arg("prune")
            .current_dir(&self.source_dir))
        .await
    }
}

async fn run(cmd: &mut Command) -> Result<()> {
    let output = cmd.output().await.context("spawn process")?;
    if !output.status.success() {
        return Err(color_eyre::eyre::eyre!("command exited with {:?}", output.status.code()))
            .with_section(|| String::from_utf8_lossy(&output.stdout).to_string().header("Stdout:"))
            .with_section(|| String::from_utf8_lossy(&output.stderr).to_string().header("Stderr:"));
    }
    Ok(())
}
