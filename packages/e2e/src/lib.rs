//! Fixtures shared by the end-to-end tests: a fake Packer binary that speaks
//! just enough of the machine-readable protocol to stand in for the real
//! tool, and a throwaway git repository to exercise the archive cache
//! against a real `git`/`tar` toolchain.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tokio::process::Command;

/// A fake `packer` that reports one artifact, derived from the `image` field
/// the test's Packer template stamps into the rendered JSON, so the same
/// script can stand in for every image in a build.
///
/// Invoked as `<script> build -machine-readable <template.json>`, matching
/// [`shelver::runner::BuildRunner`]'s real argv shape.
const FAKE_PACKER: &str = r#"#!/bin/sh
set -eu
template="$3"
name=$(grep -o '"image": *"[^"]*"' "$template" | head -n1 | sed -E 's/.*"([^"]*)"$/\1/')
printf '1000,,ui,say,building %s\n' "$name"
printf '1000,,artifact,0,id,us-east-1:ami-%s\n' "$name"
printf '1000,,artifact,0,end\n'
"#;

/// The Packer template every fixture image in a test catalog shares. Stamps
/// the rendered image name into the top-level `image` field so
/// [`FAKE_PACKER`] can tell builds apart.
const FAKE_TEMPLATE: &str = r#"
image: "{{ name }}"
builders:
  - type: null-builder
    communicator: none
"#;

/// A self-contained fixture directory: a Packer template the runner can
/// render, and the fake builder script it should invoke.
pub struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    pub async fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create fixture dir")?;
        let script_path = dir.path().join("fake-packer.sh");
        tokio::fs::write(&script_path, FAKE_PACKER).await.context("write fake packer script")?;
        set_executable(&script_path).await?;
        tokio::fs::write(dir.path().join("packer.yml"), FAKE_TEMPLATE).await.context("write packer template")?;
        Ok(Self { dir })
    }

    /// The directory image templates are resolved relative to
    /// (`RunnerOptions::catalog_dir`).
    pub fn catalog_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// The argv that invokes the fake builder tool (`RunnerOptions::builder_cmd`).
    pub fn builder_cmd(&self) -> Vec<String> {
        vec!["sh".to_string(), self.dir.path().join("fake-packer.sh").display().to_string()]
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await.context("stat fixture script")?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await.context("chmod fixture script")
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// A throwaway git repository with a single commit, suitable as an image's
/// `archive.source_dir`.
pub struct GitRepo {
    dir: tempfile::TempDir,
}

impl GitRepo {
    pub async fn init() -> Result<Self> {
        let dir = tempfile::tempdir().context("create repo dir")?;
        tokio::fs::write(dir.path().join("README.md"), b"fixture repo\n").await.context("write repo file")?;

        for args in [
            vec!["init", "--initial-branch=main"],
            vec!["config", "user.email", "fixture@example.com"],
            vec!["config", "user.name", "Fixture"],
            vec!["add", "."],
            vec!["commit", "-m", "initial"],
        ] {
            run_git(dir.path(), &args).await?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git").args(args).current_dir(cwd).output().await.context("run git")?;
    if !output.status.success() {
        color_eyre::eyre::bail!("git {:?} failed: {}", args, String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}
