//! Subprocess spawning helper shared by the build runner.
//!
//! Mirrors the teacher's `cargo::invoke` idiom: build up a `Command`,
//! capture its pipes, and surface non-zero exits with the captured output
//! attached as report sections.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use tokio::process::{Child, Command};
use tracing::instrument;

/// Spawn the builder tool with piped stdout/stderr so the watcher can read
/// its machine-readable protocol line by line.
#[instrument(skip(env))]
pub fn spawn_builder_tool(
    argv: &[String],
    cwd: &Path,
    env: impl IntoIterator<Item = (String, String)>,
) -> Result<Child> {
    let (program, args) = argv.split_first().context("builder tool argv must not be empty")?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    cmd.spawn().with_context(|| format!("spawn builder tool: {argv:?}"))
}
