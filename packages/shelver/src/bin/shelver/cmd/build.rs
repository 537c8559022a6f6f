//! Builds images from the catalog, matching the given glob patterns (or
//! every image, if none are given).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::{Result, eyre::Context};
use colored::Colorize as _;
use console::Term;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools as _;
use tracing::{info, instrument, warn};

use shelver::archive::ArchiveCache;
use shelver::config;
use shelver::coordinator::{Coordinator, CoordinatorOptions, GitArchiveResolver};
use shelver::provider::InMemoryProvider;
use shelver::registry::Registry;
use shelver::runner::{BuildRunner, RunnerOptions};

use super::GlobalOptions;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Glob patterns selecting which images to build. Builds every image
    /// in the catalog when none are given.
    patterns: Vec<String>,

    /// Maximum number of builds running at once.
    #[arg(long = "max-builds", default_value_t = 4)]
    max_builds: usize,

    /// Override the scratch directory builds write into.
    #[arg(long = "temp-dir")]
    temp_dir: Option<PathBuf>,

    /// Override the archive cache directory.
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Override the per-build log directory.
    #[arg(long = "log-dir")]
    log_dir: Option<PathBuf>,

    /// Remove each build's scratch directory once it finishes.
    #[arg(long = "clean-temp-dir", default_value_t = true, overrides_with = "no_clean_temp_dir")]
    clean_temp_dir: bool,

    #[arg(long = "no-clean-temp-dir", hide = true)]
    no_clean_temp_dir: bool,

    /// Argv used to invoke the builder tool.
    #[arg(long = "builder-cmd", value_delimiter = ' ', default_value = "packer")]
    builder_cmd: Vec<String>,
}

#[instrument(skip(global, options))]
pub async fn exec(global: &GlobalOptions, options: Options) -> Result<()> {
    let loaded = config::load_catalog_file(&global.config_file)
        .await
        .with_context(|| format!("load catalog {:?}", global.config_file))?;

    let image_names = loaded
        .catalog
        .names()
        .into_iter()
        .filter(|name| options.patterns.is_empty() || options.patterns.iter().any(|pattern| glob_match(pattern, name)))
        .collect::<Vec<_>>();

    if image_names.is_empty() {
        println!("No images matched the given patterns");
        return Ok(());
    }

    let registry = Arc::new(Registry::new(Arc::new(loaded.catalog)));
    let provider = Arc::new(InMemoryProvider);

    let cache_dir = options.cache_dir.unwrap_or_else(|| global.cache_dir());
    let tmp_dir = options.temp_dir.unwrap_or_else(|| global.tmp_dir());
    let log_dir = options.log_dir.unwrap_or_else(|| global.log_dir());

    let archive_cache = ArchiveCache::new(cache_dir.join("git-archive"), tmp_dir.join("archive"));
    let archive_resolver = Arc::new(GitArchiveResolver::new(archive_cache));

    let colorize = Term::stdout().features().colors_supported();
    let runner = Arc::new(BuildRunner::new(RunnerOptions {
        builder_cmd: options.builder_cmd,
        catalog_dir: global.catalog_dir(),
        log_dir,
        colorize,
    }));

    let coordinator = Coordinator::new(
        registry,
        provider,
        runner,
        archive_resolver,
        CoordinatorOptions {
            max_builds: options.max_builds,
            tmp_dir,
            keep_tmp: options.no_clean_temp_dir || !options.clean_temp_dir,
            cancel_timeout: Duration::from_secs(30),
        },
    )
    .map_err(|err| color_eyre::eyre::eyre!("{err}"))
    .context("start coordinator")?;

    let progress = ProgressBar::new(image_names.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("configure progress bar")?,
    );

    let handles = image_names
        .iter()
        .map(|name| {
            let coordinator = coordinator.clone();
            let name = name.clone();
            tokio::spawn(async move { (name.clone(), coordinator.get_or_run_build(&name, None).await) })
        })
        .collect::<Vec<_>>();

    let shutdown = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { shutdown_on_ctrl_c(coordinator).await })
    };

    let mut failed = false;
    for handle in handles {
        let (name, result) = handle.await.context("join build task")?;
        progress.inc(1);
        match result {
            Ok(artifacts) => {
                let ids = artifacts.iter().map(|artifact| artifact.id.as_str()).join(", ");
                progress.println(format!("{}: {}", name.green(), if ids.is_empty() { "no artifacts".to_string() } else { ids }));
            }
            Err(err) => {
                failed = true;
                progress.println(format!("{}: {}", name.red(), err));
            }
        }
    }
    progress.finish_and_clear();
    shutdown.abort();

    if failed {
        color_eyre::eyre::bail!("one or more images failed to build");
    }
    Ok(())
}

/// Waits for Ctrl+C and asks the coordinator to cancel in-flight builds.
/// A second press while builds are still winding down escalates to a
/// forceful cancellation instead of waiting out the grace period.
async fn shutdown_on_ctrl_c<P, E, A>(coordinator: Arc<shelver::coordinator::Coordinator<P, E, A>>)
where
    P: shelver::provider::Provider + 'static,
    E: shelver::runner::BuildExecutor + 'static,
    A: shelver::coordinator::ArchiveResolver + 'static,
{
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to listen for ctrl-c; giving up on graceful shutdown");
            return;
        }
        info!("received interrupt, canceling in-flight builds");
        coordinator.cancel_and_wait().await;
    }
}

/// Match `text` against a `*`-wildcard glob pattern.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn recurse(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some((b'*', rest)) => (0..=text.len()).any(|i| recurse(rest, &text[i..])),
            Some((expected, rest)) => text.first().is_some_and(|actual| actual == expected) && recurse(rest, &text[1..]),
        }
    }
    recurse(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_supports_wildcards() {
        assert!(glob_match("*", "fedora"));
        assert!(glob_match("fed*", "fedora"));
        assert!(glob_match("*ora", "fedora"));
        assert!(glob_match("fedora", "fedora"));
        assert!(!glob_match("fedora", "server"));
        assert!(!glob_match("fed*x", "fedora"));
    }
}
