//! End-to-end tests that drive the real Build Coordinator, Runner, Watcher
//! and git-backed archive cache against a fake Packer script, exercising
//! the scenarios from the core's testable-properties section without
//! mocking any of the pieces they actually wire together.

use std::sync::Arc;
use std::time::Duration;

use e2e::{Fixture, GitRepo};
use pretty_assertions::assert_eq;
use shelver::archive::ArchiveCache;
use shelver::coordinator::{Coordinator, CoordinatorOptions, GitArchiveResolver};
use shelver::error::CoreError;
use shelver::provider::InMemoryProvider;
use shelver::registry::Registry;
use shelver::runner::{BuildRunner, RunnerOptions};

async fn start_coordinator(
    document: &str,
) -> color_eyre::Result<Arc<Coordinator<InMemoryProvider, BuildRunner, GitArchiveResolver>>> {
    let fixture = Fixture::new().await?;
    let loaded = shelver::config::load_catalog(document)?;
    let registry = Arc::new(Registry::new(Arc::new(loaded.catalog)));
    let provider = Arc::new(InMemoryProvider);

    let work_dir = tempfile::tempdir()?;
    let archive_cache = ArchiveCache::new(work_dir.path().join("cache"), work_dir.path().join("archive-tmp"));
    let archive_resolver = Arc::new(GitArchiveResolver::new(archive_cache));

    let runner = Arc::new(BuildRunner::new(RunnerOptions {
        builder_cmd: fixture.builder_cmd(),
        catalog_dir: fixture.catalog_dir(),
        log_dir: work_dir.path().join("log"),
        colorize: false,
    }));

    let coordinator = Coordinator::new(
        registry,
        provider,
        runner,
        archive_resolver,
        CoordinatorOptions {
            max_builds: 4,
            tmp_dir: work_dir.path().join("tmp"),
            keep_tmp: false,
            cancel_timeout: Duration::from_secs(5),
        },
    )
    .map_err(|err| color_eyre::eyre::eyre!("{err}"))?;

    // Keep the fixture and scratch directories alive for the coordinator's
    // lifetime by leaking their TempDir guards; the OS reclaims them on
    // process exit, which is fine for a short-lived test binary.
    std::mem::forget(fixture);
    std::mem::forget(work_dir);

    Ok(coordinator)
}

#[test_log::test(tokio::test)]
async fn single_image_with_no_base_registers_one_artifact() {
    let repo = GitRepo::init().await.unwrap();
    let document = format!(
        r#"
fedora:
  current_version: "25"
  archive:
    source_dir: "{}"
    revision: HEAD
"#,
        repo.path().display()
    );

    let coordinator = start_coordinator(&document).await.unwrap();
    let artifacts = coordinator.get_or_run_build("fedora", None).await.unwrap();

    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].id, "ami-fedora");
    assert_eq!(artifacts[0].image.as_deref(), Some("fedora"));
    assert_eq!(artifacts[0].version.as_deref(), Some("25"));
}

#[test_log::test(tokio::test)]
async fn base_dependency_is_built_before_the_dependent_image() {
    let repo = GitRepo::init().await.unwrap();
    let document = format!(
        r#"
fedora:
  current_version: "25"
  archive:
    source_dir: "{src}"
    revision: HEAD
server:
  current_version: "2"
  base: fedora
  archive:
    source_dir: "{src}"
    revision: HEAD
"#,
        src = repo.path().display()
    );

    let coordinator = start_coordinator(&document).await.unwrap();
    let artifacts = coordinator.get_or_run_build("server", None).await.unwrap();

    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].id, "ami-server");

    let results = coordinator.run_all().await;
    let built: std::collections::BTreeSet<_> = results.into_iter().map(|(key, _)| key).collect();
    assert!(built.contains(&("fedora".to_string(), "25".to_string())));
    assert!(built.contains(&("server".to_string(), "2".to_string())));
}

#[test_log::test(tokio::test)]
async fn pinned_non_current_base_version_without_a_registered_artifact_fails() {
    let repo = GitRepo::init().await.unwrap();
    let document = format!(
        r#"
server:
  current_version: "2"
  archive:
    source_dir: "{src}"
    revision: HEAD
web:
  current_version: "1"
  base: "server:1"
  archive:
    source_dir: "{src}"
    revision: HEAD
"#,
        src = repo.path().display()
    );

    let coordinator = start_coordinator(&document).await.unwrap();
    let err = coordinator.get_or_run_build("web", None).await.unwrap_err();

    assert!(matches!(*err, CoreError::BaseImageFailed { .. }), "expected BaseImageFailed, got {err:?}");
}

#[test_log::test(tokio::test)]
async fn concurrent_requests_for_the_same_build_are_deduplicated() {
    let repo = GitRepo::init().await.unwrap();
    let document = format!(
        r#"
fedora:
  current_version: "25"
  archive:
    source_dir: "{}"
    revision: HEAD
"#,
        repo.path().display()
    );

    let coordinator = start_coordinator(&document).await.unwrap();
    let (first, second) =
        tokio::join!(coordinator.get_or_run_build("fedora", None), coordinator.get_or_run_build("fedora", None));

    assert_eq!(first.unwrap(), second.unwrap());
}
