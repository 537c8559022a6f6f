//! The Build Coordinator: a dependency-aware scheduler that resolves base
//! artifacts lazily (recursing into child builds as needed), bounds
//! concurrency with a counting semaphore, deduplicates concurrent requests
//! for the same `(image, version)`, and implements graceful-then-forceful
//! cancellation.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, instrument, warn};

use crate::archive::{ArchiveCache, ArchiveInfo, ArchiveProducer as _, GitArchiveProducer};
use crate::error::{CoreError, CoreResult};
use crate::model::{Artifact, Image};
use crate::provider::Provider;
use crate::registry::Registry;
use crate::runner::BuildExecutor;
use crate::watcher::CancelStage;

/// Resolves an image's source archive to a local path. A seam so the
/// coordinator can be exercised without shelling out to git.
pub trait ArchiveResolver: Send + Sync {
    fn resolve(&self, image: &Image) -> impl Future<Output = CoreResult<ArchiveInfo>> + Send;
}

/// The archive resolver used outside of tests: a git-backed producer behind
/// the exclusive-build-lock archive cache, with one worktree mutex per
/// distinct `source_dir` shared across every producer built against it.
pub struct GitArchiveResolver {
    cache: ArchiveCache,
    worktree_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl GitArchiveResolver {
    pub fn new(cache: ArchiveCache) -> Self {
        Self {
            cache,
            worktree_locks: DashMap::new(),
        }
    }
}

impl ArchiveResolver for GitArchiveResolver {
    async fn resolve(&self, image: &Image) -> CoreResult<ArchiveInfo> {
        let source_dir = image
            .archive
            .get("source_dir")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::configuration(format!("image {:?} is missing archive.source_dir", image.name)))?;
        let revision = image.archive.get("revision").and_then(Value::as_str).unwrap_or("HEAD");

        let lock = self
            .worktree_locks
            .entry(source_dir.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let producer = GitArchiveProducer::new(PathBuf::from(source_dir), revision, lock);

        let path = self
            .cache
            .get_or_build(&producer)
            .await
            .map_err(|err| CoreError::configuration(format!("{err:#}")))?;
        // Already memoized by `get_or_build`'s own call, so this doesn't
        // re-invoke `git rev-parse`.
        let resolved_revision = producer
            .resolve_revision()
            .await
            .map_err(|err| CoreError::configuration(format!("{err:#}")))?;

        Ok(ArchiveInfo {
            path,
            source_dir: PathBuf::from(source_dir),
            revision: resolved_revision,
        })
    }
}

type BuildFuture = Shared<BoxFuture<'static, Result<Vec<Artifact>, Arc<CoreError>>>>;

/// Tunable resource limits, separate from the wiring (registry/provider/
/// runner/archive resolver) so they can be adjusted without touching the
/// collaborators.
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    pub max_builds: usize,
    pub tmp_dir: PathBuf,
    pub keep_tmp: bool,
    pub cancel_timeout: Duration,
}

/// Schedules and runs builds, deduplicating by `(image, version)` and
/// resolving base-artifact dependencies (possibly recursively) before a
/// build ever occupies a concurrency slot.
pub struct Coordinator<P, E, A> {
    registry: Arc<Registry>,
    provider: Arc<P>,
    executor: Arc<E>,
    archive_resolver: Arc<A>,
    options: CoordinatorOptions,
    semaphore: Arc<Semaphore>,
    builds: DashMap<(String, String), BuildFuture>,
    pending: AtomicUsize,
    all_finished: Notify,
    stopping: AtomicBool,
    cancel_tx: watch::Sender<CancelStage>,
    cancel_rx: watch::Receiver<CancelStage>,
}

impl<P, E, A> Coordinator<P, E, A>
where
    P: Provider + 'static,
    E: BuildExecutor + 'static,
    A: ArchiveResolver + 'static,
{
    pub fn new(registry: Arc<Registry>, provider: Arc<P>, executor: Arc<E>, archive_resolver: Arc<A>, options: CoordinatorOptions) -> CoreResult<Arc<Self>> {
        registry.check_cycles()?;
        let (cancel_tx, cancel_rx) = watch::channel(CancelStage::None);
        let max_builds = options.max_builds.max(1);
        Ok(Arc::new(Self {
            registry,
            provider,
            executor,
            archive_resolver,
            options,
            semaphore: Arc::new(Semaphore::new(max_builds)),
            builds: DashMap::new(),
            pending: AtomicUsize::new(0),
            all_finished: Notify::new(),
            stopping: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        }))
    }

    /// Return the Build Future for `(image, version)`, creating and
    /// scheduling it on first request. `version` defaults to the image's
    /// current version. Any number of concurrent callers asking for the same
    /// key observe the identical future and result.
    #[instrument(skip(self), fields(%image_name))]
    pub async fn get_or_run_build(self: &Arc<Self>, image_name: &str, version: Option<&str>) -> Result<Vec<Artifact>, Arc<CoreError>> {
        let image = self.registry.get_image(image_name).map_err(Arc::new)?.clone();
        let version = version.map(str::to_string).unwrap_or_else(|| image.current_version.clone());
        let key = (image_name.to_string(), version.clone());

        if let Some(existing) = self.builds.get(&key) {
            return existing.value().clone().await;
        }

        if self.stopping.load(Ordering::SeqCst) {
            return Err(Arc::new(CoreError::configuration("coordinator is accepting no new builds")));
        }

        let entry = self.builds.entry(key).or_insert_with(|| {
            // Only runs when we win the insertion race, so the pending count
            // and this future's single execution stay in lockstep.
            self.pending.fetch_add(1, Ordering::SeqCst);
            let this = Arc::clone(self);
            let image = image.clone();
            let version = version.clone();
            async move {
                let result = this.run_build(image, version).await;
                this.pending.fetch_sub(1, Ordering::SeqCst);
                this.all_finished.notify_waiters();
                result
            }
            .boxed()
            .shared()
        });
        let shared = entry.value().clone();
        drop(entry);
        shared.await
    }

    async fn run_build(self: &Arc<Self>, image: Image, version: String) -> Result<Vec<Artifact>, Arc<CoreError>> {
        if version != image.current_version {
            return Err(Arc::new(CoreError::configuration(format!(
                "refusing to build {}:{version}, which is not the current version ({})",
                image.name, image.current_version
            ))));
        }

        let base_artifact = self.resolve_base_artifact_or_cancel(&image).await.map_err(|source| {
            if matches!(*source, CoreError::Canceled) {
                source
            } else {
                Arc::new(CoreError::BaseImageFailed {
                    source: Box::new((*source).clone()),
                })
            }
        })?;

        let permit = self.acquire_slot_or_cancel().await?;

        let result = self.run_build_in_slot(&image, &version, base_artifact.as_ref()).await;
        drop(permit);

        let raw_artifacts = result.map_err(Arc::new)?;
        let mut artifacts = Vec::with_capacity(raw_artifacts.len());
        for raw in raw_artifacts {
            let Some(id) = raw.id.clone() else {
                warn!(image = %image.name, ?raw, "builder tool reported an artifact with no id; skipping");
                continue;
            };
            match self
                .provider
                .load_artifact_by_id(&self.registry, &id, raw.region.as_deref(), &image.name, &version)
                .await
            {
                Ok(artifact) => artifacts.push(artifact),
                Err(err) => warn!(image = %image.name, %id, error = %err, "failed to register artifact; skipping"),
            }
        }
        Ok(artifacts)
    }

    async fn run_build_in_slot(&self, image: &Image, version: &str, base_artifact: Option<&Artifact>) -> CoreResult<Vec<crate::watcher::RawArtifact>> {
        let archive = self.resolve_archive_or_cancel(image).await?;

        let scratch_dir = tempfile::Builder::new()
            .prefix("shelver-build-")
            .tempdir_in(&self.options.tmp_dir)
            .map_err(|err| CoreError::configuration(format!("create build scratch dir: {err}")))?;

        let started = jiff::Timestamp::now();
        let outcome = self
            .executor
            .run(scratch_dir.path(), image, version, &archive, base_artifact, self.cancel_rx.clone())
            .await;
        let elapsed = started.duration_until(jiff::Timestamp::now());
        debug!(image = %image.name, %version, ?elapsed, ok = outcome.is_ok(), "build finished");

        if self.options.keep_tmp {
            let _ = scratch_dir.into_path();
        }

        outcome
    }

    /// Race archive resolution against cancellation, so a queued build
    /// doesn't start producing/fetching an archive after `cancel_and_wait`.
    async fn resolve_archive_or_cancel(&self, image: &Image) -> CoreResult<ArchiveInfo> {
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            biased;
            Ok(()) = cancel_rx.changed() => Err(CoreError::Canceled),
            result = self.archive_resolver.resolve(image) => result,
        }
    }

    /// Race `resolve_base_artifact` against cancellation, so a build that's
    /// still resolving its base when `cancel_and_wait` fires never reaches
    /// the semaphore.
    async fn resolve_base_artifact_or_cancel(self: &Arc<Self>, image: &Image) -> Result<Option<Artifact>, Arc<CoreError>> {
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            biased;
            Ok(()) = cancel_rx.changed() => Err(Arc::new(CoreError::Canceled)),
            result = self.resolve_base_artifact(image) => result,
        }
    }

    /// Race acquiring a concurrency slot against cancellation, so a build
    /// still queued behind the semaphore never spawns a subprocess after
    /// cancellation.
    async fn acquire_slot_or_cancel(self: &Arc<Self>) -> Result<OwnedSemaphorePermit, Arc<CoreError>> {
        let mut cancel_rx = self.cancel_rx.clone();
        tokio::select! {
            biased;
            Ok(()) = cancel_rx.changed() => Err(Arc::new(CoreError::Canceled)),
            result = self.semaphore.clone().acquire_owned() => result.map_err(|_| Arc::new(CoreError::Canceled)),
        }
    }

    /// Resolve `image.base` to an artifact, possibly recursing into another
    /// build. A pinned, non-current base version is never built — only an
    /// already-registered artifact can satisfy it.
    async fn resolve_base_artifact(self: &Arc<Self>, image: &Image) -> Result<Option<Artifact>, Arc<CoreError>> {
        let Some((base_name, base_version)) = image.base_with_version() else {
            return Ok(None);
        };

        let Some(base_image) = self.registry.catalog().get(base_name).cloned() else {
            return self.registry.get_artifact_by_name(base_name).map(Some).map_err(Arc::new);
        };

        let version = base_version.unwrap_or(&base_image.current_version);
        if let Some(existing) = self.registry.get_image_artifact(&base_image, Some(version)) {
            return Ok(Some(existing));
        }

        if version != base_image.current_version {
            return Err(Arc::new(CoreError::unknown_artifact(format!("{base_name}:{version}"))));
        }

        let artifacts = self.get_or_run_build(base_name, Some(version)).await?;
        self.registry
            .get_image_artifact(&base_image, Some(version))
            .or_else(|| artifacts.into_iter().next())
            .map(Some)
            .ok_or_else(|| Arc::new(CoreError::unknown_artifact(format!("{base_name}:{version}"))))
    }

    /// Wait until every currently-pending (and recursively-triggered) build
    /// has reached a terminal state, then return each Build Future's result.
    #[instrument(skip(self))]
    pub async fn run_all(self: &Arc<Self>) -> Vec<((String, String), Result<Vec<Artifact>, Arc<CoreError>>)> {
        self.wait_for_idle().await;
        self.builds
            .iter()
            .filter_map(|entry| entry.value().peek().map(|result| (entry.key().clone(), result.clone())))
            .collect()
    }

    async fn wait_for_idle(&self) {
        loop {
            let notified = self.all_finished.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting new builds and cancel every pending one: politely
    /// first, then forcefully if they haven't settled within
    /// `cancel_timeout`. A second call always escalates straight to forceful.
    #[instrument(skip(self))]
    pub async fn cancel_and_wait(self: &Arc<Self>) {
        let already_stopping = self.stopping.swap(true, Ordering::SeqCst);
        let stage = if already_stopping { CancelStage::Forceful } else { CancelStage::Graceful };
        debug!(stage = %stage, "canceling pending builds");
        let _ = self.cancel_tx.send(stage);

        if stage == CancelStage::Forceful {
            self.wait_for_idle().await;
            return;
        }

        if tokio::time::timeout(self.options.cancel_timeout, self.wait_for_idle()).await.is_err() {
            let _ = self.cancel_tx.send(CancelStage::Forceful);
            self.wait_for_idle().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageCatalog;
    use crate::provider::InMemoryProvider;
    use crate::watcher::RawArtifact;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    fn image(name: &str, base: Option<&str>) -> Image {
        Image {
            name: name.to_string(),
            current_version: "1".to_string(),
            environment: "prod".to_string(),
            description: String::new(),
            template_path: "packer.yml".to_string(),
            base: base.map(str::to_string),
            archive: serde_json::json!({}),
            provision: None,
            instance_type: None,
            metadata: vec![],
            builder_overrides: serde_json::json!({}),
        }
    }

    struct NoopArchiveResolver;

    impl ArchiveResolver for NoopArchiveResolver {
        async fn resolve(&self, _image: &Image) -> CoreResult<ArchiveInfo> {
            Ok(ArchiveInfo {
                path: PathBuf::from("/dev/null"),
                source_dir: PathBuf::from("/dev/null"),
                revision: "deadbeef".to_string(),
            })
        }
    }

    /// Records the order in which builds ran and returns one scripted
    /// artifact id per image, without spawning any subprocess.
    struct RecordingExecutor {
        order: StdMutex<Vec<String>>,
    }

    impl RecordingExecutor {
        fn new() -> Self {
            Self { order: StdMutex::new(Vec::new()) }
        }
    }

    impl BuildExecutor for RecordingExecutor {
        async fn run(
            &self,
            _scratch_dir: &std::path::Path,
            image: &Image,
            version: &str,
            _archive: &ArchiveInfo,
            _base_artifact: Option<&Artifact>,
            _cancel_rx: watch::Receiver<CancelStage>,
        ) -> CoreResult<Vec<RawArtifact>> {
            self.order.lock().unwrap().push(image.name.clone());
            Ok(vec![RawArtifact {
                id: Some(format!("ami-{}-{version}", image.name)),
                region: Some("us-east-1".to_string()),
                fields: Default::default(),
            }])
        }
    }

    fn test_coordinator(catalog: ImageCatalog) -> (Arc<Coordinator<InMemoryProvider, RecordingExecutor, NoopArchiveResolver>>, Arc<RecordingExecutor>) {
        let registry = Arc::new(Registry::new(Arc::new(catalog)));
        let executor = Arc::new(RecordingExecutor::new());
        let coordinator = Coordinator::new(
            registry,
            Arc::new(InMemoryProvider),
            executor.clone(),
            Arc::new(NoopArchiveResolver),
            CoordinatorOptions {
                max_builds: 4,
                tmp_dir: std::env::temp_dir(),
                keep_tmp: false,
                cancel_timeout: Duration::from_millis(200),
            },
        )
        .unwrap();
        (coordinator, executor)
    }

    #[tokio::test]
    async fn single_image_with_no_base_registers_one_artifact() {
        let (coordinator, _executor) = test_coordinator(ImageCatalog::new([image("fedora", None)]));
        let artifacts = coordinator.get_or_run_build("fedora", None).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].id, "ami-fedora-1");
    }

    #[tokio::test]
    async fn base_dependency_builds_before_the_dependent_image() {
        let catalog = ImageCatalog::new([image("fedora", None), image("server", Some("fedora"))]);
        let (coordinator, executor) = test_coordinator(catalog);

        let artifacts = coordinator.get_or_run_build("server", None).await.unwrap();
        assert_eq!(artifacts[0].id, "ami-server-1");

        let order = executor.order.lock().unwrap();
        let fedora_idx = order.iter().position(|n| n == "fedora").unwrap();
        let server_idx = order.iter().position(|n| n == "server").unwrap();
        assert!(fedora_idx < server_idx);
    }

    #[tokio::test]
    async fn pinned_non_current_base_version_without_a_registered_artifact_fails() {
        let mut server = image("server", None);
        server.current_version = "2".to_string();
        let web = {
            let mut web = image("web", Some("server:1"));
            web.current_version = "1".to_string();
            web
        };
        let catalog = ImageCatalog::new([server, web]);
        let (coordinator, _executor) = test_coordinator(catalog);

        let err = coordinator.get_or_run_build("web", None).await.unwrap_err();
        assert!(matches!(*err, CoreError::BaseImageFailed { .. }));
    }

    #[tokio::test]
    async fn concurrent_requests_for_the_same_build_are_deduplicated() {
        let (coordinator, executor) = test_coordinator(ImageCatalog::new([image("fedora", None)]));

        let a = coordinator.clone();
        let b = coordinator.clone();
        let (r1, r2) = tokio::join!(a.get_or_run_build("fedora", None), b.get_or_run_build("fedora", None));

        assert_eq!(r1.unwrap(), r2.unwrap());
        assert_eq!(executor.order.lock().unwrap().len(), 1, "build should run exactly once");
    }

    #[tokio::test]
    async fn run_all_waits_for_recursively_triggered_builds() {
        let catalog = ImageCatalog::new([image("fedora", None), image("server", Some("fedora"))]);
        let (coordinator, _executor) = test_coordinator(catalog);

        coordinator.get_or_run_build("server", None).await.unwrap();
        let results = coordinator.run_all().await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
    }

    /// An executor that blocks inside `run` until released, so a test can
    /// hold the only concurrency slot open while a second build queues
    /// behind the semaphore.
    struct BlockingExecutor {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
        calls: StdMutex<usize>,
    }

    impl BuildExecutor for BlockingExecutor {
        async fn run(
            &self,
            _scratch_dir: &std::path::Path,
            _image: &Image,
            version: &str,
            _archive: &ArchiveInfo,
            _base_artifact: Option<&Artifact>,
            _cancel_rx: watch::Receiver<CancelStage>,
        ) -> CoreResult<Vec<RawArtifact>> {
            *self.calls.lock().unwrap() += 1;
            self.started.notify_one();
            self.release.notified().await;
            Ok(vec![RawArtifact {
                id: Some(format!("ami-{version}")),
                region: None,
                fields: Default::default(),
            }])
        }
    }

    #[tokio::test]
    async fn semaphore_queued_build_cancels_instead_of_running() {
        let catalog = ImageCatalog::new([image("fedora", None), image("other", None)]);
        let registry = Arc::new(Registry::new(Arc::new(catalog)));
        let executor = Arc::new(BlockingExecutor {
            started: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            calls: StdMutex::new(0),
        });
        let coordinator = Coordinator::new(
            registry,
            Arc::new(InMemoryProvider),
            executor.clone(),
            Arc::new(NoopArchiveResolver),
            CoordinatorOptions {
                max_builds: 1,
                tmp_dir: std::env::temp_dir(),
                keep_tmp: false,
                cancel_timeout: Duration::from_millis(200),
            },
        )
        .unwrap();

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.get_or_run_build("fedora", None).await })
        };
        // Wait for the first build to actually occupy the only slot.
        executor.started.notified().await;

        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.get_or_run_build("other", None).await })
        };
        // Give the second build a chance to reach and queue on the semaphore.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let _ = coordinator.cancel_tx.send(CancelStage::Graceful);

        let second_result = second.await.unwrap();
        let err = second_result.unwrap_err();
        assert!(matches!(*err, CoreError::Canceled), "queued build should be canceled, got {err:?}");
        assert_eq!(*executor.calls.lock().unwrap(), 1, "the canceled, still-queued build must never reach the executor");

        executor.release.notify_one();
        first.await.unwrap().unwrap();
    }
}
