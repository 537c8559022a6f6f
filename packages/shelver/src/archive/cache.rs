//! The archive cache: produce-or-fetch a named archive under a cross-task
//! exclusive-build lock, so any number of cooperating tasks asking for the
//! same `(repo, revision)` only ever run the producer once.

use std::future::Future;
use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use tracing::{debug, instrument, warn};

use crate::fs::{self, LockFile};

/// Produces the contents of a cache entry on a miss.
///
/// Implemented per archive kind; the only implementation shipped here is
/// [`crate::archive::git::GitArchiveProducer`].
pub trait ArchiveProducer: Send + Sync {
    /// The repository name used as the first component of the cache basename.
    fn repo_name(&self) -> String;

    /// Canonicalize the configured revision to a stable identifier
    /// (e.g. a commit id). Implementations should memoize this so repeated
    /// calls against the same producer don't re-invoke external tools.
    fn resolve_revision(&self) -> impl Future<Output = Result<String>> + Send;

    /// Produce the archive inside `scratch_dir`, returning the path to the
    /// finished file. The cache owns renaming it into place.
    fn build(&self, scratch_dir: PathBuf) -> impl Future<Output = Result<PathBuf>> + Send;
}

/// A content cache of version-control source archives, guarded by an
/// advisory file lock so at most one producer runs per cache key.
#[derive(Clone, Debug)]
pub struct ArchiveCache {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ArchiveCache {
    pub fn new(cache_dir: PathBuf, tmp_dir: PathBuf) -> Self {
        Self { cache_dir, tmp_dir }
    }

    /// Return the cached archive's path, building it first if necessary.
    ///
    /// At most one producer invocation happens per `(repo_name, revision)`
    /// across any number of concurrent callers on this host.
    #[instrument(skip(self, producer), fields(repo = %producer.repo_name()))]
    pub async fn get_or_build(&self, producer: &impl ArchiveProducer) -> Result<PathBuf> {
        fs::create_dir_all(&self.cache_dir).await?;
        fs::create_dir_all(&self.tmp_dir).await?;

        let revision_id = producer.resolve_revision().await.context("resolve revision")?;
        let basename = format!("{}-{revision_id}.tar.xz", producer.repo_name());
        let path = self.cache_dir.join(&basename);

        match self.try_create_exclusive(&path).await {
            Ok(true) => self.produce(producer, &path).await,
            Ok(false) => self.wait_for_producer(&path).await,
            Err(err) => Err(err),
        }
    }

    /// Attempt to create `path` exclusively. Returns `Ok(true)` if this
    /// caller is the producer, `Ok(false)` if the entry already exists.
    async fn try_create_exclusive(&self, path: &Path) -> Result<bool> {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(_file) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err).with_context(|| format!("create archive entry {path:?}")),
        }
    }

    #[instrument(skip(self, producer))]
    async fn produce(&self, producer: &impl ArchiveProducer, path: &Path) -> Result<PathBuf> {
        let lock = LockFile::open(path).await?;
        let lock = lock.lock().await.context("acquire exclusive archive lock")?;

        let scratch = tempfile::Builder::new()
            .prefix("shelver-archive-")
            .tempdir_in(&self.tmp_dir)
            .context("create scratch directory")?;

        let result = producer.build(scratch.path().to_path_buf()).await;

        let publish = match result {
            Ok(built) => tokio::fs::rename(&built, path)
                .await
                .with_context(|| format!("publish archive {built:?} -> {path:?}")),
            Err(err) => Err(err),
        };

        lock.unlock().await.context("release exclusive archive lock")?;

        match publish {
            Ok(()) => {
                debug!(?path, "archive built");
                Ok(path.to_path_buf())
            }
            Err(err) => {
                fs::remove_file(path)
                    .await
                    .unwrap_or_else(|cleanup_err| {
                        warn!(error = ?cleanup_err, ?path, "failed to clean up partial archive");
                    });
                Err(err)
            }
        }
    }

    /// Wait for an in-progress producer to finish by acquiring (and
    /// immediately releasing) the same exclusive lock it holds.
    ///
    /// `fslock` only exposes a single exclusive advisory lock, not the
    /// shared/exclusive distinction the original implementation uses, so
    /// concurrent readers serialize briefly on this handoff instead of
    /// truly sharing the lock. Since the hold time here is just the
    /// acquire-then-release round trip, this is observationally equivalent:
    /// every reader still only proceeds once the producer has released.
    #[instrument(skip(self))]
    async fn wait_for_producer(&self, path: &Path) -> Result<PathBuf> {
        let lock = LockFile::open(path).await?;
        let lock = lock.lock().await.context("wait for archive producer")?;
        lock.unlock().await.context("release archive lock")?;
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProducer {
        calls: Arc<AtomicUsize>,
    }

    impl ArchiveProducer for CountingProducer {
        fn repo_name(&self) -> String {
            "demo".to_string()
        }

        async fn resolve_revision(&self) -> Result<String> {
            Ok("deadbeef".to_string())
        }

        async fn build(&self, scratch_dir: PathBuf) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let out = scratch_dir.join("demo-deadbeef.tar.xz");
            tokio::fs::write(&out, b"archive contents").await?;
            Ok(out)
        }
    }

    #[test_log::test(tokio::test)]
    async fn concurrent_callers_build_exactly_once() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = ArchiveCache::new(cache_root.path().join("cache"), cache_root.path().join("tmp"));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let producer = CountingProducer { calls: calls.clone() };
                tokio::spawn(async move { cache.get_or_build(&producer).await })
            })
            .collect();

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "producer should run exactly once");
        for path in &paths {
            assert_eq!(path, &paths[0]);
            let content = tokio::fs::read(path).await.unwrap();
            assert_eq!(content, b"archive contents");
        }
    }

    struct FailingProducer;

    impl ArchiveProducer for FailingProducer {
        fn repo_name(&self) -> String {
            "broken".to_string()
        }

        async fn resolve_revision(&self) -> Result<String> {
            Ok("deadbeef".to_string())
        }

        async fn build(&self, _scratch_dir: PathBuf) -> Result<PathBuf> {
            Err(color_eyre::eyre::eyre!("producer exploded"))
        }
    }

    #[test_log::test(tokio::test)]
    async fn failed_build_does_not_leave_a_cache_entry() {
        let cache_root = tempfile::tempdir().unwrap();
        let cache = ArchiveCache::new(cache_root.path().join("cache"), cache_root.path().join("tmp"));
        let producer = FailingProducer;

        let err = cache.get_or_build(&producer).await.unwrap_err();
        assert!(err.to_string().contains("producer exploded"));

        let expected_path = cache_root.path().join("cache").join("broken-deadbeef.tar.xz");
        assert!(!fs::exists(&expected_path).await);
    }
}
