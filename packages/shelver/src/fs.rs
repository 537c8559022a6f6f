//! Filesystem operations, including the advisory lock used by the archive
//! cache.
//!
//! Inside this module we refer to `std::fs`/`tokio::fs` by their fully
//! qualified paths to make it clear which layer is doing the I/O.

use std::{marker::PhantomData, path::{Path, PathBuf}, sync::Arc};

use color_eyre::{
    Result,
    eyre::{Context, OptionExt},
};
use derive_more::Display;
use fslock::LockFile as FsLockFile;
use tap::TapFallible;
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{instrument, trace};

/// Shared lock file on the file system, guarded by a typestate so a caller
/// can't lock an already-locked handle or unlock an already-unlocked one.
///
/// Lock it with [`LockFile::lock`]. Unlock it with [`LockFile::unlock`].
#[derive(Debug, Clone, Display)]
#[display("{}", path.display())]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: PathBuf,
    inner: Arc<Mutex<FsLockFile>>,
}

/// Typestate marker: the handle holds no lock.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// Typestate marker: the handle holds an exclusive advisory lock.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl LockFile<Unlocked> {
    /// Open (or create) the lock file at the given path, unlocked.
    #[instrument]
    pub async fn open(path: impl Into<PathBuf> + std::fmt::Debug) -> Result<Self> {
        let path = path.into();
        let (file, path) = spawn_blocking({
            let path = path.clone();
            move || FsLockFile::open(&path).map(|file| (file, path))
        })
        .await
        .context("join task")?
        .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Acquire the exclusive advisory lock, blocking until it's available.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Release the exclusive advisory lock.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f| trace!(path = ?f.path, "unlocked file"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Determine the user cache directory to use when the caller doesn't
/// override `--cache-dir`: `$XDG_CACHE_HOME/shelver` on Linux,
/// `~/Library/Caches/com.example.shelver` on macOS, and so on, falling back
/// to `~/.cache/shelver`.
#[instrument]
pub async fn user_cache_dir() -> Result<PathBuf> {
    let dirs = spawn_blocking(|| directories::ProjectDirs::from("com", "example", "shelver"))
        .await
        .expect("join task");

    if let Some(dirs) = dirs {
        Ok(dirs.cache_dir().to_path_buf())
    } else {
        homedir::my_home()
            .context("get user home directory")?
            .ok_or_eyre("user has no home directory")?
            .join(".cache")
            .join("shelver")
            .pipe(Ok)
    }
}

use tap::Pipe as _;

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Write the provided content to disk, creating parent directories as needed.
#[instrument(skip(content))]
pub async fn write(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await.context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Atomically publish `content` at `path` by writing to a sibling temp file
/// and renaming it over the destination.
#[instrument(skip(content))]
pub async fn write_atomic(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let parent = path.parent().ok_or_eyre("path has no parent directory")?;
    create_dir_all(parent).await.context("create parent directory")?;
    let tmp_name = format!(".{}.tmp-{}", path.file_name().and_then(|n| n.to_str()).unwrap_or("file"), uuid::Uuid::new_v4());
    let tmp_path = parent.join(tmp_name);
    tokio::fs::write(&tmp_path, content.as_ref())
        .await
        .with_context(|| format!("write temp file: {tmp_path:?}"))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename {tmp_path:?} -> {path:?}"))
        .tap_ok(|_| trace!(?path, "published file atomically"))
}

/// Read a file's contents as a UTF-8 string, returning `None` if it's missing.
#[instrument]
pub async fn read_to_string(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read file: {path:?}")),
    }
}

/// Remove a file, succeeding if it's already gone.
#[instrument]
pub async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove file: {path:?}")),
    }
}

/// Remove a directory and all of its contents, succeeding if it's already gone.
#[instrument]
pub async fn remove_dir_all(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove directory: {path:?}")),
    }
}

/// Check whether the path exists.
#[instrument]
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test_log::test(tokio::test)]
    async fn lock_typestate_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let unlocked = LockFile::open(&path).await.unwrap();
        let locked = unlocked.lock().await.unwrap();
        let unlocked_again = locked.unlock().await.unwrap();
        drop(unlocked_again);
    }

    #[test_log::test(tokio::test)]
    async fn write_atomic_never_leaves_a_partial_file_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.tar.xz");
        write_atomic(&path, b"hello").await.unwrap();
        let content = read_to_string(&path).await.unwrap().unwrap();
        assert_eq!(content, "hello");
    }
}
