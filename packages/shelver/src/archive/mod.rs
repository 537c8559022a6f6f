//! The archive cache subsystem: see [`cache::ArchiveCache`] for the
//! exclusive-build-lock protocol and [`git::GitArchiveProducer`] for the
//! concrete version-control backed producer.

use std::path::PathBuf;

pub mod cache;
pub mod git;

pub use cache::{ArchiveCache, ArchiveProducer};
pub use git::GitArchiveProducer;

/// A resolved archive, ready for the runner to hand to the builder tool's
/// template context: the local path, the source directory it was produced
/// from, and the version-control revision it was resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub source_dir: PathBuf,
    pub revision: String,
}
