use std::path::{Path, PathBuf};

use clap::Args;

pub mod build;
pub mod cache;

/// Options shared by every subcommand: where the catalog lives and which
/// provider to use.
#[derive(Clone, Args, Debug)]
pub struct GlobalOptions {
    /// Provider to use, overriding the catalog's `provider.name` section.
    #[arg(short = 'p', long = "provider", global = true)]
    pub provider: Option<String>,

    /// Base directory that relative cache/temp/log paths are resolved against.
    #[arg(short = 'd', long = "base-dir", global = true, default_value = ".")]
    pub base_dir: PathBuf,

    /// Path to the catalog document.
    #[arg(short = 'c', long = "config-file", global = true, default_value = "shelver.yml")]
    pub config_file: PathBuf,
}

impl GlobalOptions {
    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join(".shelver").join("tmp")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join(".shelver").join("cache")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join(".shelver").join("log")
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.config_file.parent().map(Path::to_path_buf).unwrap_or_else(|| self.base_dir.clone())
    }
}
