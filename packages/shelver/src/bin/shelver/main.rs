//! The binary entrypoint for `shelver`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::{Result, eyre::Context};
use git_version::git_version;
use tracing::instrument;
use tracing_subscriber::util::SubscriberInitExt;

// Since this is a binary crate, these modules stay non-`pub` so the compiler
// warns correctly about dead code: https://github.com/rust-lang/rust/issues/74970
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "shelver",
    about = "Builds and catalogs golden VM images",
    version = format!("v{} commit {}", crate_version!(), git_version!(args = ["--always"])),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    global: cmd::GlobalOptions,

    /// Emit flamegraph profiling data
    #[arg(short, long, hide(true))]
    profile: Option<PathBuf>,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Build images from the catalog
    Build(cmd::build::Options),

    /// Manage the archive cache
    #[clap(subcommand)]
    Cache(cmd::cache::Command),
}

#[instrument]
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let (logger, flame_guard) = log::make_logger(std::io::stderr, top.profile.clone(), top.color)?;
    logger.init();

    let result = match top.command {
        Command::Build(options) => cmd::build::exec(&top.global, options).await,
        Command::Cache(cmd::cache::Command::Show) => cmd::cache::show::exec(&top.global).await,
        Command::Cache(cmd::cache::Command::Reset(options)) => cmd::cache::reset::exec(&top.global, options).await,
    };

    if let Some(flame_guard) = flame_guard {
        flame_guard.flush().context("flush flame_guard")?;
    }

    result
}
