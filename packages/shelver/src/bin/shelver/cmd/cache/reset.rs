use clap::Args;
use color_eyre::{Result, eyre::Context as _};
use colored::Colorize as _;
use inquire::Confirm;
use tracing::instrument;

use super::super::GlobalOptions;

#[derive(Clone, Args, Debug)]
pub struct Options {
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,
}

#[instrument(skip(global))]
pub async fn exec(global: &GlobalOptions, options: Options) -> Result<()> {
    let cache_dir = global.cache_dir();

    if !options.yes {
        println!("{}", format!("This will delete the entire archive cache at {}", cache_dir.display()).on_red());
        let confirmed = Confirm::new("Are you sure you want to proceed?").with_default(false).prompt()?;
        if !confirmed {
            return Ok(());
        }
    }

    shelver::fs::remove_dir_all(&cache_dir).await.context("remove cache directory")?;
    println!("Cache reset.");
    Ok(())
}
