use clap::Subcommand;

pub mod reset;
pub mod show;

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Print the location of the archive cache directory.
    Show,

    /// Delete the archive cache.
    Reset(reset::Options),
}
