use color_eyre::Result;
use tracing::instrument;

use super::super::GlobalOptions;

#[instrument(skip(global))]
pub async fn exec(global: &GlobalOptions) -> Result<()> {
    println!("{}", global.cache_dir().display());
    Ok(())
}
