//! Module for the full pipeline run.

use super::*;

/// Function for the [`Commands::Run`] in the CLI.
pub async fn run<I: UserInteraction>(interaction: &I, pipeline: &Pipeline, date: NaiveDate) -> Result<()> {
  interaction.reply(ResponseContent::Working(&format!("Running the digest for {date}...")))?;
  let summary = pipeline.run(date).await?;
  interaction.reply(ResponseContent::Summary(&summary))
}
