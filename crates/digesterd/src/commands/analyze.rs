//! Module for the classification and analysis stages.

use super::*;

/// Function for the [`Commands::Analyze`] in the CLI.
pub async fn analyze<I: UserInteraction>(
  interaction: &I,
  pipeline: &Pipeline,
  date: NaiveDate,
) -> Result<()> {
  interaction.reply(ResponseContent::Working(&format!("Analysing papers fetched for {date}...")))?;
  let summary = pipeline.analyze(date).await?;
  interaction.reply(ResponseContent::Summary(&summary))
}
