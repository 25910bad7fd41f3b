//! Module for regenerating and mailing reports.

use super::*;

/// Options for [`Commands::Report`].
#[derive(Args, Clone)]
pub struct ReportOptions {
  /// Also mail the report to the configured recipients
  #[arg(long)]
  pub send: bool,
}

/// Function for the [`Commands::Report`] in the CLI.
pub async fn report<I: UserInteraction>(
  interaction: &I,
  pipeline: &Pipeline,
  date: NaiveDate,
  options: ReportOptions,
) -> Result<()> {
  if options.send {
    interaction.reply(ResponseContent::Working(&format!("Sending the report for {date}...")))?;
    match pipeline.send(date).await? {
      Some(dispatch) => interaction.reply(ResponseContent::Dispatch(&dispatch))?,
      None => interaction.reply(ResponseContent::Info("Nothing to send: the report is empty"))?,
    }
    return Ok(());
  }

  let rendered = pipeline.report(date).await?;
  interaction.reply(ResponseContent::Report(&rendered))
}
