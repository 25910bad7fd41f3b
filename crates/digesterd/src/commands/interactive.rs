//! Module for the interactive menu.

use super::*;

/// Menu entries, in display order.
const ACTIONS: [&str; 8] = [
  "Run the full pipeline",
  "Crawl papers only",
  "Analyse crawled papers",
  "Generate the report",
  "Generate and mail the report",
  "Show status",
  "Show configuration",
  "Quit",
];

/// Function for the [`Commands::Interactive`] in the CLI.
///
/// Stage failures are shown and the menu comes back.
pub async fn interactive<I: UserInteraction>(
  interaction: &I,
  pipeline: &Pipeline,
  date: NaiveDate,
  config_path: &Path,
) -> Result<()> {
  let config = pipeline.context().config.clone();
  interaction.reply(ResponseContent::Info(&format!("Working on {}", style(date).yellow())))?;

  loop {
    let choice = interaction.select("What would you like to do?", &ACTIONS, ACTIONS.len() - 1)?;
    let outcome = match choice {
      0 => run(interaction, pipeline, date).await,
      1 => crawl(interaction, pipeline, date).await,
      2 => analyze(interaction, pipeline, date).await,
      3 => report(interaction, pipeline, date, ReportOptions { send: false }).await,
      4 => report(interaction, pipeline, date, ReportOptions { send: true }).await,
      5 => status(interaction, &config, config_path).await,
      6 => show_config(interaction, &config, config_path),
      _ => return interaction.reply(ResponseContent::Success("Bye")),
    };
    if let Err(e) = outcome {
      interaction.reply(ResponseContent::Error(e))?;
    }
  }
}
