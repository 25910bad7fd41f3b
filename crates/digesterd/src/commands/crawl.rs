//! Module for the crawl stage.

use super::*;

/// Function for the [`Commands::Crawl`] in the CLI.
pub async fn crawl<I: UserInteraction>(interaction: &I, pipeline: &Pipeline, date: NaiveDate) -> Result<()> {
  interaction.reply(ResponseContent::Working(&format!("Fetching papers for {date}...")))?;
  let papers = pipeline.crawl(date).await?;
  let lines: Vec<_> = papers
    .iter()
    .map(|paper| format!("{} {}", style(&paper.id).cyan(), paper.title))
    .collect();
  interaction.reply(ResponseContent::List(&format!("{} candidate papers", papers.len()), &lines))?;
  interaction.reply(ResponseContent::Success(&format!(
    "Snapshot written to {}",
    pipeline.context().config.papers_snapshot(date).display()
  )))
}
