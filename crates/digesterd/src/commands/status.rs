//! Module for showing cache and report status.

use digester::{lock::RunLock, schedule::Schedule, store::CacheStore};

use super::*;

/// Reports listed by [`status`].
const RECENT_REPORTS: usize = 5;

/// Function for the [`Commands::Status`] in the CLI.
pub async fn status<I: UserInteraction>(interaction: &I, config: &Config, path: &Path) -> Result<()> {
  interaction.reply(ResponseContent::Info(&format!("Configuration: {}", style(path.display()).yellow())))?;

  let cache_path = config.cache_path();
  if cache_path.exists() {
    let store = CacheStore::open(&cache_path).await?;
    let stats = store.stats().await?;
    interaction.reply(ResponseContent::Info(&format!(
      "Cache {}: {} complete, {} partial, {} runs",
      style(cache_path.display()).yellow(),
      stats.complete,
      stats.partial,
      stats.runs
    )))?;
    let partial = store.partial_ids().await?;
    if !partial.is_empty() {
      interaction.reply(ResponseContent::List("Partial analyses, resumed on the next run", &partial))?;
    }
  } else {
    interaction.reply(ResponseContent::Info(&format!(
      "No cache at {} yet",
      style(cache_path.display()).yellow()
    )))?;
  }

  let pattern = config.output.base_dir.join("*").join("reports").join("daily_report_*.md");
  let mut reports: Vec<PathBuf> =
    glob::glob(&pattern.to_string_lossy())?.filter_map(|entry| entry.ok()).collect();
  reports.sort();
  if reports.is_empty() {
    interaction.reply(ResponseContent::Info("No reports written yet"))?;
  } else {
    let recent: Vec<String> =
      reports.iter().rev().take(RECENT_REPORTS).map(|p| p.display().to_string()).collect();
    interaction.reply(ResponseContent::List(&format!("{} reports, most recent", reports.len()), &recent))?;
  }

  let lock_path = config.lock_path();
  if let Some(pid) = RunLock::holder(&lock_path) {
    if RunLock::is_stale(&lock_path) {
      interaction.reply(ResponseContent::Info(&format!(
        "Stale run lock left by PID {pid}, the next run reclaims it"
      )))?;
    } else {
      interaction.reply(ResponseContent::Warning(&format!("A run is in progress (PID {pid})")))?;
    }
  }

  let schedule = Schedule::from_config(&config.scheduler)?;
  let next = schedule.next_after(&Local::now());
  interaction.reply(ResponseContent::Info(&format!(
    "Schedule: {schedule}, next run at {}",
    style(next.format("%Y-%m-%d %H:%M")).yellow()
  )))
}
