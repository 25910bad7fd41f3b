//! Module for the periodic runner.
//!
//! Each trigger runs the pipeline to completion before the next trigger is computed. A failed run
//! is reported and the scheduler keeps going. Ctrl-C while waiting exits at once; Ctrl-C during a
//! run exits once the run is over.

use digester::schedule::Schedule;
use tokio::sync::watch;

use super::*;

/// Function for the [`Commands::Schedule`] in the CLI.
pub async fn schedule<I: UserInteraction>(interaction: &I, pipeline: &Pipeline) -> Result<()> {
  let config = pipeline.context().config.clone();
  let schedule = Schedule::from_config(&config.scheduler)?;
  interaction.reply(ResponseContent::Info(&format!("Scheduler started: {schedule}")))?;

  let (stop_tx, mut stop_rx) = watch::channel(false);
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => {
        let _ = stop_tx.send(true);
      },
      Err(e) => {
        warn!("Cannot listen for Ctrl-C: {e}");
        stop_tx.closed().await;
      },
    }
  });

  if config.scheduler.run_on_startup {
    run_scheduled(interaction, pipeline).await?;
  }

  while !*stop_rx.borrow() {
    let now = Local::now();
    let next = schedule.next_after(&now);
    info!("Next run at {next}");
    interaction.reply(ResponseContent::Info(&format!(
      "Next run at {}",
      style(next.format("%Y-%m-%d %H:%M")).yellow()
    )))?;

    tokio::select! {
      () = tokio::time::sleep(schedule.wait_from(&now)) => run_scheduled(interaction, pipeline).await?,
      _ = stop_rx.changed() => {},
    }
  }

  interaction.reply(ResponseContent::Success("Scheduler stopped"))
}

/// One scheduled run for today. Run failures are reported, not returned.
async fn run_scheduled<I: UserInteraction>(interaction: &I, pipeline: &Pipeline) -> Result<()> {
  let date = Local::now().date_naive();
  interaction.reply(ResponseContent::Working(&format!("Scheduled run for {date}...")))?;
  match pipeline.run(date).await {
    Ok(summary) => interaction.reply(ResponseContent::Summary(&summary)),
    Err(e) => {
      error!("Scheduled run for {date} failed: {e}");
      interaction.reply(ResponseContent::Warning(&format!("Scheduled run for {date} failed: {e}")))
    },
  }
}
