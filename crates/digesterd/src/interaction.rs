//! Console output and prompts.

use console::Emoji;
use dialoguer::{Confirm, Select};
use digester::{
  dispatch::DispatchReport,
  pipeline::{RenderedReport, RunSummary},
};

use super::*;

/// Prefix for information messages
pub static INFO_PREFIX: &str = "ℹ ";
/// Prefix for long-running work
pub static WORKING_PREFIX: &str = "» ";
/// Prefix for success messages
pub static SUCCESS_PREFIX: &str = "✓ ";
/// Prefix for error messages
pub static ERROR_PREFIX: &str = "✗ ";
/// Prefix for warning messages
pub static WARNING_PREFIX: &str = "! ";
/// Prefix for user prompts
pub static PROMPT_PREFIX: &str = "❯ ";
/// Tree branch for list items
pub static ITEM_PREFIX: &str = "├─";
/// Tree leaf for the last list item
pub static LAST_ITEM_PREFIX: &str = "└─";

/// Something to show the user.
#[derive(Debug)]
pub enum ResponseContent<'a> {
  /// Counts and failures of a run
  Summary(&'a RunSummary),
  /// A freshly written report
  Report(&'a RenderedReport),
  /// Per-recipient delivery results
  Dispatch(&'a DispatchReport),
  /// Titled list of lines
  List(&'a str, &'a [String]),
  /// Work in progress
  Working(&'a str),
  /// Completed action
  Success(&'a str),
  /// Something worth knowing
  Info(&'a str),
  /// Something that went partly wrong
  Warning(&'a str),
  /// A failure
  Error(DigesterdError),
}

/// How commands talk to the user.
pub trait UserInteraction {
  /// Asks a yes/no question, `default` is used when prompts are skipped.
  fn confirm(&self, message: &str, default: bool) -> Result<bool>;
  /// Lets the user pick one of `items`, `fallback` is used when prompts are skipped.
  fn select(&self, message: &str, items: &[&str], fallback: usize) -> Result<usize>;
  /// Shows `content`.
  fn reply(&self, content: ResponseContent) -> Result<()>;
}

/// Prints a tree of lines below a heading.
fn print_list(lines: &[String]) {
  for (index, line) in lines.iter().enumerate() {
    let prefix = if index + 1 == lines.len() { LAST_ITEM_PREFIX } else { ITEM_PREFIX };
    println!("   {} {line}", style(prefix).dim());
  }
}

impl UserInteraction for Cli {
  fn confirm(&self, message: &str, default: bool) -> Result<bool> {
    if self.accept_defaults {
      return Ok(default);
    }
    Ok(
      Confirm::new()
        .with_prompt(format!("{}{message}", style(PROMPT_PREFIX).cyan()))
        .default(default)
        .interact()?,
    )
  }

  fn select(&self, message: &str, items: &[&str], fallback: usize) -> Result<usize> {
    if self.accept_defaults {
      return Ok(fallback);
    }
    Ok(
      Select::new()
        .with_prompt(format!("{}{message}", style(PROMPT_PREFIX).cyan()))
        .items(items)
        .default(0)
        .interact()?,
    )
  }

  fn reply(&self, content: ResponseContent) -> Result<()> {
    match content {
      ResponseContent::Summary(summary) => {
        println!(
          "{} Run for {}: {} fetched, {} dropped, {} from cache, {} analysed ({} resumed, {} partial)",
          style(SUCCESS_PREFIX).green(),
          style(summary.run_date).yellow(),
          summary.fetched,
          summary.dropped,
          summary.cache_hits,
          summary.analyzed,
          summary.resumed,
          summary.partial,
        );
        if !summary.outcomes.is_empty() {
          println!("{} {} paper-level failures:", style(WARNING_PREFIX).yellow(), summary.outcomes.len());
          let lines: Vec<_> = summary
            .outcomes
            .iter()
            .map(|o| format!("[{}] {}: {}", o.stage, style(&o.paper_id).cyan(), o.error))
            .collect();
          print_list(&lines);
        }
        if let Some(path) = &summary.report_path {
          println!("{} Report: {}", style(INFO_PREFIX).cyan(), style(path.display()).yellow());
        }
        if let Some(dispatch) = &summary.dispatch {
          self.reply(ResponseContent::Dispatch(dispatch))?;
        }
      },
      ResponseContent::Report(rendered) => {
        println!(
          "{} {} papers in {} categories written to {}",
          style(SUCCESS_PREFIX).green(),
          rendered.report.paper_count(),
          rendered.report.sections.len(),
          style(rendered.path.display()).yellow()
        );
        if rendered.report.partial_count() > 0 {
          println!(
            "{} {} of them are partial",
            style(WARNING_PREFIX).yellow(),
            rendered.report.partial_count()
          );
        }
      },
      ResponseContent::Dispatch(dispatch) => {
        println!(
          "{} Mail delivered to {} of {} recipients {}",
          style(if dispatch.failed() == 0 { SUCCESS_PREFIX } else { WARNING_PREFIX }).green(),
          dispatch.delivered(),
          dispatch.deliveries.len(),
          Emoji("📬", "")
        );
        let lines: Vec<_> = dispatch
          .deliveries
          .iter()
          .filter_map(|d| d.error.as_ref())
          .chain(dispatch.attachment_failures.iter())
          .map(|e| style(e).red().to_string())
          .collect();
        print_list(&lines);
      },
      ResponseContent::List(title, lines) => {
        println!("{} {title}", style(INFO_PREFIX).cyan());
        print_list(lines);
      },
      ResponseContent::Working(message) => println!("{} {message}", style(WORKING_PREFIX).cyan()),
      ResponseContent::Success(message) => println!("{} {message}", style(SUCCESS_PREFIX).green()),
      ResponseContent::Info(message) => println!("{} {message}", style(INFO_PREFIX).cyan()),
      ResponseContent::Warning(message) => println!("{} {message}", style(WARNING_PREFIX).yellow()),
      ResponseContent::Error(error) => {
        eprintln!("{} {}", style(ERROR_PREFIX).red(), style(error).red());
      },
    }
    Ok(())
  }
}
