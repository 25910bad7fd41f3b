use clap::Args;

use super::*;

pub mod analyze;
pub mod config;
pub mod crawl;
pub mod init;
pub mod interactive;
pub mod report;
pub mod run;
pub mod schedule;
pub mod status;

pub use analyze::analyze;
pub use config::show_config;
pub use crawl::crawl;
pub use init::{init, InitOptions};
pub use interactive::interactive;
pub use report::{report, ReportOptions};
pub use run::run;
pub use schedule::schedule;
pub use status::status;

/// Available commands for the CLI
#[derive(Subcommand, Clone)]
pub enum Commands {
  /// Run every stage for the run date: crawl, classify, analyse, report and mail
  Run,

  /// Run the pipeline periodically according to the [scheduler] section
  Schedule,

  /// Fetch the candidate papers for the run date and snapshot them
  Crawl,

  /// Classify and analyse the papers fetched by `crawl`
  Analyze,

  /// Regenerate the report for the run date from the cache
  Report(ReportOptions),

  /// Choose an action from a menu (default when no command is given)
  Interactive,

  /// Show cache statistics, recent reports and the next scheduled run
  Status,

  /// Print the effective configuration with secrets masked
  Config,

  /// Write the annotated example configuration
  Init(InitOptions),
}
