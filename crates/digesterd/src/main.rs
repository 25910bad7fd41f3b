//! Command line runner and scheduler for the `digester` pipeline.
//!
//! This crate provides the `digester` binary. It loads the configuration, sets up logging and
//! drives the pipeline provided by the [`digester`] library:
//! - full runs, on demand or on a schedule
//! - single stages (crawl, analyze, report) for finishing a failed run by hand
//! - cache and report status
//! - an interactive menu
//!
//! # Usage
//!
//! ```bash
//! # Write the annotated example configuration
//! digester init
//!
//! # Run every stage for today
//! digester run
//!
//! # Re-run the analysis stage for a given day
//! digester --date 2024-01-15 analyze
//!
//! # Regenerate a report and mail it
//! digester --date 2024-01-15 report --send
//!
//! # Run forever according to [scheduler]
//! digester schedule
//! ```
//!
//! Logging goes to the console and, when `system.log_dir` is set, to a daily rolling file. The
//! `-v` flag raises the level and `RUST_LOG` overrides everything.

#![warn(missing_docs, clippy::missing_docs_in_private_items)]

use std::{
  path::{Path, PathBuf},
  process::ExitCode,
};

use chrono::{Local, NaiveDate};
use clap::{builder::ArgAction, Parser, Subcommand};
use console::style;
use digester::{
  config::{Config, SystemConfig},
  error::DigestError,
  pipeline::{Context, Pipeline},
};
use tracing::{error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod commands;
pub mod error;
pub mod interaction;

use crate::{commands::*, error::*, interaction::*};

/// Command line interface configuration and argument parsing
#[derive(Parser)]
#[command(author, version, about = "Daily arXiv digest: crawl, triage, analyse, report and mail")]
pub struct Cli {
  /// Verbose mode (-v, -vv, -vvv) for different levels of logging detail
  #[arg(
        short,
        long,
        action = ArgAction::Count,
        global = true,
        help = "Increase logging verbosity"
    )]
  verbose: u8,

  /// Configuration file. Defaults to `./digester.toml`, then the platform config directory.
  #[arg(long, short, global = true)]
  config: Option<PathBuf>,

  /// Run date (YYYY-MM-DD). Defaults to today.
  #[arg(long, short, global = true)]
  date: Option<NaiveDate>,

  /// The subcommand to execute, the interactive menu when omitted
  #[command(subcommand)]
  command: Option<Commands>,

  /// Skip all prompts and accept defaults (mostly for testing)
  #[arg(long, hide = true, global = true)]
  accept_defaults: bool,
}

impl Cli {
  /// The date the command operates on.
  pub fn run_date(&self) -> NaiveDate { self.date.unwrap_or_else(|| Local::now().date_naive()) }
}

/// Configures console and file logging.
///
/// Level precedence: `RUST_LOG`, then `-v`, then `system.log_level`.
///
/// - 0: `system.log_level`
/// - 1: warn
/// - 2: info
/// - 3: debug
/// - 4+: trace
///
/// The returned guard flushes the log file and must live until exit.
fn setup_logging(verbosity: u8, system: &SystemConfig) -> Option<WorkerGuard> {
  let level = match verbosity {
    0 => system.log_level.as_str(),
    1 => "warn",
    2 => "info",
    3 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .unwrap_or_else(|_| EnvFilter::new("info"));

  let console = fmt::layer().with_target(true).with_writer(std::io::stderr);
  let (file, guard) = match &system.log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "digester.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
    },
    None => (None, None),
  };

  tracing_subscriber::registry().with(filter).with(console).with(file).init();
  guard
}

/// Builds the production pipeline for `config`.
pub async fn open_pipeline(config: Config) -> Result<Pipeline> {
  Ok(Pipeline::new(Context::from_config(config).await?)?)
}

/// Loads the configuration, sets up logging and runs `command`.
async fn execute(cli: &Cli, command: Commands) -> Result<()> {
  if let Commands::Init(options) = command {
    let _guard = setup_logging(cli.verbose, &SystemConfig::default());
    return init(cli, options).await;
  }

  let path = Config::locate(cli.config.as_deref())?;
  let config = Config::load(&path)?;
  let _guard = setup_logging(cli.verbose, &config.system);
  trace!("Using configuration {}", path.display());

  let date = cli.run_date();
  match command {
    Commands::Init(_) => Ok(()),
    Commands::Config => show_config(cli, &config, &path),
    Commands::Status => status(cli, &config, &path).await,
    Commands::Run => run(cli, &open_pipeline(config).await?, date).await,
    Commands::Schedule => schedule(cli, &open_pipeline(config).await?).await,
    Commands::Crawl => crawl(cli, &open_pipeline(config).await?, date).await,
    Commands::Analyze => analyze(cli, &open_pipeline(config).await?, date).await,
    Commands::Report(options) => report(cli, &open_pipeline(config).await?, date, options).await,
    Commands::Interactive => interactive(cli, &open_pipeline(config).await?, date, &path).await,
  }
}

/// Entry point for the digester CLI application
///
/// Every failure is printed with its context and turns into a non-zero exit status.
#[tokio::main]
async fn main() -> ExitCode {
  let cli = Cli::parse();
  let command = cli.command.clone().unwrap_or(Commands::Interactive);

  match execute(&cli, command).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("{e}");
      let _ = cli.reply(ResponseContent::Error(e));
      ExitCode::FAILURE
    },
  }
}
