//! Daily digest of newly published computer-science papers.
//!
//! `digester` crawls fresh submissions from arXiv, asks a large language model whether each one
//! is relevant to a configured research taxonomy, runs a fixed sequence of analysis questions
//! against every kept paper, renders the answers into a Markdown report grouped by category and
//! hands that report to a mail transport.
//!
//! # Pipeline
//!
//! - [`source`]: lazy, restartable listing of candidate papers for a date window
//! - [`relevance`]: one classification call per candidate, conservative on ambiguity
//! - [`analysis`]: ordered question sequence per paper inside one conversation, resumable
//! - [`store`]: SQLite cache of analyses so finished papers are never analysed twice
//! - [`report`]: category-grouped Markdown rendering
//! - [`dispatch`]: per-recipient mail delivery with attachments
//! - [`pipeline`]: run orchestration, single-stage entry points and the run lock
//!
//! # Getting Started
//!
//! ```no_run
//! use digester::{config::Config, pipeline::{Context, Pipeline}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = Config::load("digester.toml")?;
//!   let pipeline = Pipeline::new(Context::from_config(config).await?)?;
//!
//!   let summary = pipeline.run(chrono::Local::now().date_naive()).await?;
//!   println!("Analysed {} papers", summary.analyzed);
//!   Ok(())
//! }
//! ```
//!
//! Every external collaborator (paper listing, LLM, mail transport) sits behind a trait so the
//! whole pipeline can be driven by deterministic stubs in tests.

#![warn(missing_docs, clippy::missing_docs_in_private_items)]

use std::{
  fmt::Display,
  path::{Path, PathBuf},
  str::FromStr,
  sync::Arc,
  time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};
#[cfg(test)]
use {tempfile::tempdir, tracing_test::traced_test};

pub mod analysis;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod llm;
pub mod lock;
pub mod paper;
pub mod pdf;
pub mod pipeline;
pub mod relevance;
pub mod report;
pub mod retry;
pub mod schedule;
pub mod source;
pub mod store;

use crate::{error::*, paper::*};

/// Common traits and types for ergonomic imports.
///
/// ```no_run
/// use digester::prelude::*;
///
/// fn describe(err: &DigestError) -> String { err.to_string() }
/// ```
pub mod prelude {
  pub use crate::{
    dispatch::MailTransport,
    error::{DigestError, Result},
    llm::LanguageModel,
    source::PaperSource,
  };
}
