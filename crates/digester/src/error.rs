//! Error types for the digester library.
//!
//! Errors fall into two scopes and the pipeline treats them differently:
//!
//! - **Run-scoped** failures ([`DigestError::Fetch`], [`DigestError::Config`], store failures,
//!   [`DigestError::RunInProgress`]) abort the current run and are surfaced to the operator.
//! - **Paper-scoped** failures ([`DigestError::Classification`], [`DigestError::Analysis`],
//!   [`DigestError::Attachment`], [`DigestError::Delivery`]) are recorded against the paper or
//!   recipient and the run carries on.
//!
//! # Examples
//!
//! ```
//! use digester::error::DigestError;
//!
//! let err = DigestError::Api { status: 503, message: "overloaded".into() };
//! assert!(err.is_transient());
//!
//! let err = DigestError::Api { status: 401, message: "bad key".into() };
//! assert!(!err.is_transient());
//! ```

use thiserror::Error;

use super::*;

/// Error type alias used for the [`digester`](crate) crate.
pub type Result<T> = core::result::Result<T, DigestError>;

/// Errors that can occur while producing a digest.
#[derive(Error, Debug)]
pub enum DigestError {
  /// The paper listing was unreachable or returned data that could not be understood.
  ///
  /// This aborts the run for the requested date.
  #[error("Fetching papers failed: {0}")]
  Fetch(String),

  /// The relevance call for a single paper failed or came back empty.
  ///
  /// The paper is dropped and the run continues.
  #[error("Could not classify paper {paper_id}: {reason}")]
  Classification {
    /// Identifier of the affected paper
    paper_id: String,
    /// What went wrong
    reason:   String,
  },

  /// A question in a paper's analysis sequence could not be answered.
  ///
  /// The analysis is kept as partial and resumes from `question` on the next run.
  #[error("Analysis of paper {paper_id} stopped at question {question}: {reason}")]
  Analysis {
    /// Identifier of the affected paper
    paper_id: String,
    /// One-based index of the question that failed
    question: usize,
    /// What went wrong
    reason:   String,
  },

  /// A PDF or report file could not be downloaded, read or attached.
  #[error("Attachment {} unavailable: {reason}", path.display())]
  Attachment {
    /// Path of the file that was expected
    path:   PathBuf,
    /// What went wrong
    reason: String,
  },

  /// Mail delivery to one recipient failed.
  #[error("Delivery to {recipient} failed: {reason}")]
  Delivery {
    /// Address that did not receive the report
    recipient: String,
    /// What went wrong
    reason:    String,
  },

  /// The configuration is missing or invalid.
  #[error("{0}")]
  Config(String),

  /// An outbound call exceeded its time budget.
  #[error("Call timed out after {0:?}")]
  Timeout(Duration),

  /// A remote API answered with a non-success status.
  #[error("API error ({status}): {message}")]
  Api {
    /// HTTP status code
    status:  u16,
    /// Response body or reason phrase
    message: String,
  },

  /// The language model returned no text.
  #[error("The language model returned an empty response")]
  EmptyResponse,

  /// Another pipeline run currently holds the run lock.
  #[error("Another run is in progress (lock held at {})", .0.display())]
  RunInProgress(PathBuf),

  /// An answer was appended out of order for a cached analysis.
  ///
  /// Answers are append-only and strictly positional, so this signals a logic error or a
  /// concurrent writer on the same paper.
  #[error("Cache entry for {paper_id} expects answer {expected}, got {got}")]
  CacheOrder {
    /// Identifier of the affected paper
    paper_id: String,
    /// Position the store expected next
    expected: usize,
    /// Position that was offered
    got:      usize,
  },

  /// A network request failed.
  #[error(transparent)]
  Network(#[from] reqwest::Error),

  /// A SQLite operation failed.
  #[error(transparent)]
  Sqlite(#[from] rusqlite::Error),

  /// An async SQLite operation failed.
  #[error(transparent)]
  AsyncSqlite(#[from] tokio_rusqlite::Error),

  /// A file system operation failed.
  #[error(transparent)]
  Path(#[from] std::io::Error),

  /// The configuration file is not valid TOML for [`Config`](crate::config::Config).
  #[error(transparent)]
  TomlDe(#[from] toml::de::Error),

  /// JSON encoding or decoding failed.
  #[error(transparent)]
  Json(#[from] serde_json::Error),

  /// The Atom feed could not be decoded.
  #[error(transparent)]
  Xml(#[from] quick_xml::DeError),

  /// A PDF could not be parsed.
  #[error(transparent)]
  Lopdf(#[from] lopdf::Error),

  /// A mail message could not be built.
  #[error(transparent)]
  Mail(#[from] lettre::error::Error),

  /// The SMTP conversation failed.
  #[error(transparent)]
  Smtp(#[from] lettre::transport::smtp::Error),

  /// A mail address could not be parsed.
  #[error(transparent)]
  Address(#[from] lettre::address::AddressError),
}

impl DigestError {
  /// Whether retrying the same call might succeed.
  ///
  /// Timeouts, connection problems, rate limiting and server errors are transient. Client errors,
  /// empty responses and everything local are not.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Timeout(_) => true,
      Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
      Self::Api { status, .. } => *status == 429 || (500..=599).contains(status),
      _ => false,
    }
  }
}
