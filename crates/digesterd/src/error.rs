//! Error types for the `digester` binary.

use thiserror::Error;

use super::*;

/// Error type alias used for the `digester` binary.
pub type Result<T> = core::result::Result<T, DigesterdError>;

/// Errors that can occur while running a command.
#[derive(Error, Debug)]
pub enum DigesterdError {
  /// A pipeline stage or the configuration failed.
  #[error(transparent)]
  Digest(#[from] DigestError),

  /// A prompt could not be shown or answered.
  #[error(transparent)]
  Dialoguer(#[from] dialoguer::Error),

  /// A file system operation failed.
  #[error(transparent)]
  Path(#[from] std::io::Error),

  /// The configuration could not be printed.
  #[error(transparent)]
  Toml(#[from] toml::ser::Error),

  /// A report search pattern was invalid.
  #[error(transparent)]
  Glob(#[from] glob::PatternError),
}
