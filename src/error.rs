//! Error types for the ledger, conversion and report pipeline.
//!
//! Domain conditions (a limit being exceeded, an unknown category) get their own variants so that a
//! caller can render or retry them distinctly. Infrastructure failures are carried as opaque
//! `anyhow::Error` chains and are attached at module boundaries with [`IntoResult::pub_result`].

use thiserror::Error;

/// The public error type of this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The write would drive the user's current-month balance below zero.
    #[error("monthly limit exceeded")]
    LimitExceeded,

    /// The user has no category with this name.
    #[error("category '{0}' not found")]
    CategoryNotFound(String),

    /// No currency matches the given code or id.
    #[error("currency '{0}' not found")]
    CurrencyNotFound(String),

    /// No user with this id.
    #[error("user {0} not found")]
    UserNotFound(i64),

    /// An amount was zero, negative or otherwise unusable.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// A rate was missing or invalid, or the converted amount does not fit.
    #[error("currency conversion failed: {0}")]
    ConversionFailure(String),

    /// The request queue or the callback channel could not accept or deliver a message.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// The caller cancelled, or timed out, while waiting for a report.
    #[error("report request cancelled")]
    Cancelled,

    /// The database failed.
    #[error("database error: {0:#}")]
    Database(anyhow::Error),

    /// Configuration could not be created, read or validated.
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    /// Anything else.
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

/// Convenience alias for results in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Names the layer an infrastructure error came from when it is converted into [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Database,
    Config,
    Transport,
    Internal,
}

impl ErrorType {
    fn wrap(self, e: anyhow::Error) -> Error {
        match self {
            ErrorType::Database => Error::Database(e),
            ErrorType::Config => Error::Config(e),
            ErrorType::Transport => Error::TransportUnavailable(format!("{e:#}")),
            ErrorType::Internal => Error::Internal(e),
        }
    }
}

/// Converts an `anyhow`-style result into a crate [`Result`], labelling the failure with an
/// [`ErrorType`].
pub(crate) trait IntoResult<T> {
    fn pub_result(self, error_type: ErrorType) -> Result<T>;
}

impl<T, E> IntoResult<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn pub_result(self, error_type: ErrorType) -> Result<T> {
        self.map_err(|e| error_type.wrap(e.into()))
    }
}

impl Error {
    /// True for failures a caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransportUnavailable(_) | Error::Cancelled)
    }
}
