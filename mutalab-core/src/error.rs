//! Error types for the Mutalab core library.
//!
//! Uses `thiserror` for public API error types. Local precondition failures
//! (`ValidationError`) are kept apart from remote failures (`ServiceError`) so the
//! orchestrator can guarantee that a validation problem never reaches the network.

use std::path::PathBuf;

use crate::credentials::CredentialError;
use crate::types::Stage;

/// Top-level error type for the Mutalab core library.
#[derive(Debug, thiserror::Error)]
pub enum MutalabError {
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A local precondition failed. Raised before any remote call is attempted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("'{operation}' requires stage {expected}, but the experiment is at {actual}")]
    WrongStage {
        operation: &'static str,
        expected: Stage,
        actual: Stage,
    },

    #[error("Please select a file.")]
    EmptyFile,

    #[error("Please choose a perturbation: '{choice}' is not one of the available strategies")]
    UnknownPerturbation { choice: String },

    #[error("Please upload both reports: the {which} report is missing")]
    MissingReport { which: &'static str },

    #[error("The {which} detection rate must be a number, got '{value}'")]
    InvalidRate { which: &'static str, value: String },

    #[error("No variant has been produced yet")]
    VariantUnavailable,
}

/// A remote call to the transformation service failed.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Authentication rejected by the service")]
    AuthFailed,

    #[error("Rate limited by the service, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Malformed response: {message}")]
    ResponseParse { message: String },

    #[error("Invalid service URL: {message}")]
    InvalidUrl { message: String },

    #[error("No auth token available: {0}")]
    Token(#[from] CredentialError),
}

impl ServiceError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Connection { .. }
            | ServiceError::Timeout { .. }
            | ServiceError::RateLimited { .. } => true,
            ServiceError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the service refused the request before acting on it, so
    /// sending it again cannot duplicate work.
    pub fn is_rejected_unprocessed(&self) -> bool {
        matches!(
            self,
            ServiceError::RateLimited { .. } | ServiceError::Http { status: 503, .. }
        )
    }
}

/// Outcome of a rejected or failed orchestrator transition.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Another request for this experiment is still in flight")]
    Busy,

    #[error("Response discarded: experiment generation {started} was reset (now {current})")]
    Stale { started: u64, current: u64 },
}

impl TransitionError {
    pub fn is_validation(&self) -> bool {
        matches!(self, TransitionError::Validation(_))
    }

    pub fn is_service(&self) -> bool {
        matches!(self, TransitionError::Service(_))
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

/// A type alias for results using the top-level `MutalabError`.
pub type Result<T> = std::result::Result<T, MutalabError>;
