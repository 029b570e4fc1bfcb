//! Errors surfaced by token acquisition

use thiserror::Error;

use super::flow::FlowError;
use super::tokens::StoreError;
use super::validation::SettingsIssue;
use crate::config::ConfigError;

/// Terminal outcome of a token operation.
///
/// Messages are meant to be shown to the user verbatim; provider supplied
/// descriptions are carried through where the identity platform returns them.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing client ID. Configure the application ID first.")]
    NotConfigured,

    #[error("Invalid configuration: {}", join_issues(.0))]
    InvalidConfiguration(Vec<SettingsIssue>),

    #[error("No cached token available.")]
    NoCachedToken,

    #[error("Authorization was cancelled.")]
    AuthorizationCancelled,

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Authorization response state did not match the request.")]
    InvalidState,

    #[error("Authorization failed: no code returned.")]
    NoAuthorizationCode,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Interactive sign-in is unavailable: {0}")]
    FlowUnavailable(String),

    #[error("Invalid endpoint URL: {0}")]
    Endpoint(String),

    #[error("Random number generation failed: {0}")]
    Entropy(String),

    #[error(transparent)]
    Settings(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<FlowError> for AuthError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Cancelled => Self::AuthorizationCancelled,
            FlowError::Failed(reason) => Self::AuthorizationFailed(reason),
            FlowError::Unavailable(reason) => Self::FlowUnavailable(reason),
        }
    }
}

fn join_issues(issues: &[SettingsIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
