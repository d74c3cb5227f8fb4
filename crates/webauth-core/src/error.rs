use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::exchange::GrantKind;

/// Errors surfaced by the handshake controller and its collaborators.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("token refresh unavailable")]
    RefreshUnavailable,
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("auth context requested outside of provider scope")]
    OutsideProviderScope,
}

/// Cloneable record of a failed exchange or refresh.
///
/// Published through [`AuthSnapshot`](crate::controller::AuthSnapshot) so the
/// view layer can react to a failure that the state machine itself absorbs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeFailure {
    pub grant: GrantKind,
    pub status: Option<u16>,
    pub detail: String,
}

impl ExchangeFailure {
    pub(crate) fn record(grant: GrantKind, err: &AuthError) -> Self {
        let status = match err {
            AuthError::TokenEndpoint { status, .. } => Some(status.as_u16()),
            AuthError::Http(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        };
        Self {
            grant,
            status,
            detail: err.to_string(),
        }
    }
}
