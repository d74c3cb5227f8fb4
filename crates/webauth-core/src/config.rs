use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

use crate::state::TokenPayload;

/// PKCE challenge derivation used for the authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeMethod {
    /// The verifier itself is sent as the challenge.
    #[default]
    Plain,
    /// RFC 7636 S256: base64url(SHA-256(verifier)).
    S256,
}

/// Identity-provider settings supplied by the host application.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub uri: Url,
    pub scope: String,
    pub audience: String,
    pub client_id: String,
    pub redirect_uri: Url,
    pub challenge_method: ChallengeMethod,
    pub initial_tokens: Option<TokenPayload>,
}

impl ProviderConfig {
    pub fn new<S: Into<String>>(uri: Url, client_id: S, redirect_uri: Url) -> Self {
        Self {
            uri,
            scope: String::new(),
            audience: String::new(),
            client_id: client_id.into(),
            redirect_uri,
            challenge_method: ChallengeMethod::default(),
            initial_tokens: None,
        }
    }

    pub fn with_scope<S: Into<String>>(mut self, scope: S) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn with_audience<S: Into<String>>(mut self, audience: S) -> Self {
        self.audience = audience.into();
        self
    }

    pub fn with_challenge_method(mut self, method: ChallengeMethod) -> Self {
        self.challenge_method = method;
        self
    }

    /// Seed the controller with an already-held token triple.
    pub fn with_initial_tokens(mut self, payload: TokenPayload) -> Self {
        self.initial_tokens = Some(payload);
        self
    }

    /// Token endpoint, `{uri}/token`.
    pub fn token_url(&self) -> Result<Url, url::ParseError> {
        join_endpoint(&self.uri, "token")
    }

    /// Authorization endpoint, `{uri}/authorize`.
    pub fn authorize_url(&self) -> Result<Url, url::ParseError> {
        join_endpoint(&self.uri, "authorize")
    }
}

fn join_endpoint(base: &Url, segment: &str) -> Result<Url, url::ParseError> {
    Url::parse(&format!(
        "{}/{segment}",
        base.as_str().trim_end_matches('/')
    ))
}

/// Locates the per-user directory holding file-backed session data.
#[derive(Debug, Clone)]
pub struct StoreLocator {
    root: PathBuf,
}

impl StoreLocator {
    /// Discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs =
            ProjectDirs::from("rs", "webauth", "webauth-rs").ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    /// Path of the JSON document holding persisted session values.
    pub fn session_file(&self) -> PathBuf {
        self.root.join("session.json")
    }

    #[cfg(test)]
    pub(crate) fn from_root_for_tests(root: PathBuf) -> Self {
        Self { root }
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur when working with configuration directories.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for webauth-rs")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
