use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ProviderConfig;
use crate::error::AuthError;
use crate::nonce::PkceMaterial;
use crate::params;
use crate::state::TokenPayload;

const USER_AGENT: &str = "webauth-rs/0.1.0";
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const REFRESH_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Grant type carried by a token-endpoint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    AuthorizationCode,
    RefreshToken,
}

impl GrantKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantKind::AuthorizationCode => "authorization_code",
            GrantKind::RefreshToken => "refresh_token",
        }
    }
}

/// HTTP half of the handshake: token-endpoint requests for both grants.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: Client,
    token_url: Url,
    config: ProviderConfig,
}

impl TokenClient {
    pub fn new(config: ProviderConfig) -> Result<Self, AuthError> {
        let token_url = config.token_url()?;
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            token_url,
            config,
        })
    }

    /// Exchange an authorization code for the token triple.
    ///
    /// The code itself doubles as the bearer credential for this request.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce: &PkceMaterial,
    ) -> Result<TokenPayload, AuthError> {
        let body = params::serialize([
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", GrantKind::AuthorizationCode.as_str()),
            ("code_verifier", pkce.verifier()),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("state", pkce.state()),
        ]);
        let response = self
            .http
            .post(self.token_url.clone())
            .header(AUTHORIZATION, format!("Bearer {code}"))
            .header(CONTENT_TYPE, FORM_URLENCODED)
            .body(body)
            .send()
            .await?;
        handle_token_response(response).await
    }

    /// Refresh the triple using its refresh token, presenting the current
    /// (possibly expired) token as the bearer credential.
    pub async fn refresh(
        &self,
        token: &str,
        refresh_token: Option<&str>,
        pkce: &PkceMaterial,
    ) -> Result<TokenPayload, AuthError> {
        let refresh_token = refresh_token.ok_or(AuthError::RefreshUnavailable)?;
        let body = params::serialize([
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", GrantKind::RefreshToken.as_str()),
            ("code_verifier", pkce.verifier()),
            ("refresh_token", refresh_token),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("state", pkce.state()),
        ]);
        let response = self
            .http
            .post(self.token_url.clone())
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, FORM_URLENCODED)
            .body(body)
            .timeout(REFRESH_TIMEOUT)
            .send()
            .await?;
        handle_token_response(response).await
    }
}

async fn handle_token_response(response: reqwest::Response) -> Result<TokenPayload, AuthError> {
    let status = response.status();
    let received_at = Utc::now();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_else(|_| String::new());
        return Err(AuthError::TokenEndpoint { status, body });
    }

    let payload: TokenResponse = response.json().await?;
    Ok(TokenPayload {
        token: payload.access_token,
        refresh_token: payload.refresh_token,
        expire: received_at + Duration::seconds(payload.expires_in),
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}
