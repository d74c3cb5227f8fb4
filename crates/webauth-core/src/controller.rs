use std::mem;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ChallengeMethod, ProviderConfig};
use crate::error::{AuthError, ExchangeFailure};
use crate::exchange::{GrantKind, TokenClient};
use crate::navigator::{self, Navigator};
use crate::nonce::PkceMaterial;
use crate::params;
use crate::state::{Action, TokenPayload, TokenState};
use crate::store::{SessionKey, SessionStore};

/// Logical state of the handshake, derived from the token triple and the
/// presence of an authorization code in the current location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    PendingExchange,
    Authenticated,
    Expired,
}

impl Phase {
    fn derive(tokens: &TokenState, code_present: bool) -> Self {
        if code_present && !tokens.is_complete() {
            Phase::PendingExchange
        } else if tokens.is_authenticated() {
            if tokens.is_expired() {
                Phase::Expired
            } else {
                Phase::Authenticated
            }
        } else {
            Phase::Idle
        }
    }
}

/// Read-only view published to the view layer.
#[derive(Debug, Clone, Serialize)]
pub struct AuthSnapshot {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub expire: Option<DateTime<Utc>>,
    pub is_authenticated: bool,
    pub phase: Phase,
    pub last_error: Option<ExchangeFailure>,
}

struct Flow {
    tokens: TokenState,
    pkce: Option<PkceMaterial>,
    in_flight: Option<GrantKind>,
    generation: u64,
    last_error: Option<ExchangeFailure>,
}

enum Pending {
    Exchange {
        code: String,
    },
    Refresh {
        token: String,
        refresh_token: Option<String>,
    },
}

impl Pending {
    fn grant(&self) -> GrantKind {
        match self {
            Pending::Exchange { .. } => GrantKind::AuthorizationCode,
            Pending::Refresh { .. } => GrantKind::RefreshToken,
        }
    }
}

struct Job {
    generation: u64,
    pkce: PkceMaterial,
    pending: Pending,
}

/// Orchestrates the PKCE handshake: nonce lifecycle, code exchange, silent
/// refresh, and the entry points exposed to the view layer.
///
/// Exchange and refresh requests pass through a single-slot in-flight guard,
/// so re-entrant activations never issue duplicates; `logout` bumps a
/// generation counter that marks any in-flight response stale.
pub struct HandshakeController {
    config: ProviderConfig,
    client: TokenClient,
    store: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
    flow: Mutex<Flow>,
}

impl HandshakeController {
    pub fn new(
        config: ProviderConfig,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, AuthError> {
        let client = TokenClient::new(config.clone())?;
        let tokens = match config.initial_tokens.clone() {
            Some(payload) => TokenState::from_payload(payload),
            None => TokenState::default(),
        };
        Ok(Self {
            config,
            client,
            store,
            navigator,
            flow: Mutex::new(Flow {
                tokens,
                pkce: None,
                in_flight: None,
                generation: 0,
                last_error: None,
            }),
        })
    }

    /// Evaluate one activation tick.
    ///
    /// Mints or reuses the nonce pair, performs a pending code exchange or an
    /// overdue refresh, and returns the resulting phase. Exchange and refresh
    /// failures never escape the tick; they are recorded on the snapshot.
    pub async fn activate(&self) -> Phase {
        let code = self.location_code();
        let (phase, job) = {
            let mut flow = self.flow.lock().await;
            let continuity = flow.tokens.is_authenticated() || code.is_some();
            let pkce = self.ensure_material(&mut flow, continuity);
            let phase = Phase::derive(&flow.tokens, code.is_some());
            let job = match phase {
                Phase::PendingExchange => code
                    .clone()
                    .and_then(|code| self.claim(&mut flow, pkce, Pending::Exchange { code })),
                Phase::Expired => {
                    let token = flow.tokens.token.clone().unwrap_or_default();
                    let refresh_token = flow.tokens.refresh_token.clone();
                    self.claim(
                        &mut flow,
                        pkce,
                        Pending::Refresh {
                            token,
                            refresh_token,
                        },
                    )
                }
                _ => None,
            };
            (phase, job)
        };

        match job {
            Some(job) => {
                let _ = self.run_job(job).await;
                self.current_phase().await
            }
            None => phase,
        }
    }

    /// Build the authorization URL and perform a full top-level navigation.
    ///
    /// Terminal for this controller's scope; the post-redirect activation
    /// re-enters through the pending code exchange.
    pub async fn authenticate(&self) -> Result<(), AuthError> {
        let code = self.location_code();
        let (challenge, state) = {
            let mut flow = self.flow.lock().await;
            let continuity = flow.tokens.is_authenticated() || code.is_some();
            let pkce = self.ensure_material(&mut flow, continuity);
            (
                pkce.challenge(self.config.challenge_method),
                pkce.state().to_owned(),
            )
        };

        let mut pairs: Vec<(&str, &str)> = vec![
            ("client_id", self.config.client_id.as_str()),
            ("scope", self.config.scope.as_str()),
            ("audience", self.config.audience.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("response_type", "code"),
            ("response_mode", "query"),
            ("code_challenge", challenge.as_str()),
            ("state", state.as_str()),
        ];
        if self.config.challenge_method == ChallengeMethod::S256 {
            pairs.push(("code_challenge_method", "S256"));
        }
        let query = params::serialize(pairs);
        let url = Url::parse(&format!("{}?{query}", self.config.authorize_url()?))?;
        debug!(%url, "redirecting to authorization endpoint");
        self.navigator.redirect(&url)
    }

    /// Force a refresh now.
    ///
    /// The explicit caller receives the outcome; a failure is also recorded
    /// on the snapshot, like one detected by an activation tick.
    pub async fn refresh(&self) -> Result<(), AuthError> {
        let code = self.location_code();
        let job = {
            let mut flow = self.flow.lock().await;
            let continuity = flow.tokens.is_authenticated() || code.is_some();
            let pkce = self.ensure_material(&mut flow, continuity);
            let token = flow.tokens.token.clone().unwrap_or_default();
            let refresh_token = flow.tokens.refresh_token.clone();
            self.claim(
                &mut flow,
                pkce,
                Pending::Refresh {
                    token,
                    refresh_token,
                },
            )
        };
        match job {
            Some(job) => self.run_job(job).await,
            // Another request is already in flight; its outcome will land.
            None => Ok(()),
        }
    }

    /// Drop the token triple and mark any in-flight response stale.
    ///
    /// The persisted nonce pair is left in place; the next idle activation
    /// mints a fresh one over it.
    pub async fn logout(&self) {
        let mut flow = self.flow.lock().await;
        flow.tokens = mem::take(&mut flow.tokens).reduce(Action::Logout);
        flow.generation += 1;
        flow.in_flight = None;
        debug!("logged out; token state cleared");
    }

    /// Apply a caller-supplied token triple directly.
    pub async fn set_token(&self, payload: TokenPayload) {
        let mut flow = self.flow.lock().await;
        flow.tokens = mem::take(&mut flow.tokens).reduce(Action::Authenticate(payload));
        flow.last_error = None;
    }

    pub async fn snapshot(&self) -> AuthSnapshot {
        let flow = self.flow.lock().await;
        AuthSnapshot {
            token: flow.tokens.token.clone(),
            refresh_token: flow.tokens.refresh_token.clone(),
            expire: flow.tokens.expire,
            is_authenticated: flow.tokens.is_authenticated(),
            phase: Phase::derive(&flow.tokens, self.location_code().is_some()),
            last_error: flow.last_error.clone(),
        }
    }

    fn location_code(&self) -> Option<String> {
        self.navigator
            .current_url()
            .and_then(|url| navigator::authorization_code(&url))
    }

    async fn current_phase(&self) -> Phase {
        let flow = self.flow.lock().await;
        Phase::derive(&flow.tokens, self.location_code().is_some())
    }

    /// Mint or reuse the verifier/state pair and persist it write-through.
    ///
    /// With continuity (a token is held or a code is pending) the in-memory
    /// pair wins, then the persisted one; a missing persisted pair degrades
    /// to a fresh mint. Without continuity a fresh pair is minted.
    fn ensure_material(&self, flow: &mut Flow, continuity: bool) -> PkceMaterial {
        let pkce = if continuity {
            match flow.pkce.take() {
                Some(existing) => existing,
                None => match (
                    self.store.get(SessionKey::CodeChallenge),
                    self.store.get(SessionKey::State),
                ) {
                    (Some(verifier), Some(state)) => PkceMaterial::from_parts(verifier, state),
                    _ => {
                        debug!("persisted nonce pair incomplete, minting a fresh one");
                        PkceMaterial::generate()
                    }
                },
            }
        } else {
            PkceMaterial::generate()
        };
        self.store.set(SessionKey::CodeChallenge, Some(pkce.verifier()));
        self.store.set(SessionKey::State, Some(pkce.state()));
        flow.pkce = Some(pkce.clone());
        pkce
    }

    fn claim(&self, flow: &mut Flow, pkce: PkceMaterial, pending: Pending) -> Option<Job> {
        if let Some(grant) = flow.in_flight {
            debug!(?grant, "request already in flight, not issuing another");
            return None;
        }
        flow.in_flight = Some(pending.grant());
        Some(Job {
            generation: flow.generation,
            pkce,
            pending,
        })
    }

    async fn run_job(&self, job: Job) -> Result<(), AuthError> {
        let grant = job.pending.grant();
        let result = match &job.pending {
            Pending::Exchange { code } => self.client.exchange_code(code, &job.pkce).await,
            Pending::Refresh {
                token,
                refresh_token,
            } => {
                self.client
                    .refresh(token, refresh_token.as_deref(), &job.pkce)
                    .await
            }
        };
        self.settle(grant, job.generation, result).await
    }

    async fn settle(
        &self,
        grant: GrantKind,
        generation: u64,
        result: Result<TokenPayload, AuthError>,
    ) -> Result<(), AuthError> {
        let mut flow = self.flow.lock().await;
        if flow.generation != generation {
            debug!(?grant, "discarding stale token response after logout");
            return Ok(());
        }
        flow.in_flight = None;
        match result {
            Ok(payload) => {
                flow.tokens = mem::take(&mut flow.tokens).reduce(Action::Authenticate(payload));
                flow.last_error = None;
                if grant == GrantKind::AuthorizationCode {
                    // Strip the consumed code from the visible location.
                    self.navigator.replace(&self.config.redirect_uri);
                }
                debug!(?grant, "token exchange succeeded");
                Ok(())
            }
            Err(err) => {
                warn!(?grant, error = %err, "token request failed, keeping current state");
                flow.last_error = Some(ExchangeFailure::record(grant, &err));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigator::StaticNavigator;
    use crate::store::MemorySessionStore;
    use chrono::Duration;
    use httpmock::prelude::*;
    use std::time::Duration as StdDuration;

    fn test_config(issuer: &str) -> ProviderConfig {
        ProviderConfig::new(
            Url::parse(issuer).unwrap(),
            "client-id",
            Url::parse("https://app.example.com/").unwrap(),
        )
        .with_scope("read write")
        .with_audience("https://api.example.com")
    }

    fn build(
        config: ProviderConfig,
        store: MemorySessionStore,
        navigator: Arc<StaticNavigator>,
    ) -> HandshakeController {
        HandshakeController::new(config, Arc::new(store), navigator).unwrap()
    }

    fn seeded_store() -> MemorySessionStore {
        let store = MemorySessionStore::new();
        store.set(SessionKey::CodeChallenge, Some("stored-verifier"));
        store.set(SessionKey::State, Some("stored-state"));
        store
    }

    fn expired_payload() -> TokenPayload {
        TokenPayload {
            token: "stale".into(),
            refresh_token: "R0".into(),
            expire: Utc::now() - Duration::minutes(1),
        }
    }

    fn token_body(token: &str, refresh: &str) -> serde_json::Value {
        serde_json::json!({
            "access_token": token,
            "refresh_token": refresh,
            "expires_in": 3600,
        })
    }

    #[tokio::test]
    async fn fresh_activation_mints_and_persists_material() {
        let store = MemorySessionStore::new();
        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let controller = build(
            test_config("https://id.example.com"),
            store.clone(),
            navigator,
        );

        let phase = controller.activate().await;
        assert_eq!(phase, Phase::Idle);
        let verifier = store.get(SessionKey::CodeChallenge).unwrap();
        let state = store.get(SessionKey::State).unwrap();
        assert_eq!(verifier.len(), 128);
        assert_eq!(state.len(), 80);
    }

    #[tokio::test]
    async fn pending_code_is_exchanged_exactly_once() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("authorization", "Bearer ABC")
                .body_contains("grant_type=authorization_code")
                .body_contains("code_verifier=stored-verifier")
                .body_contains("code=ABC")
                .body_contains("state=stored-state");
            then.status(200).json_body_obj(&token_body("T", "R"));
        });

        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/?code=ABC").unwrap(),
        ));
        let controller = build(
            test_config(&server.base_url()),
            seeded_store(),
            Arc::clone(&navigator),
        );

        let before = Utc::now();
        let phase = controller.activate().await;
        mock.assert();
        assert_eq!(phase, Phase::Authenticated);

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.token.as_deref(), Some("T"));
        assert_eq!(snapshot.refresh_token.as_deref(), Some("R"));
        assert!(snapshot.is_authenticated);
        let expire = snapshot.expire.unwrap();
        assert!(expire >= before + Duration::seconds(3595));
        assert!(expire <= Utc::now() + Duration::seconds(3605));

        // The consumed code is gone from the visible location.
        let location = navigator.current_url().unwrap();
        assert_eq!(location.as_str(), "https://app.example.com/");

        // A later activation has nothing left to exchange.
        let phase = controller.activate().await;
        assert_eq!(phase, Phase::Authenticated);
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn failed_exchange_keeps_state_and_records_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(500).body("upstream sadness");
        });

        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/?code=ABC").unwrap(),
        ));
        let controller = build(test_config(&server.base_url()), seeded_store(), navigator);

        let phase = controller.activate().await;
        mock.assert();
        assert_eq!(phase, Phase::PendingExchange);

        let snapshot = controller.snapshot().await;
        assert!(!snapshot.is_authenticated);
        let failure = snapshot.last_error.unwrap();
        assert_eq!(failure.grant, GrantKind::AuthorizationCode);
        assert_eq!(failure.status, Some(500));
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("authorization", "Bearer stale")
                .body_contains("grant_type=refresh_token")
                .body_contains("refresh_token=R0");
            then.status(200).json_body_obj(&token_body("T1", "R1"));
        });

        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let config = test_config(&server.base_url()).with_initial_tokens(expired_payload());
        let controller = build(config, MemorySessionStore::new(), navigator);

        let phase = controller.activate().await;
        mock.assert();
        assert_eq!(phase, Phase::Authenticated);
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.token.as_deref(), Some("T1"));
        assert_eq!(snapshot.refresh_token.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn failed_refresh_leaves_expired_state_in_place() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(401).body("expired for good");
        });

        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let config = test_config(&server.base_url()).with_initial_tokens(expired_payload());
        let controller = build(config, MemorySessionStore::new(), navigator);

        let phase = controller.activate().await;
        mock.assert();
        assert_eq!(phase, Phase::Expired);

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.token.as_deref(), Some("stale"));
        let failure = snapshot.last_error.unwrap();
        assert_eq!(failure.grant, GrantKind::RefreshToken);
        assert_eq!(failure.status, Some(401));
    }

    #[tokio::test]
    async fn explicit_refresh_returns_the_failure() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).body("invalid_grant");
        });

        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let config = test_config(&server.base_url()).with_initial_tokens(TokenPayload {
            token: "current".into(),
            refresh_token: "R0".into(),
            expire: Utc::now() + Duration::hours(1),
        });
        let controller = build(config, MemorySessionStore::new(), navigator);

        let err = controller.refresh().await.unwrap_err();
        mock.assert();
        assert!(matches!(err, AuthError::TokenEndpoint { .. }));
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.token.as_deref(), Some("current"));
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn overlapping_activations_issue_one_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .delay(StdDuration::from_millis(200))
                .json_body_obj(&token_body("T", "R"));
        });

        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/?code=ABC").unwrap(),
        ));
        let controller = build(test_config(&server.base_url()), seeded_store(), navigator);

        let (first, second) = tokio::join!(controller.activate(), controller.activate());
        mock.assert();
        assert!(first == Phase::Authenticated || second == Phase::Authenticated);
    }

    #[tokio::test]
    async fn logout_marks_in_flight_response_stale() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .delay(StdDuration::from_millis(300))
                .json_body_obj(&token_body("T", "R"));
        });

        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/?code=ABC").unwrap(),
        ));
        let controller = Arc::new(build(
            test_config(&server.base_url()),
            seeded_store(),
            navigator,
        ));

        let ticking = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.activate().await }
        });
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        controller.logout().await;
        ticking.await.unwrap();

        mock.assert();
        let snapshot = controller.snapshot().await;
        assert!(!snapshot.is_authenticated, "late response must not resurrect a token");
    }

    #[tokio::test]
    async fn authenticate_redirects_with_serialized_query() {
        let store = MemorySessionStore::new();
        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let controller = build(
            test_config("https://id.example.com"),
            store.clone(),
            Arc::clone(&navigator),
        );

        controller.authenticate().await.unwrap();
        let redirects = navigator.redirects();
        assert_eq!(redirects.len(), 1);
        let url = &redirects[0];
        assert!(url.as_str().starts_with("https://id.example.com/authorize?"));

        let verifier = store.get(SessionKey::CodeChallenge).unwrap();
        let state = store.get(SessionKey::State).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("client_id=client-id"));
        assert!(query.contains("response_type=code"));
        assert!(query.contains("response_mode=query"));
        assert!(query.contains(&format!("code_challenge={verifier}")));
        assert!(query.contains(&format!("state={state}")));
        assert!(!query.contains("code_challenge_method"));
    }

    #[tokio::test]
    async fn s256_challenge_is_derived_and_flagged() {
        let store = MemorySessionStore::new();
        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let config =
            test_config("https://id.example.com").with_challenge_method(ChallengeMethod::S256);
        let controller = build(config, store.clone(), Arc::clone(&navigator));

        controller.authenticate().await.unwrap();
        let url = &navigator.redirects()[0];
        let query = url.query().unwrap();
        let verifier = store.get(SessionKey::CodeChallenge).unwrap();
        assert!(query.contains("code_challenge_method=S256"));
        assert!(!query.contains(&format!("code_challenge={verifier}")));
    }

    #[tokio::test]
    async fn logout_then_idle_activation_mints_fresh_material() {
        let store = MemorySessionStore::new();
        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let controller = build(
            test_config("https://id.example.com"),
            store.clone(),
            navigator,
        );

        controller.activate().await;
        let first = store.get(SessionKey::CodeChallenge).unwrap();

        controller
            .set_token(TokenPayload {
                token: "T".into(),
                refresh_token: "R".into(),
                expire: Utc::now() + Duration::hours(1),
            })
            .await;
        // While authenticated the held pair is reused, not reminted.
        controller.activate().await;
        assert_eq!(store.get(SessionKey::CodeChallenge).unwrap(), first);

        controller.logout().await;
        let phase = controller.activate().await;
        assert_eq!(phase, Phase::Idle);
        let reminted = store.get(SessionKey::CodeChallenge).unwrap();
        assert_ne!(reminted, first);
        assert_eq!(reminted.len(), 128);
    }

    #[tokio::test]
    async fn set_token_applies_the_payload() {
        let navigator = Arc::new(StaticNavigator::with_location(
            Url::parse("https://app.example.com/").unwrap(),
        ));
        let controller = build(
            test_config("https://id.example.com"),
            MemorySessionStore::new(),
            navigator,
        );

        let payload = TokenPayload {
            token: "T".into(),
            refresh_token: "R".into(),
            expire: Utc::now() + Duration::hours(1),
        };
        controller.set_token(payload.clone()).await;
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.token, Some(payload.token));
        assert_eq!(snapshot.phase, Phase::Authenticated);
    }
}
