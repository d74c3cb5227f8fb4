//! Client-side OAuth2 authorization-code-with-PKCE helper.
//!
//! The [`controller::HandshakeController`] owns the handshake: it mints and
//! persists the PKCE verifier/state pair, exchanges an incoming authorization
//! code for the token triple, refreshes an expired token, and publishes a
//! read-only [`controller::AuthSnapshot`] to the host's view layer through
//! the [`context::ContextBridge`]. The host environment is abstracted behind
//! the [`store::SessionStore`] and [`navigator::Navigator`] traits.

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod exchange;
pub mod navigator;
pub mod nonce;
pub mod params;
pub mod state;
pub mod store;

pub use config::{ChallengeMethod, ConfigError, ProviderConfig, StoreLocator};
pub use context::{AuthHandle, ContextBridge, ContextValue, ProviderScope};
pub use controller::{AuthSnapshot, HandshakeController, Phase};
pub use error::{AuthError, ExchangeFailure};
pub use exchange::{GrantKind, TokenClient};
pub use navigator::{Navigator, StaticNavigator};
pub use nonce::PkceMaterial;
pub use state::{Action, TokenPayload, TokenState};
pub use store::{FileSessionStore, MemorySessionStore, SessionKey, SessionStore};
