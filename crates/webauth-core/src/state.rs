use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token triple applied by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token: String,
    pub refresh_token: String,
    pub expire: DateTime<Utc>,
}

/// Current token state.
///
/// The triple moves together: all three fields are populated after a
/// successful exchange and all three are absent after logout or before the
/// first one. No partial state survives a handshake cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub expire: Option<DateTime<Utc>>,
}

impl TokenState {
    pub fn from_payload(payload: TokenPayload) -> Self {
        Self::default().reduce(Action::Authenticate(payload))
    }

    /// True iff a token is held.
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// True iff all three fields are populated.
    pub fn is_complete(&self) -> bool {
        self.token.is_some() && self.refresh_token.is_some() && self.expire.is_some()
    }

    /// True iff an expiry is held and lies in the past.
    pub fn is_expired(&self) -> bool {
        match self.expire {
            Some(ts) => Utc::now() >= ts,
            None => false,
        }
    }

    /// Pure state reducer. Side effects (storage, network) belong to the
    /// handshake controller.
    pub fn reduce(self, action: Action) -> TokenState {
        match action {
            Action::Authenticate(payload) => TokenState {
                token: Some(payload.token),
                refresh_token: Some(payload.refresh_token),
                expire: Some(payload.expire),
            },
            Action::Logout => TokenState {
                token: None,
                refresh_token: None,
                expire: None,
            },
        }
    }
}

/// Mutations accepted by the reducer.
///
/// The set is closed: anything outside it is unrepresentable, so there is no
/// runtime invalid-action path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Authenticate(TokenPayload),
    Logout,
}
