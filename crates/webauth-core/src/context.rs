use std::sync::{Arc, RwLock};

use crate::controller::{AuthSnapshot, HandshakeController, Phase};
use crate::error::AuthError;
use crate::state::TokenPayload;

/// Capability bundle handed to the view layer: read the snapshot, drive the
/// handshake.
#[derive(Clone)]
pub struct AuthHandle {
    controller: Arc<HandshakeController>,
}

impl std::fmt::Debug for AuthHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandle").finish_non_exhaustive()
    }
}

impl AuthHandle {
    pub fn new(controller: Arc<HandshakeController>) -> Self {
        Self { controller }
    }

    pub async fn snapshot(&self) -> AuthSnapshot {
        self.controller.snapshot().await
    }

    pub async fn activate(&self) -> Phase {
        self.controller.activate().await
    }

    pub async fn authenticate(&self) -> Result<(), AuthError> {
        self.controller.authenticate().await
    }

    pub async fn refresh(&self) -> Result<(), AuthError> {
        self.controller.refresh().await
    }

    pub async fn logout(&self) {
        self.controller.logout().await
    }

    pub async fn set_token(&self, payload: TokenPayload) {
        self.controller.set_token(payload).await
    }
}

/// Value read by consumers of the bridge.
///
/// A working handle inside an installed provider scope, an explicit marker
/// outside one — the consumer must check rather than receive a throwing stub.
#[derive(Clone)]
pub enum ContextValue {
    Uninitialized,
    Ready(AuthHandle),
}

impl ContextValue {
    /// Access the handle, failing fast when no provider scope is active.
    pub fn handle(&self) -> Result<&AuthHandle, AuthError> {
        match self {
            ContextValue::Uninitialized => Err(AuthError::OutsideProviderScope),
            ContextValue::Ready(handle) => Ok(handle),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ContextValue::Ready(_))
    }
}

/// Shared slot connecting a provider scope to its consumers.
#[derive(Clone, Default)]
pub struct ContextBridge {
    slot: Arc<RwLock<Option<AuthHandle>>>,
}

impl ContextBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a handle for the lifetime of the returned scope guard.
    pub fn install(&self, handle: AuthHandle) -> ProviderScope {
        *self.slot.write().unwrap() = Some(handle);
        ProviderScope {
            slot: Arc::clone(&self.slot),
        }
    }

    /// The current value as seen by a consumer.
    pub fn value(&self) -> ContextValue {
        match self.slot.read().unwrap().as_ref() {
            Some(handle) => ContextValue::Ready(handle.clone()),
            None => ContextValue::Uninitialized,
        }
    }
}

/// Keeps the bridge populated; dropping it (scope unmount) empties the slot.
pub struct ProviderScope {
    slot: Arc<RwLock<Option<AuthHandle>>>,
}

impl Drop for ProviderScope {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.write() {
            *slot = None;
        }
    }
}
