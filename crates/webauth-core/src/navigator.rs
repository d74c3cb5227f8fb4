use std::sync::Mutex;

use url::Url;

use crate::error::AuthError;

/// Host URL/navigation capability.
///
/// Abstracts the browser location: where the host currently is, full
/// top-level navigations, and history-entry replacement.
pub trait Navigator: Send + Sync {
    /// The location the host is currently showing, if any.
    fn current_url(&self) -> Option<Url>;

    /// Perform a full top-level navigation. Terminal for the current scope;
    /// the controller re-enters on the post-redirect activation.
    fn redirect(&self, url: &Url) -> Result<(), AuthError>;

    /// Replace the current history entry without adding a new one.
    fn replace(&self, url: &Url);
}

/// Extract the `code` query parameter from a location.
pub(crate) fn authorization_code(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
}

/// In-memory navigator for tests and embedded hosts.
#[derive(Debug, Default)]
pub struct StaticNavigator {
    location: Mutex<Option<Url>>,
    redirects: Mutex<Vec<Url>>,
}

impl StaticNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(url: Url) -> Self {
        Self {
            location: Mutex::new(Some(url)),
            redirects: Mutex::new(Vec::new()),
        }
    }

    pub fn set_location(&self, url: Url) {
        *self.location.lock().unwrap() = Some(url);
    }

    /// URLs passed to [`Navigator::redirect`], oldest first.
    pub fn redirects(&self) -> Vec<Url> {
        self.redirects.lock().unwrap().clone()
    }
}

impl Navigator for StaticNavigator {
    fn current_url(&self) -> Option<Url> {
        self.location.lock().unwrap().clone()
    }

    fn redirect(&self, url: &Url) -> Result<(), AuthError> {
        self.redirects.lock().unwrap().push(url.clone());
        *self.location.lock().unwrap() = Some(url.clone());
        Ok(())
    }

    fn replace(&self, url: &Url) {
        *self.location.lock().unwrap() = Some(url.clone());
    }
}
