use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

use crate::config::ChallengeMethod;

/// Length of a freshly minted code verifier.
pub const VERIFIER_LEN: usize = 128;
/// Length of a freshly minted anti-CSRF state nonce.
pub const STATE_LEN: usize = 80;

/// Generate a random string safe for use in a URL query parameter.
///
/// Backed by `ThreadRng`, a CSPRNG, so values are unpredictable and
/// independent between calls.
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// PKCE code verifier and anti-CSRF state nonce for one authorization attempt.
///
/// Minted when no attempt is pending, persisted to the session store so the
/// pair survives the redirect round-trip, and rebuilt from the store after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceMaterial {
    verifier: String,
    state: String,
}

impl PkceMaterial {
    /// Mint a fresh verifier/state pair.
    pub fn generate() -> Self {
        Self {
            verifier: random_string(VERIFIER_LEN),
            state: random_string(STATE_LEN),
        }
    }

    /// Rebuild a pair previously persisted to the session store.
    pub fn from_parts(verifier: String, state: String) -> Self {
        Self { verifier, state }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// Challenge value carried by the authorization request.
    pub fn challenge(&self, method: ChallengeMethod) -> String {
        match method {
            ChallengeMethod::Plain => self.verifier.clone(),
            ChallengeMethod::S256 => {
                let digest = Sha256::digest(self.verifier.as_bytes());
                URL_SAFE_NO_PAD.encode(digest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_length_is_honored() {
        for len in [1, 16, STATE_LEN, VERIFIER_LEN] {
            assert_eq!(random_string(len).len(), len);
        }
    }

    #[test]
    fn consecutive_values_differ() {
        for _ in 0..32 {
            assert_ne!(random_string(VERIFIER_LEN), random_string(VERIFIER_LEN));
        }
    }

    #[test]
    fn output_is_query_safe() {
        let value = random_string(256);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn material_length_classes() {
        let material = PkceMaterial::generate();
        assert_eq!(material.verifier().len(), VERIFIER_LEN);
        assert_eq!(material.state().len(), STATE_LEN);
    }

    #[test]
    fn plain_challenge_is_the_verifier() {
        let material = PkceMaterial::generate();
        assert_eq!(material.challenge(ChallengeMethod::Plain), material.verifier());
    }

    #[test]
    fn s256_challenge_is_derived() {
        let material = PkceMaterial::from_parts("verifier".into(), "state".into());
        let challenge = material.challenge(ChallengeMethod::S256);
        assert_ne!(challenge, material.verifier());
        // 43 base64url chars for a 32-byte digest, no padding.
        assert_eq!(challenge.len(), 43);
        assert!(!challenge.contains('='));
    }
}
