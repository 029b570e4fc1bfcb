//! PKCE (Proof Key for Code Exchange) for the authorization code flow
//!
//! The verifier only ever leaves the process as the `code_verifier` parameter
//! of the token exchange. Neither it nor the derived context is persisted.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::AuthError;

/// Length of generated code verifiers (RFC 7636 allows 43-128).
pub const VERIFIER_LENGTH: usize = 96;

const STATE_BYTES: usize = 32;
const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Verifier/challenge pair for a single authorization attempt.
#[derive(Clone)]
pub struct PkceContext {
    verifier: String,
    challenge: String,
}

impl PkceContext {
    /// Draw a fresh verifier from the OS random source and derive its challenge.
    pub fn generate() -> Result<Self, AuthError> {
        let mut bytes = [0u8; VERIFIER_LENGTH];
        fill_random(&mut bytes)?;

        let verifier: String = bytes
            .iter()
            .map(|b| BASE36_ALPHABET[usize::from(b % 36)] as char)
            .collect();
        let challenge = code_challenge(&verifier);

        Ok(Self { verifier, challenge })
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn challenge_method(&self) -> &'static str {
        "S256"
    }
}

impl fmt::Debug for PkceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkceContext")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Random anti-CSRF value bound to one authorize request.
pub fn generate_state() -> Result<String, AuthError> {
    let mut bytes = [0u8; STATE_BYTES];
    fill_random(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn fill_random(buf: &mut [u8]) -> Result<(), AuthError> {
    getrandom::getrandom(buf).map_err(|e| AuthError::Entropy(e.to_string()))
}
