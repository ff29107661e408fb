//! Double-submit anti-forgery tokens bound to the caller.
//!
//! A token is `nonce.signature` where the signature is
//! `sha256(secret:userId:nonce)` in hex. The same value travels in a cookie
//! and a request header; both must match and the signature must verify for
//! the authenticated user.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::auth::{AuthError, AuthResult};

pub struct CsrfService {
    secret: String,
}

impl CsrfService {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue(&self, user_id: &str) -> String {
        let nonce = generate_nonce();
        let signature = self.sign(user_id, &nonce);
        format!("{nonce}.{signature}")
    }

    pub fn verify(
        &self,
        user_id: &str,
        header: Option<&str>,
        cookie: Option<&str>,
    ) -> AuthResult<()> {
        let header = header.filter(|value| !value.is_empty()).ok_or(AuthError::CsrfMissing)?;
        let cookie = cookie.filter(|value| !value.is_empty()).ok_or(AuthError::CsrfMissing)?;

        if !constant_time_eq(header.as_bytes(), cookie.as_bytes()) {
            return Err(AuthError::CsrfMismatch);
        }

        let (nonce, signature) = header.split_once('.').ok_or(AuthError::CsrfMismatch)?;
        if nonce.is_empty() {
            return Err(AuthError::CsrfMismatch);
        }

        let expected = self.sign(user_id, nonce);
        if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::CsrfMismatch)
        }
    }

    fn sign(&self, user_id: &str, nonce: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{}", self.secret, user_id, nonce).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_for_its_user() {
        let csrf = CsrfService::new("csrf-secret");
        let token = csrf.issue("admin-1");
        assert!(csrf.verify("admin-1", Some(&token), Some(&token)).is_ok());
    }

    #[test]
    fn token_is_bound_to_user() {
        let csrf = CsrfService::new("csrf-secret");
        let token = csrf.issue("admin-1");
        assert!(matches!(
            csrf.verify("admin-2", Some(&token), Some(&token)),
            Err(AuthError::CsrfMismatch)
        ));
    }

    #[test]
    fn header_must_match_cookie() {
        let csrf = CsrfService::new("csrf-secret");
        let a = csrf.issue("admin-1");
        let b = csrf.issue("admin-1");
        assert_ne!(a, b);
        assert!(matches!(
            csrf.verify("admin-1", Some(&a), Some(&b)),
            Err(AuthError::CsrfMismatch)
        ));
    }

    #[test]
    fn missing_parts_are_reported() {
        let csrf = CsrfService::new("csrf-secret");
        let token = csrf.issue("admin-1");
        assert!(matches!(
            csrf.verify("admin-1", None, Some(&token)),
            Err(AuthError::CsrfMissing)
        ));
        assert!(matches!(
            csrf.verify("admin-1", Some(&token), Some("")),
            Err(AuthError::CsrfMissing)
        ));
    }

    #[test]
    fn forged_signature_fails() {
        let csrf = CsrfService::new("csrf-secret");
        let forged = "nonce.0000";
        assert!(matches!(
            csrf.verify("admin-1", Some(forged), Some(forged)),
            Err(AuthError::CsrfMismatch)
        ));
    }
}
