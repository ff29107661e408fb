use crate::auth::{AuthError, AuthResult};
use crate::config::{env_bool, env_string, env_u64};

/// Authentication configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub issuer: String,
    pub audience: String,
    pub access_token_ttl_secs: i64,
    pub jwt_secret: String,
    pub jwt_kid: Option<String>,
    pub csrf_secret: String,
    pub csrf_cookie_name: String,
    pub csrf_header_name: String,
    pub csrf_token_ttl_secs: i64,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
}

impl AuthConfig {
    pub fn from_env() -> AuthResult<Self> {
        let jwt_secret = std::env::var("IMPORT_JWT_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| AuthError::Config("IMPORT_JWT_SECRET is required".into()))?;
        let csrf_secret = std::env::var("IMPORT_CSRF_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .unwrap_or_else(|| jwt_secret.clone());

        Ok(Self {
            issuer: env_string("IMPORT_JWT_ISSUER", "http://localhost"),
            audience: env_string("IMPORT_JWT_AUDIENCE", "import-api"),
            access_token_ttl_secs: to_secs(env_u64("IMPORT_ACCESS_TOKEN_TTL_SECS", 900)),
            jwt_secret,
            jwt_kid: std::env::var("IMPORT_JWT_KID").ok(),
            csrf_secret,
            csrf_cookie_name: env_string("IMPORT_CSRF_COOKIE_NAME", "import_csrf"),
            csrf_header_name: env_string("IMPORT_CSRF_HEADER_NAME", "X-CSRF-Token"),
            csrf_token_ttl_secs: to_secs(env_u64("IMPORT_CSRF_TTL_SECS", 8 * 60 * 60)),
            cookie_domain: std::env::var("IMPORT_COOKIE_DOMAIN").ok(),
            cookie_secure: env_bool("IMPORT_COOKIE_SECURE", true),
        })
    }
}

fn to_secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
