use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use uuid::Uuid;

use crate::auth::responses::Role;
use crate::auth::{AuthConfig, AuthError, AuthResult};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct SignedAccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// HS256 access tokens. Sessions are issued elsewhere; this service only
/// needs to verify them (and mint them for operators and tests).
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    access_token_ttl: Duration,
    kid: Option<String>,
}

impl JwtService {
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        if config.jwt_secret.is_empty() {
            return Err(AuthError::Config("jwt secret must not be empty".into()));
        }

        let secret_bytes = config.jwt_secret.as_bytes();
        let encoding_key = EncodingKey::from_secret(secret_bytes);
        let decoding_key = DecodingKey::from_secret(secret_bytes);

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[config.audience.clone()]);
        validation.set_issuer(&[config.issuer.clone()]);
        validation.leeway = 30;

        Ok(Self {
            encoding_key,
            decoding_key,
            validation,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_token_ttl: Duration::seconds(config.access_token_ttl_secs),
            kid: config.jwt_kid.clone(),
        })
    }

    pub fn issue_access_token(&self, user_id: &str, role: Role) -> AuthResult<SignedAccessToken> {
        self.issue_with_ttl(user_id, role, self.access_token_ttl)
    }

    pub fn issue_with_ttl(
        &self,
        user_id: &str,
        role: Role,
        ttl: Duration,
    ) -> AuthResult<SignedAccessToken> {
        let now = Utc::now();
        let expires_at = now + ttl;

        let mut header = Header::new(Algorithm::HS256);
        header.kid = self.kid.clone();

        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            role: role.as_str().to_string(),
        };

        let token = encode(&header, &claims, &self.encoding_key)?;

        Ok(SignedAccessToken { token, expires_at })
    }

    pub fn decode_access_token(&self, token: &str) -> AuthResult<AccessTokenClaims> {
        match decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation) {
            Ok(token_data) => Ok(token_data.claims),
            Err(err) if matches!(err.kind(), ErrorKind::ExpiredSignature) => {
                Err(AuthError::TokenExpired)
            }
            Err(_) => Err(AuthError::TokenInvalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestFixtures;

    #[test]
    fn issues_and_decodes_access_tokens() {
        let config = TestFixtures::auth_config();
        let service = JwtService::from_config(&config).expect("jwt service");

        let token = service
            .issue_access_token("admin-42", Role::Admin)
            .expect("issue token");

        let claims = service
            .decode_access_token(&token.token)
            .expect("decode token");

        assert_eq!(claims.sub, "admin-42");
        assert_eq!(claims.role, "admin");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn rejects_expired_and_foreign_tokens() {
        let config = TestFixtures::auth_config();
        let service = JwtService::from_config(&config).expect("jwt service");

        let expired = service
            .issue_with_ttl("admin-42", Role::Admin, Duration::minutes(-10))
            .expect("issue token");
        assert!(matches!(
            service.decode_access_token(&expired.token),
            Err(AuthError::TokenExpired)
        ));

        let other = JwtService::from_config(&AuthConfig {
            jwt_secret: "a-different-secret".into(),
            ..config
        })
        .expect("jwt service");
        let foreign = other.issue_access_token("admin-42", Role::Admin).expect("issue");
        assert!(matches!(
            service.decode_access_token(&foreign.token),
            Err(AuthError::TokenInvalid)
        ));
    }
}
