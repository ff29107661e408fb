//! Authentication module: configuration, access-token verification,
//! anti-forgery tokens and Rocket request guards.

use std::sync::Arc;

pub mod config;
pub mod csrf;
pub mod error;
pub mod guards;
pub mod jwt;
pub mod responses;

pub use config::AuthConfig;
pub use csrf::CsrfService;
pub use error::{AuthError, AuthResult};
pub use guards::{AuthUser, RequireAdmin};
pub use jwt::JwtService;
pub use responses::Role;

#[derive(Clone)]
pub struct AuthState {
    pub config: AuthConfig,
    pub jwt_service: Arc<JwtService>,
    pub csrf: Arc<CsrfService>,
}

impl AuthState {
    pub fn from_config(config: AuthConfig) -> AuthResult<Self> {
        let jwt_service = JwtService::from_config(&config)?;
        let csrf = CsrfService::new(config.csrf_secret.clone());
        Ok(Self {
            config,
            jwt_service: Arc::new(jwt_service),
            csrf: Arc::new(csrf),
        })
    }
}
