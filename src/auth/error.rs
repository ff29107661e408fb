use rocket::http::Status;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    TokenExpired,
    #[error("token invalid")]
    TokenInvalid,
    #[error("csrf token missing")]
    CsrfMissing,
    #[error("csrf token mismatch")]
    CsrfMismatch,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl AuthError {
    pub fn status(&self) -> Status {
        match self {
            AuthError::TokenExpired | AuthError::TokenInvalid | AuthError::Unauthorized => {
                Status::Unauthorized
            }
            AuthError::Jwt(_) => Status::Unauthorized,
            AuthError::Forbidden => Status::Forbidden,
            AuthError::CsrfMissing | AuthError::CsrfMismatch => Status::Forbidden,
            AuthError::Config(_) => Status::InternalServerError,
        }
    }

    pub fn is_csrf(&self) -> bool {
        matches!(self, AuthError::CsrfMissing | AuthError::CsrfMismatch)
    }
}
