use rocket::Request;
use rocket::State;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket_okapi::request::OpenApiFromRequest;

use crate::auth::responses::Role;
use crate::auth::{AuthError, AuthResult, AuthState};
use crate::gateway::SubmissionContext;

/// Caller identity taken from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq, OpenApiFromRequest)]
pub struct AuthUser {
    pub id: String,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match extract_user(request).await {
            Ok(user) => Outcome::Success(user),
            Err(err) => Outcome::Error((err.status(), err)),
        }
    }
}

#[derive(Debug, Clone, OpenApiFromRequest)]
pub struct RequireAdmin(pub AuthUser);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequireAdmin {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match AuthUser::from_request(request).await {
            Outcome::Success(user) => {
                if user.is_admin() {
                    Outcome::Success(RequireAdmin(user))
                } else {
                    Outcome::Error((Status::Forbidden, AuthError::Forbidden))
                }
            }
            Outcome::Error(err) => Outcome::Error(err),
            Outcome::Forward(_) => Outcome::Error((Status::Unauthorized, AuthError::Unauthorized)),
        }
    }
}

/// Never fails: authentication problems are handed to the gateway, which
/// audits them before rejecting the submission.
#[rocket::async_trait]
impl<'r> FromRequest<'r> for SubmissionContext {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let identity = extract_user(request).await;
        let client_ip = request.client_ip().map(|ip| ip.to_string());

        let (csrf_header, csrf_cookie) = match auth_state(request).await {
            Ok(state) => (
                request
                    .headers()
                    .get_one(&state.config.csrf_header_name)
                    .map(str::to_string),
                request
                    .cookies()
                    .get(&state.config.csrf_cookie_name)
                    .map(|cookie| cookie.value().to_string()),
            ),
            Err(err) => return Outcome::Error((err.status(), err)),
        };

        Outcome::Success(SubmissionContext {
            identity,
            csrf_header,
            csrf_cookie,
            client_ip,
        })
    }
}

async fn auth_state<'r>(request: &'r Request<'_>) -> AuthResult<&'r AuthState> {
    request
        .guard::<&State<AuthState>>()
        .await
        .succeeded()
        .map(|state| state.inner())
        .ok_or_else(|| AuthError::Config("AuthState missing from state".into()))
}

async fn extract_user(request: &Request<'_>) -> AuthResult<AuthUser> {
    let token = bearer_token_from_request(request)?;
    let state = auth_state(request).await?;

    let claims = state.jwt_service.decode_access_token(token)?;
    if claims.sub.trim().is_empty() {
        return Err(AuthError::TokenInvalid);
    }

    Ok(AuthUser {
        id: claims.sub,
        role: Role::from_str(&claims.role),
    })
}

fn bearer_token_from_request<'r>(request: &'r Request<'_>) -> AuthResult<&'r str> {
    let header = request
        .headers()
        .get_one("Authorization")
        .ok_or(AuthError::Unauthorized)?;
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty() {
        Ok(token)
    } else {
        Err(AuthError::Unauthorized)
    }
}
