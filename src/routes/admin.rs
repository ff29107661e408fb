//! Administrative endpoints: anti-forgery token issuance and the audit view.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rocket::State;
use rocket::http::{Cookie, CookieJar, SameSite};
use rocket::serde::json::Json;
use rocket_okapi::openapi;
use time::Duration as TimeDuration;

use crate::audit::models::{DEFAULT_AUDIT_QUERY_LIMIT, MAX_AUDIT_QUERY_LIMIT};
use crate::audit::{AuditLogEntry, AuditSink};
use crate::auth::responses::CsrfTokenResponse;
use crate::auth::{AuthState, AuthUser, RequireAdmin};
use crate::error::{ApiError, ApiResult};

/// Issue an anti-forgery token bound to the caller.
///
/// The token is set as a script-readable cookie and returned in the body; the
/// admin UI echoes it back in the configured header on every submission.
#[openapi(tag = "Admin")]
#[get("/admin/csrf")]
pub fn issue_csrf_token(
    user: AuthUser,
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
) -> Json<CsrfTokenResponse> {
    let token = state.csrf.issue(&user.id);
    let expires_at = Utc::now() + Duration::seconds(state.config.csrf_token_ttl_secs);

    let mut cookie = Cookie::build((state.config.csrf_cookie_name.clone(), token.clone()))
        .path("/")
        .http_only(false)
        .same_site(SameSite::Strict)
        .secure(state.config.cookie_secure)
        .max_age(TimeDuration::seconds(state.config.csrf_token_ttl_secs))
        .build();
    if let Some(domain) = &state.config.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookies.add(cookie);

    Json(CsrfTokenResponse {
        csrf_token: token,
        header_name: state.config.csrf_header_name.clone(),
        expires_at,
    })
}

/// Most recent audit entries, newest first.
#[openapi(tag = "Admin")]
#[get("/admin/audit?<limit>")]
pub async fn list_audit_entries(
    _admin: RequireAdmin,
    audit: &State<Arc<dyn AuditSink>>,
    limit: Option<usize>,
) -> ApiResult<Vec<AuditLogEntry>> {
    let limit = limit
        .unwrap_or(DEFAULT_AUDIT_QUERY_LIMIT)
        .clamp(1, MAX_AUDIT_QUERY_LIMIT);
    let entries = audit.recent(limit).await.map_err(ApiError::from)?;
    Ok(Json(entries))
}
