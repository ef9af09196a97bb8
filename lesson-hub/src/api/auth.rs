use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
};
use lesson_hub_core::principal::Principal;
use tracing::{debug, warn};

use super::AppState;

/// Carries the refresh token next to the bearer access token.
pub const REFRESH_TOKEN_HEADER: &str = "X-Refresh-Token";

/// The authenticated caller of a request.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub principal: Principal,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(StatusCode::UNAUTHORIZED)?;
        let refresh_token = parts
            .headers
            .get(REFRESH_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let principal = Principal::from_access_token(token, refresh_token).map_err(|e| {
            debug!(error = %e, "rejecting bearer token");
            StatusCode::UNAUTHORIZED
        })?;

        if principal.is_expired_now() && principal.tokens.refresh_token.is_some() {
            if let Some(refresher) = &state.refresher {
                match refresher.refresh(&principal).await {
                    Ok(fresh) => return Ok(Self { principal: fresh }),
                    Err(e) => warn!(user = %principal.subject, error = %e, "token refresh failed, keeping session"),
                }
            }
        }
        Ok(Self { principal })
    }
}
