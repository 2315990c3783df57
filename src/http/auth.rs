use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;

use crate::app::auth::AuthService;
use crate::http::AppError;
use crate::AppState;

pub const SESSION_COOKIE: &str = "arca_session";

/// Authenticated state re-derived per request from the session cookie.
/// Routes gate themselves by taking this extractor; requests without a
/// valid cookie never reach handler logic.
#[derive(Debug, Clone)]
pub struct Session {
    pub username: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .ok_or_else(|| AppError::unauthorized("missing session cookie"))?;

        let service = AuthService::new(
            state.db.clone(),
            state.session_key,
            state.session_ttl_hours,
        );
        let session = service
            .authenticate(&token)
            .ok_or_else(|| AppError::unauthorized("invalid session"))?;

        Ok(Session {
            username: session.username,
        })
    }
}
