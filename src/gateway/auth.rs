//! Authentication middleware
//!
//! Bridges axum requests to the [`CompositeRouter`]:
//! - Public paths bypass authentication
//! - The `oidc_session` cookie restores a browser login
//! - Bearer tokens and login flows are handed to the router
//! - Form-encoded bodies are read for `access_token`, `code` and `state`,
//!   then handed on unchanged
//!
//! An authenticated request carries its
//! [`AuthenticationResult`](super::context::AuthenticationResult) as a
//! request extension.

use std::sync::Arc;

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::composite::{CompositeRouter, RouteOutcome};
use super::context::AuthRequest;
use crate::oidc::AuthError;

/// Cookie carrying the session id of a browser login.
pub const SESSION_COOKIE: &str = "oidc_session";

/// Largest form body read for authentication parameters.
const MAX_FORM_BYTES: usize = 64 * 1024;

/// State shared by the middleware.
pub struct AuthState {
    /// The composite router
    pub router: Arc<CompositeRouter>,
    /// Path prefixes served without authentication
    pub public_paths: Vec<String>,
}

impl AuthState {
    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Authentication middleware
pub async fn oidc_middleware(
    State(state): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if state.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let mut auth = AuthRequest::new(path.as_str()).with_query(request.uri().query().unwrap_or(""));
    auth.headers = request.headers().clone();

    if is_form(request.headers()) {
        let (parts, body) = request.into_parts();
        let bytes = match to_bytes(body, MAX_FORM_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path, error = %e, "Form body rejected");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };
        auth = auth.with_form(&bytes);
        request = Request::from_parts(parts, Body::from(bytes));
    }

    if let Some(session_id) = session_cookie(request.headers()) {
        if let Some(result) = state.router.sessions().load(&session_id).await {
            debug!(provider = %result.provider, "Session restored");
            auth.security.set_authenticated(result);
        }
    }

    match state.router.route(&mut auth).await {
        RouteOutcome::PassThrough | RouteOutcome::Authenticated { .. } => {
            if let Some(result) = auth.security.take_authentication() {
                request.extensions_mut().insert(result);
            }
            next.run(request).await
        }
        RouteOutcome::Redirect { location } => redirect(&location, None),
        RouteOutcome::LoggedIn {
            session_id, location, ..
        } => redirect(&location, Some(&session_id)),
        RouteOutcome::Failed { provider, error } => failure_response(&provider, &error),
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
}

/// Session id from the request's cookies.
#[must_use]
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

/// `Set-Cookie` value for a session id. An empty id expires the cookie.
#[must_use]
pub fn session_cookie_header(session_id: &str) -> String {
    if session_id.is_empty() {
        format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0")
    } else {
        format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; Secure; SameSite=Lax")
    }
}

fn redirect(location: &str, session_id: Option<&str>) -> Response {
    let mut response = StatusCode::FOUND.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(location) {
        headers.insert(header::LOCATION, value);
    }
    if let Some(cookie) = session_id.map(session_cookie_header) {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.insert(header::SET_COOKIE, value);
        }
    }
    response
}

/// HTTP status for an authentication failure.
#[must_use]
pub fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::Remote(_) => StatusCode::BAD_GATEWAY,
        AuthError::Session(_) | AuthError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AuthError::UnknownProvider(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::UNAUTHORIZED,
    }
}

/// JSON error body for an authentication failure.
pub fn failure_response(provider: &str, error: &AuthError) -> Response {
    let status = status_for(error);
    let body = Json(json!({
        "error": error.to_string(),
        "provider": provider,
    }));
    if status == StatusCode::UNAUTHORIZED {
        (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
    } else {
        (status, body).into_response()
    }
}
