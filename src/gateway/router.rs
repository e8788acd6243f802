//! HTTP router and handlers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, warn};

use super::auth::{AuthState, failure_response, oidc_middleware, session_cookie, session_cookie_header};
use super::composite::CompositeRouter;
use super::context::{AuthRequest, AuthenticationResult};
use crate::oidc::AuthError;

/// Shared application state
pub struct AppState {
    /// Composite router shared with the middleware
    pub router: Arc<CompositeRouter>,
    /// Timeout applied to every request
    pub request_timeout: Duration,
}

/// Create the HTTP router.
///
/// Login and callback routes are answered by the middleware; their handler
/// only runs for unknown providers or requests that already carry a principal.
pub fn create_router(state: Arc<AppState>, public_paths: Vec<String>) -> Router {
    let auth_state = Arc::new(AuthState {
        router: Arc::clone(&state.router),
        public_paths,
    });
    let timeout = state.request_timeout;

    Router::new()
        .route("/health", get(health_handler))
        .route("/whoami", get(whoami_handler).post(whoami_handler))
        .route("/openid/{provider}/login", get(flow_handler))
        .route("/openid/{provider}/callback", get(flow_handler).post(flow_handler))
        .route("/openid/{provider}/logout", post(logout_handler))
        .route("/openid/{provider}/refresh", post(refresh_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(auth_state, oidc_middleware))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.router.registry().names().collect::<Vec<_>>(),
        "cache": state.router.cache().stats(),
    }))
}

/// GET|POST /whoami - the authenticated principal, or where to log in
async fn whoami_handler(
    State(state): State<Arc<AppState>>,
    auth: Option<Extension<AuthenticationResult>>,
) -> Response {
    match auth {
        Some(Extension(result)) => Json(result).into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(json!({
                "error": "Not authenticated",
                "login": state.router.login_entry_points(),
            })),
        )
            .into_response(),
    }
}

async fn flow_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if state.router.registry().get(&provider).is_none() {
        return failure_response(&provider, &AuthError::UnknownProvider(provider.clone()));
    }
    // Already signed in: skip the provider round trip
    let location = params
        .get("return_to")
        .filter(|p| p.starts_with('/') && !p.starts_with("//"))
        .map_or("/", String::as_str);
    Redirect::to(location).into_response()
}

/// POST /openid/{provider}/logout
///
/// Revokes the presented token (or the session's) and ends the session.
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    auth: Option<Extension<AuthenticationResult>>,
) -> Response {
    let presented = AuthRequest {
        headers: headers.clone(),
        ..AuthRequest::default()
    };
    let token = presented.presented_bearer().map(str::to_string).or_else(|| {
        auth.as_ref()
            .filter(|Extension(result)| result.provider == provider)
            .map(|Extension(result)| result.access_token.clone())
    });
    let Some(token) = token else {
        return failure_response(&provider, &AuthError::MissingToken);
    };

    let invalidated = match state.router.logout(&provider, &token).await {
        Ok(invalidated) => invalidated,
        Err(e) => return failure_response(&provider, &e),
    };

    let mut response = Json(json!({ "provider": provider, "invalidated": invalidated })).into_response();
    if let Some(session_id) = session_cookie(&headers) {
        let removed = state.router.sessions().remove(&session_id).await;
        debug!(provider = %provider, removed, "Session ended");
        if let Ok(value) = HeaderValue::from_str(&session_cookie_header("")) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

/// POST /openid/{provider}/refresh - refresh the tokens behind the session
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_cookie(&headers) else {
        return failure_response(&provider, &AuthError::MissingToken);
    };
    match state.router.sessions().load(&session_id).await {
        Some(session) if session.provider == provider => {}
        Some(_) | None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "No session for this provider", "provider": provider })),
            )
                .into_response();
        }
    }

    match state.router.refresh_session(&session_id).await {
        Ok(tokens) => Json(json!({
            "provider": provider,
            "token_type": tokens.token_type,
            "expires_in": tokens.expires_in,
            "scope": tokens.scope,
        }))
        .into_response(),
        Err(e) => {
            warn!(provider = %provider, error = %e, "Session refresh failed");
            failure_response(&provider, &e)
        }
    }
}
