// HTTP surface for the auth service

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::{AuthError, AuthMethod, AuthRequest, AuthService, Principal};
use crate::rate_limit::RateDecision;
use crate::types::PrincipalId;

pub type AppState = Arc<AuthService>;

/// Largest request body buffered for signature checks.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const X_REFRESHED_TOKEN: HeaderName = HeaderName::from_static("x-refreshed-token");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/admin/profiles/{id}/invalidate", post(invalidate_profile))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    /// Authenticated, but missing a required capability.
    Forbidden(&'static str),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Auth(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Auth(err) => {
                let body = Json(json!({
                    "error": err.code(),
                    "message": err.to_string(),
                }));
                let mut response = (err.status_code(), body).into_response();
                if let AuthError::RateLimited { retry_after_secs } = err {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                }
                response
            }
            Self::Forbidden(capability) => {
                let body = Json(json!({
                    "error": "forbidden",
                    "message": format!("Missing capability: {}", capability),
                }));
                (StatusCode::FORBIDDEN, body).into_response()
            }
        }
    }
}

/// Authenticates every request, enforces the caller's quota and exposes the
/// principal to handlers through request extensions.
async fn authenticate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    };

    let params = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|q| q.0)
        .unwrap_or_default();
    let mut auth_request = AuthRequest::new(parts.method.clone(), parts.uri.path())
        .with_headers(parts.headers.clone())
        .with_body(bytes.to_vec())
        .with_params(params);
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        auth_request = auth_request.with_client_addr(addr.ip().to_string());
    }

    let decision = state.admit(&auth_request, parts.uri.path()).await;
    if let Err(err) = decision.into_result() {
        debug!("Rejecting {} {}: {}", parts.method, parts.uri.path(), err);
        let mut response = ApiError::Auth(err).into_response();
        set_quota_headers(&mut response, &decision);
        return response;
    }

    if let Some(principal) = auth_request.principal() {
        parts.extensions.insert(principal.clone());
    }
    let refreshed = auth_request.refreshed_token().map(str::to_string);

    let mut response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
    set_quota_headers(&mut response, &decision);
    if let Some(token) = refreshed.and_then(|t| HeaderValue::from_str(&t).ok()) {
        response.headers_mut().insert(X_REFRESHED_TOKEN, token);
    }
    response
}

fn set_quota_headers(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
}

/// Extractor for handlers that require an authenticated caller.
pub struct CurrentPrincipal(pub Principal);

impl<S: Send + Sync> FromRequestParts<S> for CurrentPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentPrincipal)
            .ok_or(ApiError::Auth(AuthError::VerificationFailed))
    }
}

fn principal_json(principal: &Principal) -> Value {
    json!({
        "id": principal.id(),
        "display": principal.display(),
        "auth_method": principal.auth_method(),
        "roles": principal.roles(),
        "capabilities": principal.capabilities(),
        "premium": principal.is_premium(),
    })
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Exchange a Basic credential for a bearer token.
async fn login(
    State(state): State<AppState>,
    CurrentPrincipal(principal): CurrentPrincipal,
) -> Result<Json<Value>, ApiError> {
    if principal.auth_method() != AuthMethod::Basic {
        return Err(ApiError::Auth(AuthError::VerificationFailed));
    }
    let issued = state.mint(principal.id(), Map::new()).await?;
    info!("Login for principal {} via {}", principal.id(), principal.auth_method());
    Ok(Json(json!({
        "token": issued.token,
        "token_type": "Bearer",
        "expires_at": issued.expires_at.to_rfc3339(),
        "principal": principal_json(&principal),
    })))
}

async fn logout(
    State(state): State<AppState>,
    CurrentPrincipal(principal): CurrentPrincipal,
) -> Result<StatusCode, ApiError> {
    state.invalidate(principal.id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn me(CurrentPrincipal(principal): CurrentPrincipal) -> Json<Value> {
    let mut body = principal_json(&principal);
    body["tier"] = json!(principal.tier());
    Json(body)
}

/// Drop the cached profile and cached tokens of an identity after the host
/// changed its roles or grants.
async fn invalidate_profile(
    State(state): State<AppState>,
    CurrentPrincipal(principal): CurrentPrincipal,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    if !principal.has_capability("manage_users") {
        return Err(ApiError::Forbidden("manage_users"));
    }
    let id = PrincipalId::new(id);
    state.profiles().invalidate(id).await?;
    state.invalidate(id).await?;
    info!("Principal {} invalidated profile {}", principal.id(), id);
    Ok(StatusCode::NO_CONTENT)
}
