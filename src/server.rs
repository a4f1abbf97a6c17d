//! HTTP surface: scheduled trigger and OAuth sign-in

use axum::extract::{Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{GoogleOAuthClient, TokenRefreshCoordinator};
use crate::context::AppContext;
use crate::credentials::CredentialStore;
use crate::error::{Result, TriageError};
use crate::pipeline::Pipeline;
use crate::store::KvStore;

/// How long a sign-in attempt may take between login and callback
pub const OAUTH_STATE_TTL: Duration = Duration::from_secs(10 * 60);

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub credentials: CredentialStore,
    pub auth: TokenRefreshCoordinator,
    pub oauth: Arc<GoogleOAuthClient>,
    pub store: Arc<dyn KvStore>,
    pub cron_secret: String,
}

impl AppState {
    pub fn from_context(context: &AppContext) -> Self {
        Self {
            pipeline: context.pipeline.clone(),
            credentials: context.credentials.clone(),
            auth: context.auth.clone(),
            oauth: context.oauth.clone(),
            store: context.store.clone(),
            cron_secret: context.config.server.cron_secret.clone(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/cron/categorize", get(categorize))
        .route("/api/auth/login", get(login))
        .route("/api/auth/callback", get(callback))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Listening on {}", bind);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn oauth_state_key(nonce: &str) -> String {
    format!("oauth-state:{}", nonce)
}

/// An unset secret never authorizes anything. SHA-256 digests of both sides
/// are compared in constant time.
fn is_authorized(headers: &HeaderMap, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(presented) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    let expected = Sha256::digest(secret.as_bytes());
    let presented = Sha256::digest(presented.as_bytes());
    expected.as_slice().ct_eq(presented.as_slice()).into()
}

fn internal_error(e: TriageError) -> Response {
    error!("Request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error", "details": e.to_string() })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CronQuery {
    #[serde(default)]
    pub debug: Option<String>,
}

// GET /api/cron/categorize
async fn categorize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Response {
    if !is_authorized(&headers, &state.cron_secret) {
        warn!("Rejected trigger with missing or wrong secret");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    if query.debug.as_deref() == Some("true") {
        return match state.credentials.overview().await {
            Ok(overview) => Json(overview).into_response(),
            Err(e) => internal_error(e),
        };
    }

    match state.pipeline.process_all().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal_error(e),
    }
}

// GET /api/auth/login
async fn login(State(state): State<Arc<AppState>>) -> Response {
    let nonce = Uuid::new_v4().to_string();
    if let Err(e) = state
        .store
        .set_ex(&oauth_state_key(&nonce), "1", OAUTH_STATE_TTL)
        .await
    {
        return internal_error(e);
    }

    match state.oauth.authorization_url(&nonce) {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

// GET /api/auth/callback
async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(denied) = query.error.as_deref() {
        warn!("Sign-in denied by provider: {}", denied);
        return bad_request(denied);
    }
    let Some(code) = query.code.as_deref() else {
        return bad_request("missing authorization code");
    };
    let Some(nonce) = query.state.as_deref() else {
        return bad_request("missing state");
    };

    let key = oauth_state_key(nonce);
    match state.store.get(&key).await {
        Ok(Some(_)) => {
            if let Err(e) = state.store.del(&key).await {
                warn!("Failed to clear sign-in state: {}", e);
            }
        }
        Ok(None) => return bad_request("unknown or expired sign-in state"),
        Err(e) => return internal_error(e),
    }

    match state.auth.complete_sign_in(code).await {
        Ok(email) => Json(json!({ "success": true, "email": email })).into_response(),
        Err(e @ (TriageError::Unauthenticated(_) | TriageError::Forbidden(_))) => {
            warn!("Sign-in failed: {}", e);
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}
