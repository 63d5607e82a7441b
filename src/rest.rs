//! REST surface and router assembly.
//!
//! One `axum::Router` carries everything: room lifecycle, the health probe,
//! the OAuth dance, and the two WebSocket upgrade paths. The rate limiter
//! guards the `/rooms` prefix only.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{GithubOauth, IdentityVerifier};
use crate::control::ControlHub;
use crate::doc::DocEngine;
use crate::error::ApiError;
use crate::gateway;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::{Permission, RoomRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub docs: DocEngine,
    pub control: Arc<ControlHub>,
    /// Present only when the identity gate is enabled.
    pub verifier: Option<Arc<IdentityVerifier>>,
    pub oauth: Option<GithubOauth>,
    pub rate_limiter: RateLimiter,
    pub started: Instant,
}

pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    let cors = if cors_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any)
    } else {
        let origin = cors_origin.parse::<HeaderValue>().unwrap_or_else(|_| {
            warn!(origin = %cors_origin, "unparseable CORS_ORIGIN, allowing none");
            HeaderValue::from_static("null")
        });
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(Any)
    };

    let rooms = Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/{id}/join", post(join_room))
        .route("/rooms/{id}", get(get_room).delete(delete_room))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .merge(rooms)
        .route("/healthz", get(healthz))
        .route("/auth/github", get(github_authorize))
        .route("/auth/github/callback", get(github_callback))
        .route("/ws/{*doc_name}", get(gateway::ws_doc))
        .route("/control/{room_id}", get(gateway::ws_control))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub host_user_id: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub default_permission: Option<Permission>,
}

#[derive(Deserialize)]
struct JoinRoomRequest {
    token: String,
}

async fn create_room(
    State(app): State<AppState>,
    body: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let room = app
        .registry
        .create(
            req.name,
            req.host_user_id,
            req.require_approval,
            req.default_permission,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": room.id,
            "token": room.token,
            "name": room.name,
        })),
    ))
}

async fn join_room(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<JoinRoomRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let room = app.registry.authenticate(&id, &req.token).await?;
    Ok(Json(json!({
        "id": room.id,
        "name": room.name,
        "wsUrl": format!("/ws/{}", room.id),
    })))
}

async fn get_room(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let room = app.registry.get(&id).await.ok_or(ApiError::NotFound)?;
    Ok(Json(json!({
        "name": room.name,
        "createdAt": room.created_at,
    })))
}

async fn delete_room(
    State(app): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    app.registry.delete(&id, token).await?;
    Ok(Json(json!({ "ok": true })))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn healthz(State(app): State<AppState>) -> Json<Value> {
    let connections =
        app.docs.connection_count().await + app.control.connection_count().await;
    Json(json!({
        "ok": true,
        "uptime": app.started.elapsed().as_secs(),
        "rooms": app.registry.count().await,
        "connections": connections,
    }))
}

async fn github_authorize(State(app): State<AppState>) -> Result<Redirect, ApiError> {
    let oauth = app
        .oauth
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest("github oauth is not configured".into()))?;
    Ok(Redirect::temporary(&oauth.authorize_url()))
}

#[derive(Deserialize)]
struct OauthCallbackParams {
    code: Option<String>,
}

async fn github_callback(
    State(app): State<AppState>,
    Query(params): Query<OauthCallbackParams>,
) -> Result<Json<Value>, ApiError> {
    let oauth = app
        .oauth
        .as_ref()
        .ok_or_else(|| ApiError::BadRequest("github oauth is not configured".into()))?;
    let code = params
        .code
        .ok_or_else(|| ApiError::BadRequest("missing oauth code".into()))?;

    let (token, claims) = oauth.exchange_code(&code).await?;
    Ok(Json(json!({
        "token": token,
        "user": {
            "username": claims.username,
            "displayName": claims.display_name,
            "avatarUrl": claims.avatar_url,
        },
    })))
}
