//! REST surface shared by both listeners, plus the admin-only routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use arena_core::error::Error;
use arena_core::types::LobbyId;

use crate::gateway::GatewayState;
use crate::match_manager::now_ms;

pub fn routes() -> Router<GatewayState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth", post(auth))
        .route("/api/logout", post(logout))
        .route("/api/lobbies", get(lobbies))
}

pub fn admin_routes() -> Router<GatewayState> {
    Router::new()
        .route("/api/bot/add", post(bot_add))
        .route("/api/bot/fill", post(bot_fill))
        .route("/api/bot/remove", post(bot_remove))
        .route("/api/dev/reset", post(dev_reset))
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(e: Error) -> ApiError {
    let status = match e.user_code() {
        1001 | 1002 => StatusCode::UNAUTHORIZED,
        2001 | 4001 => StatusCode::NOT_FOUND,
        9999 => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(json!({ "code": e.user_code(), "message": e.to_string() })),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchHealthBody {
    match_id: String,
    lobby_id: LobbyId,
    status: String,
    tick: u64,
    last_tick_age_ms: u64,
}

async fn health(State(state): State<GatewayState>) -> (StatusCode, Json<serde_json::Value>) {
    let database_ok = state.app.store.health_check().await.is_ok();
    let matches: Vec<MatchHealthBody> = state
        .app
        .matches
        .health_snapshot(now_ms())
        .await
        .into_iter()
        .map(|m| MatchHealthBody {
            match_id: m.match_id.to_string(),
            lobby_id: m.lobby_id,
            status: m.status.as_str().to_string(),
            tick: m.tick,
            last_tick_age_ms: m.last_tick_age_ms,
        })
        .collect();
    let body = json!({
        "database": if database_ok { "ok" } else { "unhealthy" },
        "deferredQueue": state
            .app
            .deferred_pending
            .load(std::sync::atomic::Ordering::Relaxed),
        "matches": matches,
    });
    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthBody {
    wallet: String,
    message: String,
    signature: String,
}

async fn auth(
    State(state): State<GatewayState>,
    Json(body): Json<AuthBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (user, session) = state
        .app
        .auth
        .login(&body.wallet, &body.message, &body.signature)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({
        "sessionToken": session.token,
        "userId": user.id,
        "wallet": user.wallet.to_string(),
        "expiresAt": session.expires_at,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogoutBody {
    session_token: String,
}

async fn logout(
    State(state): State<GatewayState>,
    Json(body): Json<LogoutBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .app
        .auth
        .logout(&body.session_token)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "ok": true })))
}

async fn lobbies(
    State(state): State<GatewayState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lobbies = state.app.lobby.lobby_list().await.map_err(api_error)?;
    Ok(Json(json!({ "lobbies": lobbies })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LobbyBody {
    lobby_id: LobbyId,
}

async fn bot_add(
    State(state): State<GatewayState>,
    Json(body): Json<LobbyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state
        .app
        .bots
        .add_bot(body.lobby_id)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "lobby": summary })))
}

async fn bot_fill(
    State(state): State<GatewayState>,
    Json(body): Json<LobbyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state
        .app
        .bots
        .fill_lobby(body.lobby_id)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "lobby": summary })))
}

async fn bot_remove(
    State(state): State<GatewayState>,
    Json(body): Json<LobbyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let summary = state
        .app
        .bots
        .remove_bots(body.lobby_id)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "lobby": summary })))
}

async fn dev_reset(
    State(state): State<GatewayState>,
    Json(body): Json<LobbyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .app
        .force_reset(body.lobby_id)
        .await
        .map_err(api_error)?;
    Ok(Json(json!({ "ok": true })))
}
