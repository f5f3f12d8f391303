use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::ApiContext;
use shared::{
    domain::{MessageId, UserId, UserIdentity},
    error::{ApiError, ErrorCode},
    protocol::MessagePayload,
};
use storage::Storage;
use tracing::info;

use crate::{
    app_state::AppState,
    auth::AuthKeys,
    registry::{PresenceDirectory, RoomRegistry, SessionRegistry},
};

mod app_state;
mod auth;
mod config;
mod connection;
mod registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = config::load_settings();
    let database_url = config::prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await?;

    let state = AppState {
        api: ApiContext { storage },
        auth: Arc::new(AuthKeys::new(
            &settings.auth_secret,
            settings.token_ttl_seconds,
        )),
        sessions: Arc::new(SessionRegistry::new()),
        presence: Arc::new(PresenceDirectory::new()),
        rooms: Arc::new(RoomRegistry::new()),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&settings.server_bind).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/users/:id", get(user_identity))
        .route("/history", get(history))
        .route("/messages/:id/waveform", patch(set_waveform))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// ApiError carried through an HTTP response with the matching status.
struct ApiRejection(ApiError);

impl From<ApiError> for ApiRejection {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.0)).into_response()
    }
}

fn bearer_user(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiRejection> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ApiRejection(ApiError::new(ErrorCode::Unauthorized, "missing bearer token"))
        })?;
    state
        .auth
        .verify_token(token)
        .map_err(|_| ApiRejection(ApiError::new(ErrorCode::Unauthorized, "invalid bearer token")))
}

async fn healthz(State(state): State<AppState>) -> Result<&'static str, ApiRejection> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| ApiRejection(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok("ok")
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    display_name: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: UserId,
    token: String,
}

/// Username-based login, creating the account on first sight. The
/// returned token authenticates both the REST surface and the
/// websocket upgrade.
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiRejection> {
    let username = request.username.trim();
    if username.is_empty() {
        return Err(ApiRejection(ApiError::new(
            ErrorCode::Validation,
            "username cannot be empty",
        )));
    }
    let display_name = if request.display_name.trim().is_empty() {
        username
    } else {
        request.display_name.trim()
    };

    let user_id = state
        .api
        .storage
        .create_user(username, display_name)
        .await
        .map_err(|e| ApiRejection(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    let token = state
        .auth
        .mint_token(user_id)
        .map_err(|e| ApiRejection(ApiError::new(ErrorCode::Internal, e.to_string())))?;

    Ok(Json(LoginResponse { user_id, token }))
}

/// Identity lookup for rendering a peer's name next to their messages.
async fn user_identity(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<UserIdentity>, ApiRejection> {
    bearer_user(&state, &headers)?;
    let identity = state
        .api
        .storage
        .identity_for_user(UserId(user_id))
        .await
        .map_err(|e| ApiRejection(ApiError::new(ErrorCode::Internal, e.to_string())))?
        .ok_or_else(|| ApiRejection(ApiError::new(ErrorCode::NotFound, "user not found")))?;
    Ok(Json(identity))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    other_user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    messages: Vec<MessagePayload>,
}

/// Paged conversation history, newest first. Fetching also batch-marks
/// the requester's unread inbound messages; the read receipts go out
/// over the senders' live sessions, if any.
async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiRejection> {
    let user_id = bearer_user(&state, &headers)?;
    let page = server_api::history(
        &state.api,
        user_id,
        UserId(query.other_user_id),
        query.limit.unwrap_or(50),
        query.before.map(MessageId),
    )
    .await?;

    for receipt in page.read_receipts {
        state.sessions.send_to(receipt.target, receipt.event).await;
    }

    Ok(Json(HistoryResponse {
        messages: page.messages,
    }))
}

#[derive(Debug, Deserialize)]
struct WaveformRequest {
    waveform: Vec<f32>,
}

/// Waveform backfill from the upload pipeline, pushed to both parties.
async fn set_waveform(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<WaveformRequest>,
) -> Result<StatusCode, ApiRejection> {
    bearer_user(&state, &headers)?;
    let events =
        server_api::set_waveform(&state.api, MessageId(message_id), &request.waveform).await?;
    for targeted in events {
        state
            .sessions
            .send_to(targeted.target, targeted.event)
            .await;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: String,
}

/// Token check happens before the upgrade so an invalid credential is
/// rejected with a plain 401 and never reaches the session registry.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.auth.verify_token(&params.token) {
        Ok(user_id) => {
            ws.on_upgrade(move |socket| connection::run_connection(state, socket, user_id))
        }
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
