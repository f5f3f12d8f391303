use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{PresenceStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, ServerEvent},
};
use tracing::{debug, info};

use crate::app_state::AppState;

/// Drives one authenticated websocket session from registration to
/// cleanup. The socket only reaches this point with a verified token.
pub async fn run_connection(state: AppState, socket: WebSocket, user_id: UserId) {
    let (connection_id, mut outbound) = state.sessions.register(user_id).await;
    info!(user_id = user_id.0, connection_id, "session connected");

    let online = state
        .presence
        .set_status(user_id, PresenceStatus::Online)
        .await;
    state.sessions.broadcast_except(user_id, &online).await;
    let entries = state.presence.snapshot_all().await;
    state
        .sessions
        .send_to(user_id, ServerEvent::PresenceSnapshot { entries })
        .await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = ws_rx.next().await {
        match frame {
            Message::Text(raw) => dispatch_raw(&state, user_id, &raw).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    writer.abort();
    handle_disconnect(&state, user_id, connection_id).await;
    info!(user_id = user_id.0, connection_id, "session closed");
}

async fn dispatch_raw(state: &AppState, user_id: UserId, raw: &str) {
    match serde_json::from_str::<ClientRequest>(raw) {
        Ok(request) => dispatch(state, user_id, request).await,
        Err(err) => {
            debug!(user_id = user_id.0, %err, "unparseable frame");
            state
                .sessions
                .send_to(
                    user_id,
                    ServerEvent::Error(ApiError::new(
                        ErrorCode::Validation,
                        format!("malformed request: {err}"),
                    )),
                )
                .await;
        }
    }
}

/// Handle one request. Failures are reported to the caller's own
/// session only; no other participant ever observes them. Send
/// rejections keep their nonce so the client can fail the exact
/// optimistic message.
pub(crate) async fn dispatch(state: &AppState, user_id: UserId, request: ClientRequest) {
    let client_nonce = match &request {
        ClientRequest::SendMessage { client_nonce, .. }
        | ClientRequest::SendGroupMessage { client_nonce, .. } => Some(client_nonce.clone()),
        _ => None,
    };
    if let Err(err) = handle_request(state, user_id, request).await {
        let event = match client_nonce {
            Some(client_nonce) => ServerEvent::SendFailed {
                client_nonce,
                error: err,
            },
            None => ServerEvent::Error(err),
        };
        state.sessions.send_to(user_id, event).await;
    }
}

async fn handle_request(
    state: &AppState,
    user_id: UserId,
    request: ClientRequest,
) -> Result<(), ApiError> {
    match request {
        ClientRequest::SendMessage {
            client_nonce,
            recipient_id,
            draft,
        } => {
            let recipient_is_live = state.sessions.is_live(recipient_id).await;
            let outcome = server_api::send_direct_message(
                &state.api,
                user_id,
                recipient_id,
                &client_nonce,
                &draft,
                recipient_is_live,
            )
            .await?;
            if let Some(push) = outcome.push {
                state.sessions.send_to(outcome.recipient_id, push).await;
            }
            state.sessions.send_to(user_id, outcome.ack).await;
        }
        ClientRequest::SendGroupMessage {
            client_nonce,
            group_id,
            draft,
        } => {
            let outcome =
                server_api::send_group_message(&state.api, user_id, group_id, &client_nonce, &draft)
                    .await?;
            let targets: Vec<UserId> = state
                .rooms
                .members(outcome.group_id)
                .await
                .into_iter()
                .filter(|member| *member != user_id)
                .collect();
            state
                .sessions
                .send_to_many(&targets, &outcome.broadcast)
                .await;
            state.sessions.send_to(user_id, outcome.ack).await;
        }
        ClientRequest::MarkDelivered { message_id } => {
            if let Some(receipt) =
                server_api::mark_delivered(&state.api, user_id, message_id).await?
            {
                state.sessions.send_to(receipt.target, receipt.event).await;
            }
        }
        ClientRequest::MarkRead { message_id } => {
            if let Some(receipt) =
                server_api::mark_read(&state.api, user_id, message_id, Utc::now()).await?
            {
                state.sessions.send_to(receipt.target, receipt.event).await;
            }
        }
        ClientRequest::React { message_id, emoji } => {
            for targeted in server_api::react(&state.api, user_id, message_id, &emoji).await? {
                state
                    .sessions
                    .send_to(targeted.target, targeted.event)
                    .await;
            }
        }
        ClientRequest::Unsend { message_id } => {
            for targeted in server_api::unsend(&state.api, user_id, message_id).await? {
                state
                    .sessions
                    .send_to(targeted.target, targeted.event)
                    .await;
            }
        }
        ClientRequest::JoinGroup { group_id } => {
            server_api::join_group(&state.api, user_id, group_id).await?;
            // Notify the users already in the room, then subscribe.
            let members = state.rooms.members(group_id).await;
            state
                .sessions
                .send_to_many(&members, &ServerEvent::GroupUserJoined { group_id, user_id })
                .await;
            state.rooms.join(group_id, user_id).await;
        }
        ClientRequest::LeaveGroup { group_id } => {
            state.rooms.leave(group_id, user_id).await;
            let members = state.rooms.members(group_id).await;
            state
                .sessions
                .send_to_many(&members, &ServerEvent::GroupUserLeft { group_id, user_id })
                .await;
        }
        ClientRequest::TypingStart { recipient_id } => {
            state
                .sessions
                .send_to(
                    recipient_id,
                    ServerEvent::TypingStatus {
                        user_id,
                        is_typing: true,
                    },
                )
                .await;
        }
        ClientRequest::TypingStop { recipient_id } => {
            state
                .sessions
                .send_to(
                    recipient_id,
                    ServerEvent::TypingStatus {
                        user_id,
                        is_typing: false,
                    },
                )
                .await;
        }
        ClientRequest::GhostTyping { recipient_id, text } => {
            state
                .sessions
                .send_to(recipient_id, ServerEvent::GhostTyping { user_id, text })
                .await;
        }
        ClientRequest::AudioRecording {
            recipient_id,
            is_recording,
        } => {
            state
                .sessions
                .send_to(
                    recipient_id,
                    ServerEvent::AudioRecording {
                        user_id,
                        is_recording,
                    },
                )
                .await;
        }
        ClientRequest::AudioListening {
            message_id,
            is_listening,
            is_ended,
        } => {
            for targeted in
                server_api::audio_listening(&state.api, user_id, message_id, is_listening, is_ended)
                    .await?
            {
                state
                    .sessions
                    .send_to(targeted.target, targeted.event)
                    .await;
            }
        }
        ClientRequest::PresenceUpdate { status } => {
            let event = state.presence.set_status(user_id, status).await;
            state.sessions.broadcast_except(user_id, &event).await;
        }
        ClientRequest::PresenceRequest { user_ids } => {
            let entries = state.presence.snapshot(&user_ids).await;
            state
                .sessions
                .send_to(user_id, ServerEvent::PresenceResponse { entries })
                .await;
        }
    }
    Ok(())
}

/// Tear down a closed connection. A stale close (the user already
/// reconnected, so the registry holds a newer binding) must leave the
/// newer session's presence and rooms untouched.
pub(crate) async fn handle_disconnect(state: &AppState, user_id: UserId, connection_id: u64) {
    if !state.sessions.unregister(user_id, connection_id).await {
        debug!(user_id = user_id.0, connection_id, "superseded close, skipping cleanup");
        return;
    }

    let offline = state
        .presence
        .set_status(user_id, PresenceStatus::Offline)
        .await;
    state.sessions.broadcast_except(user_id, &offline).await;

    for group_id in state.rooms.leave_all(user_id).await {
        let members = state.rooms.members(group_id).await;
        state
            .sessions
            .send_to_many(&members, &ServerEvent::GroupUserLeft { group_id, user_id })
            .await;
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
