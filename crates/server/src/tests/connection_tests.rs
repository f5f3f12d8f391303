use std::sync::Arc;

use server_api::ApiContext;
use shared::{
    domain::{MessageStatus, PresenceStatus, UserId},
    protocol::{ClientRequest, MessageDraft, ServerEvent},
};
use storage::Storage;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    app_state::AppState,
    auth::AuthKeys,
    registry::{PresenceDirectory, RoomRegistry, SessionRegistry},
};

use super::{dispatch, handle_disconnect};

async fn setup() -> (AppState, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", "Alice").await.expect("alice");
    let bob = storage.create_user("bob", "Bob").await.expect("bob");
    let state = AppState {
        api: ApiContext { storage },
        auth: Arc::new(AuthKeys::new("test-secret", 60)),
        sessions: Arc::new(SessionRegistry::new()),
        presence: Arc::new(PresenceDirectory::new()),
        rooms: Arc::new(RoomRegistry::new()),
    };
    (state, alice, bob)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn direct_send_pushes_to_live_recipient_and_acks_delivered() {
    let (state, alice, bob) = setup().await;
    let (_a, mut alice_rx) = state.sessions.register(alice).await;
    let (_b, mut bob_rx) = state.sessions.register(bob).await;

    dispatch(
        &state,
        alice,
        ClientRequest::SendMessage {
            client_nonce: "n-1".into(),
            recipient_id: bob,
            draft: MessageDraft::text("hi"),
        },
    )
    .await;

    let bob_events = drain(&mut bob_rx);
    assert!(matches!(
        &bob_events[..],
        [ServerEvent::MessageReceived { message }] if message.content == "hi"
    ));

    let alice_events = drain(&mut alice_rx);
    match &alice_events[..] {
        [ServerEvent::MessageSent {
            client_nonce,
            message,
        }] => {
            assert_eq!(client_nonce, "n-1");
            assert_eq!(message.status, MessageStatus::Delivered);
        }
        other => panic!("unexpected ack: {other:?}"),
    }
}

#[tokio::test]
async fn direct_send_to_offline_recipient_acks_sent_without_push() {
    let (state, alice, bob) = setup().await;
    let (_a, mut alice_rx) = state.sessions.register(alice).await;

    dispatch(
        &state,
        alice,
        ClientRequest::SendMessage {
            client_nonce: "n-2".into(),
            recipient_id: bob,
            draft: MessageDraft::text("hi"),
        },
    )
    .await;

    match &drain(&mut alice_rx)[..] {
        [ServerEvent::MessageSent { message, .. }] => {
            assert_eq!(message.status, MessageStatus::Sent);
        }
        other => panic!("unexpected ack: {other:?}"),
    }
}

#[tokio::test]
async fn request_errors_reach_only_the_caller() {
    let (state, alice, bob) = setup().await;
    let (_a, mut alice_rx) = state.sessions.register(alice).await;
    let (_b, mut bob_rx) = state.sessions.register(bob).await;

    dispatch(
        &state,
        alice,
        ClientRequest::SendMessage {
            client_nonce: "n-3".into(),
            recipient_id: bob,
            draft: MessageDraft::text("   "),
        },
    )
    .await;

    assert!(matches!(
        &drain(&mut alice_rx)[..],
        [ServerEvent::SendFailed { client_nonce, .. }] if client_nonce == "n-3"
    ));
    assert!(drain(&mut bob_rx).is_empty());

    // Non-send requests fall back to the uncorrelated error event.
    dispatch(
        &state,
        alice,
        ClientRequest::Unsend {
            message_id: shared::domain::MessageId(999),
        },
    )
    .await;
    assert!(matches!(&drain(&mut alice_rx)[..], [ServerEvent::Error(_)]));
}

#[tokio::test]
async fn typing_signals_are_forwarded_to_the_recipient_only() {
    let (state, alice, bob) = setup().await;
    let (_a, mut alice_rx) = state.sessions.register(alice).await;
    let (_b, mut bob_rx) = state.sessions.register(bob).await;

    dispatch(&state, alice, ClientRequest::TypingStart { recipient_id: bob }).await;
    dispatch(
        &state,
        alice,
        ClientRequest::GhostTyping {
            recipient_id: bob,
            text: "draft in prog".into(),
        },
    )
    .await;
    dispatch(&state, alice, ClientRequest::TypingStop { recipient_id: bob }).await;

    let events = drain(&mut bob_rx);
    assert!(matches!(
        events[0],
        ServerEvent::TypingStatus {
            user_id,
            is_typing: true
        } if user_id == alice
    ));
    assert!(matches!(
        &events[1],
        ServerEvent::GhostTyping { text, .. } if text == "draft in prog"
    ));
    assert!(matches!(
        events[2],
        ServerEvent::TypingStatus {
            is_typing: false,
            ..
        }
    ));
    assert!(drain(&mut alice_rx).is_empty());
}

#[tokio::test]
async fn presence_update_broadcasts_and_poll_answers_the_caller() {
    let (state, alice, bob) = setup().await;
    let (_a, mut alice_rx) = state.sessions.register(alice).await;
    let (_b, mut bob_rx) = state.sessions.register(bob).await;

    dispatch(
        &state,
        alice,
        ClientRequest::PresenceUpdate {
            status: PresenceStatus::Away,
        },
    )
    .await;
    assert!(matches!(
        &drain(&mut bob_rx)[..],
        [ServerEvent::UserStatus {
            status: PresenceStatus::Away,
            ..
        }]
    ));
    assert!(drain(&mut alice_rx).is_empty());

    dispatch(
        &state,
        bob,
        ClientRequest::PresenceRequest {
            user_ids: vec![alice],
        },
    )
    .await;
    match &drain(&mut bob_rx)[..] {
        [ServerEvent::PresenceResponse { entries }] => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].status, PresenceStatus::Away);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn group_room_join_send_and_leave_flow() {
    let (state, alice, bob) = setup().await;
    let group = state
        .api
        .storage
        .create_group("ops", alice)
        .await
        .expect("group");
    state
        .api
        .storage
        .add_group_member(group, bob)
        .await
        .expect("add");

    let (_a, mut alice_rx) = state.sessions.register(alice).await;
    let (_b, mut bob_rx) = state.sessions.register(bob).await;

    dispatch(&state, alice, ClientRequest::JoinGroup { group_id: group }).await;
    assert!(drain(&mut alice_rx).is_empty(), "empty room, nobody to notify");

    dispatch(&state, bob, ClientRequest::JoinGroup { group_id: group }).await;
    assert!(matches!(
        &drain(&mut alice_rx)[..],
        [ServerEvent::GroupUserJoined { user_id, .. }] if *user_id == bob
    ));

    dispatch(
        &state,
        bob,
        ClientRequest::SendGroupMessage {
            client_nonce: "n-4".into(),
            group_id: group,
            draft: MessageDraft::text("standup in 5"),
        },
    )
    .await;
    assert!(matches!(
        &drain(&mut alice_rx)[..],
        [ServerEvent::GroupMessageReceived { message }] if message.content == "standup in 5"
    ));
    assert!(matches!(
        &drain(&mut bob_rx)[..],
        [ServerEvent::GroupUserJoined { .. }, ServerEvent::MessageSent { .. }]
    ));

    dispatch(&state, bob, ClientRequest::LeaveGroup { group_id: group }).await;
    assert!(matches!(
        &drain(&mut alice_rx)[..],
        [ServerEvent::GroupUserLeft { user_id, .. }] if *user_id == bob
    ));
}

#[tokio::test]
async fn disconnect_cleanup_broadcasts_offline_and_room_exits() {
    let (state, alice, bob) = setup().await;
    let group = state
        .api
        .storage
        .create_group("ops", alice)
        .await
        .expect("group");
    state
        .api
        .storage
        .add_group_member(group, bob)
        .await
        .expect("add");

    let (alice_conn, _alice_rx) = state.sessions.register(alice).await;
    let (_b, mut bob_rx) = state.sessions.register(bob).await;
    state.rooms.join(group, alice).await;
    state.rooms.join(group, bob).await;

    handle_disconnect(&state, alice, alice_conn).await;

    let events = drain(&mut bob_rx);
    assert!(matches!(
        events[0],
        ServerEvent::UserStatus {
            status: PresenceStatus::Offline,
            ..
        }
    ));
    assert!(matches!(
        events[1],
        ServerEvent::GroupUserLeft { user_id, .. } if user_id == alice
    ));
    assert!(!state.sessions.is_live(alice).await);
    assert!(state.rooms.members(group).await.contains(&bob));
}

#[tokio::test]
async fn stale_disconnect_leaves_the_newer_session_intact() {
    let (state, alice, bob) = setup().await;
    let (stale_conn, _rx1) = state.sessions.register(alice).await;
    let (_fresh_conn, _rx2) = state.sessions.register(alice).await;
    let (_b, mut bob_rx) = state.sessions.register(bob).await;

    handle_disconnect(&state, alice, stale_conn).await;

    assert!(state.sessions.is_live(alice).await);
    assert!(drain(&mut bob_rx).is_empty());
}
