use super::*;
use shared::domain::MessageKind;
use shared::protocol::Reaction;

async fn setup() -> (ApiContext, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice", "Alice").await.expect("alice");
    let bob = storage.create_user("bob", "Bob").await.expect("bob");
    (ApiContext { storage }, alice, bob)
}

fn sent_message(outcome: &DirectSendOutcome) -> &MessagePayload {
    match &outcome.ack {
        ServerEvent::MessageSent { message, .. } => message,
        other => panic!("expected MessageSent ack, got {other:?}"),
    }
}

#[tokio::test]
async fn live_recipient_gets_push_and_delivered_ack() {
    let (ctx, alice, bob) = setup().await;
    let outcome = send_direct_message(&ctx, alice, bob, "n-1", &MessageDraft::text("hi"), true)
        .await
        .expect("send");

    assert_eq!(sent_message(&outcome).status, MessageStatus::Delivered);
    match outcome.push.expect("push for live recipient") {
        ServerEvent::MessageReceived { message } => {
            assert_eq!(message.content, "hi");
            assert_eq!(message.sender_id, alice);
        }
        other => panic!("unexpected push: {other:?}"),
    }
}

#[tokio::test]
async fn offline_recipient_leaves_status_sent_with_no_push() {
    let (ctx, alice, bob) = setup().await;
    let outcome = send_direct_message(&ctx, alice, bob, "n-2", &MessageDraft::text("hi"), false)
        .await
        .expect("send");

    assert_eq!(sent_message(&outcome).status, MessageStatus::Sent);
    assert!(outcome.push.is_none());
}

#[tokio::test]
async fn whitespace_only_content_is_rejected() {
    let (ctx, alice, bob) = setup().await;
    let err = send_direct_message(&ctx, alice, bob, "n-3", &MessageDraft::text("   "), true)
        .await
        .expect_err("should reject");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn attachment_send_reuses_existing_row() {
    let (ctx, alice, bob) = setup().await;
    // The upload endpoint persisted this row before the real-time announcement.
    let mut new = NewMessage::direct_text(alice, bob, "");
    new.kind = MessageKind::File;
    new.file_url = Some("/files/report.pdf".into());
    new.file_name = Some("report.pdf".into());
    let uploaded = ctx.storage.create_message(&new).await.expect("upload row");

    let mut draft = MessageDraft::text("");
    draft.kind = MessageKind::File;
    draft.existing_message_id = Some(uploaded.message_id);
    let outcome = send_direct_message(&ctx, alice, bob, "n-4", &draft, false)
        .await
        .expect("send");

    assert_eq!(sent_message(&outcome).message_id, uploaded.message_id);
}

#[tokio::test]
async fn announcing_someone_elses_upload_is_forbidden() {
    let (ctx, alice, bob) = setup().await;
    let uploaded = ctx
        .storage
        .create_message(&NewMessage::direct_text(alice, bob, "x"))
        .await
        .expect("row");

    let mut draft = MessageDraft::text("");
    draft.existing_message_id = Some(uploaded.message_id);
    let err = send_direct_message(&ctx, bob, alice, "n-5", &draft, false)
        .await
        .expect_err("should reject");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn group_send_requires_membership() {
    let (ctx, alice, bob) = setup().await;
    let group = ctx.storage.create_group("ops", alice).await.expect("group");

    let err = send_group_message(&ctx, bob, group, "n-6", &MessageDraft::text("hi"))
        .await
        .expect_err("non-member");
    assert_eq!(err.code, ErrorCode::Forbidden);

    ctx.storage.add_group_member(group, bob).await.expect("add");
    let outcome = send_group_message(&ctx, bob, group, "n-7", &MessageDraft::text("hi"))
        .await
        .expect("member send");
    match outcome.broadcast {
        ServerEvent::GroupMessageReceived { message } => {
            assert_eq!(message.group_id, Some(group));
        }
        other => panic!("unexpected broadcast: {other:?}"),
    }
}

#[tokio::test]
async fn mark_read_is_idempotent_and_targets_sender() {
    let (ctx, alice, bob) = setup().await;
    let outcome = send_direct_message(&ctx, alice, bob, "n-8", &MessageDraft::text("hi"), true)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    let receipt = mark_read(&ctx, bob, message_id, Utc::now())
        .await
        .expect("mark read")
        .expect("first read transitions");
    assert_eq!(receipt.target, alice);
    match receipt.event {
        ServerEvent::MessageStatus { status, .. } => assert_eq!(status, MessageStatus::Read),
        other => panic!("unexpected event: {other:?}"),
    }

    let second = mark_read(&ctx, bob, message_id, Utc::now())
        .await
        .expect("mark read twice");
    assert!(second.is_none(), "second read must be a silent no-op");
}

#[tokio::test]
async fn receipts_come_only_from_the_recipient() {
    let (ctx, alice, bob) = setup().await;
    let carol = ctx
        .storage
        .create_user("carol", "Carol")
        .await
        .expect("carol");
    let outcome = send_direct_message(&ctx, alice, bob, "n-15", &MessageDraft::text("hi"), false)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    let err = mark_delivered(&ctx, carol, message_id)
        .await
        .expect_err("third party delivery ack");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = mark_read(&ctx, carol, message_id, Utc::now())
        .await
        .expect_err("third party read");
    assert_eq!(err.code, ErrorCode::Forbidden);

    // The sender cannot read their own message either.
    let err = mark_read(&ctx, alice, message_id, Utc::now())
        .await
        .expect_err("sender read");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let row = ctx
        .storage
        .find_message(message_id)
        .await
        .expect("find")
        .expect("present");
    assert_eq!(row.status, MessageStatus::Sent);
}

#[tokio::test]
async fn reaction_toggle_is_its_own_inverse() {
    let (ctx, alice, bob) = setup().await;
    let outcome = send_direct_message(&ctx, alice, bob, "n-9", &MessageDraft::text("hi"), true)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    let events = react(&ctx, bob, message_id, "❤️").await.expect("react");
    assert_eq!(events.len(), 2);
    let targets: Vec<UserId> = events.iter().map(|e| e.target).collect();
    assert!(targets.contains(&alice) && targets.contains(&bob));
    match &events[0].event {
        ServerEvent::MessageReaction { reactions, .. } => {
            assert_eq!(
                reactions,
                &vec![Reaction {
                    message_id,
                    user_id: bob,
                    emoji: "❤️".into()
                }]
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let events = react(&ctx, bob, message_id, "❤️").await.expect("unreact");
    match &events[0].event {
        ServerEvent::MessageReaction { reactions, .. } => assert!(reactions.is_empty()),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn different_emoji_replaces_instead_of_stacking() {
    let (ctx, alice, bob) = setup().await;
    let outcome = send_direct_message(&ctx, alice, bob, "n-10", &MessageDraft::text("hi"), true)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    react(&ctx, bob, message_id, "❤️").await.expect("react");
    let events = react(&ctx, bob, message_id, "👍").await.expect("replace");
    match &events[0].event {
        ServerEvent::MessageReaction { reactions, .. } => {
            assert_eq!(reactions.len(), 1);
            assert_eq!(reactions[0].emoji, "👍");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn outsiders_cannot_react() {
    let (ctx, alice, bob) = setup().await;
    let carol = ctx
        .storage
        .create_user("carol", "Carol")
        .await
        .expect("carol");
    let outcome = send_direct_message(&ctx, alice, bob, "n-11", &MessageDraft::text("hi"), true)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    let err = react(&ctx, carol, message_id, "👀")
        .await
        .expect_err("outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn unsend_is_sender_only_and_clears_everything() {
    let (ctx, alice, bob) = setup().await;
    let mut draft = MessageDraft::text("oops");
    draft.duration = Some(2.5);
    let outcome = send_direct_message(&ctx, alice, bob, "n-12", &draft, true)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;
    react(&ctx, bob, message_id, "😂").await.expect("react");

    let err = unsend(&ctx, bob, message_id).await.expect_err("non-sender");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let events = unsend(&ctx, alice, message_id).await.expect("unsend");
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0].event,
        ServerEvent::MessageUnsent { message_id: id } if id == message_id
    ));

    let err = unsend(&ctx, alice, message_id)
        .await
        .expect_err("already unsent");
    assert_eq!(err.code, ErrorCode::Validation);

    // History shows the placeholder envelope: no content, no reactions.
    let page = history(&ctx, bob, alice, 10, None).await.expect("history");
    let placeholder = page
        .messages
        .iter()
        .find(|m| m.message_id == message_id)
        .expect("envelope survives");
    assert!(placeholder.content.is_empty());
    assert!(placeholder.reactions.is_empty());
    assert!(placeholder.duration.is_none());
    assert!(placeholder.deleted_at.is_some());
}

#[tokio::test]
async fn history_marks_inbound_unread_as_read() {
    let (ctx, alice, bob) = setup().await;
    for text in ["a", "b"] {
        send_direct_message(&ctx, alice, bob, "n", &MessageDraft::text(text), false)
            .await
            .expect("send");
    }

    let page = history(&ctx, bob, alice, 10, None).await.expect("history");
    assert_eq!(page.messages.len(), 2);
    assert!(page
        .messages
        .iter()
        .all(|m| m.status == MessageStatus::Read));
    assert_eq!(page.read_receipts.len(), 2);
    assert!(page.read_receipts.iter().all(|r| r.target == alice));

    // Refetch transitions nothing further.
    let page = history(&ctx, bob, alice, 10, None).await.expect("refetch");
    assert!(page.read_receipts.is_empty());
}

#[tokio::test]
async fn history_page_limit_bounds_the_read_side_effect() {
    let (ctx, alice, bob) = setup().await;
    let mut ids = Vec::new();
    for text in ["a", "b", "c"] {
        let outcome = send_direct_message(&ctx, alice, bob, "n", &MessageDraft::text(text), false)
            .await
            .expect("send");
        ids.push(sent_message(&outcome).message_id);
    }

    // Fetching only the newest message must not read the other two.
    let page = history(&ctx, bob, alice, 1, None).await.expect("history");
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].message_id, ids[2]);
    assert_eq!(page.read_receipts.len(), 1);

    for id in &ids[..2] {
        let row = ctx
            .storage
            .find_message(*id)
            .await
            .expect("find")
            .expect("present");
        assert_eq!(row.status, MessageStatus::Sent);
        assert!(row.read_at.is_none());
    }

    // Paging further back reads the rest, one page at a time.
    let older = history(&ctx, bob, alice, 10, Some(ids[2]))
        .await
        .expect("older page");
    assert_eq!(older.messages.len(), 2);
    assert_eq!(older.read_receipts.len(), 2);
}

#[tokio::test]
async fn unknown_history_cursor_is_a_validation_error() {
    let (ctx, alice, bob) = setup().await;
    send_direct_message(&ctx, alice, bob, "n", &MessageDraft::text("hi"), false)
        .await
        .expect("send");

    let err = history(&ctx, bob, alice, 10, Some(MessageId(9999)))
        .await
        .expect_err("bad cursor");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn history_never_marks_own_outbound_messages() {
    let (ctx, alice, bob) = setup().await;
    send_direct_message(&ctx, alice, bob, "n", &MessageDraft::text("hi"), false)
        .await
        .expect("send");

    let page = history(&ctx, alice, bob, 10, None).await.expect("history");
    assert!(page.read_receipts.is_empty());
    assert_eq!(page.messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn finished_playback_is_the_only_audio_read_trigger() {
    let (ctx, alice, bob) = setup().await;
    let mut draft = MessageDraft::text("");
    draft.kind = MessageKind::Audio;
    draft.file_url = Some("/files/note.ogg".into());
    draft.duration = Some(3.5);
    let outcome = send_direct_message(&ctx, alice, bob, "n-13", &draft, true)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    // Pausing midway forwards the signal but does not mark read.
    let events = audio_listening(&ctx, bob, message_id, true, false)
        .await
        .expect("progress");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].target, alice);
    let row = ctx
        .storage
        .find_message(message_id)
        .await
        .expect("find")
        .expect("present");
    assert_eq!(row.status, MessageStatus::Delivered);

    // Finishing playback marks read and emits the receipt.
    let events = audio_listening(&ctx, bob, message_id, false, true)
        .await
        .expect("ended");
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[1].event,
        ServerEvent::MessageStatus {
            status: MessageStatus::Read,
            ..
        }
    ));
}

#[tokio::test]
async fn finished_playback_leaves_non_audio_messages_alone() {
    let (ctx, alice, bob) = setup().await;
    let outcome = send_direct_message(&ctx, alice, bob, "n-16", &MessageDraft::text("hi"), true)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    let events = audio_listening(&ctx, bob, message_id, false, true)
        .await
        .expect("ended");
    assert_eq!(events.len(), 1, "no read receipt for a text row");

    let row = ctx
        .storage
        .find_message(message_id)
        .await
        .expect("find")
        .expect("present");
    assert_eq!(row.status, MessageStatus::Delivered);
}

#[tokio::test]
async fn waveform_backfill_targets_both_parties() {
    let (ctx, alice, bob) = setup().await;
    let mut draft = MessageDraft::text("");
    draft.kind = MessageKind::Audio;
    draft.file_url = Some("/files/note.ogg".into());
    let outcome = send_direct_message(&ctx, alice, bob, "n-14", &draft, false)
        .await
        .expect("send");
    let message_id = sent_message(&outcome).message_id;

    let events = set_waveform(&ctx, message_id, &[0.2, 0.8])
        .await
        .expect("backfill");
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0].event,
        ServerEvent::AudioWaveform { waveform, .. } if waveform == &vec![0.2, 0.8]
    ));
}
