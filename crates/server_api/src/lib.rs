use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupId, MessageId, MessageKind, MessageStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{MessageDraft, MessagePayload, ServerEvent},
};
use storage::{NewMessage, Storage, StoredMessage};
use tracing::warn;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Result of a direct send: the acknowledgement for the sender plus,
/// when the recipient had a live session, the push for them.
#[derive(Debug, Clone)]
pub struct DirectSendOutcome {
    pub ack: ServerEvent,
    pub push: Option<ServerEvent>,
    pub recipient_id: UserId,
}

#[derive(Debug, Clone)]
pub struct GroupSendOutcome {
    pub ack: ServerEvent,
    pub broadcast: ServerEvent,
    pub group_id: GroupId,
}

/// A status push addressed to one specific user's session.
#[derive(Debug, Clone)]
pub struct TargetedEvent {
    pub target: UserId,
    pub event: ServerEvent,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<MessagePayload>,
    /// One read receipt per message the fetch transitioned, addressed
    /// to the original sender.
    pub read_receipts: Vec<TargetedEvent>,
}

/// Assemble the wire payload for a stored row. Soft-deleted messages
/// keep their envelope but lose content, file fields, and reactions.
async fn message_payload(ctx: &ApiContext, stored: &StoredMessage) -> Result<MessagePayload, ApiError> {
    let deleted = stored.deleted_at.is_some();
    let reactions = if deleted {
        Vec::new()
    } else {
        ctx.storage
            .list_reactions(stored.message_id)
            .await
            .map_err(internal)?
    };

    Ok(MessagePayload {
        message_id: stored.message_id,
        sender_id: stored.sender_id,
        recipient_id: stored.recipient_id,
        group_id: stored.group_id,
        content: if deleted {
            String::new()
        } else {
            stored.content.clone()
        },
        kind: stored.kind,
        status: stored.status,
        created_at: stored.created_at,
        read_at: stored.read_at,
        file_url: if deleted { None } else { stored.file_url.clone() },
        file_name: if deleted { None } else { stored.file_name.clone() },
        file_size: if deleted { None } else { stored.file_size },
        file_type: if deleted { None } else { stored.file_type.clone() },
        waveform: if deleted { None } else { stored.waveform.clone() },
        duration: if deleted { None } else { stored.duration },
        reactions,
        reply_to: if deleted { None } else { stored.reply_to.clone() },
        deleted_at: stored.deleted_at,
    })
}

fn validate_draft(draft: &MessageDraft) -> Result<String, ApiError> {
    let content = draft.content.trim().to_string();
    if content.is_empty() && draft.file_url.is_none() && draft.existing_message_id.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message content cannot be empty",
        ));
    }
    Ok(content)
}

/// Resolve the durable row for a send: either look up the row the
/// upload endpoint already persisted, or create a fresh one with
/// status `sent`. The lookup path is what keeps attachment messages
/// from being double-counted.
async fn persist_draft(
    ctx: &ApiContext,
    sender_id: UserId,
    recipient_id: Option<UserId>,
    group_id: Option<GroupId>,
    draft: &MessageDraft,
) -> Result<StoredMessage, ApiError> {
    if let Some(existing_id) = draft.existing_message_id {
        let stored = ctx
            .storage
            .find_message(existing_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
        if stored.sender_id != sender_id {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "message belongs to another sender",
            ));
        }
        return Ok(stored);
    }

    let content = validate_draft(draft)?;
    ctx.storage
        .create_message(&NewMessage {
            sender_id,
            recipient_id,
            group_id,
            content,
            kind: draft.kind,
            status: MessageStatus::Sent,
            file_url: draft.file_url.clone(),
            file_name: draft.file_name.clone(),
            file_size: draft.file_size,
            file_type: draft.file_type.clone(),
            waveform: draft.waveform.clone(),
            duration: draft.duration,
            reply_to: draft.reply_to.clone(),
        })
        .await
        .map_err(internal)
}

/// Direct send. `recipient_is_live` reflects the Session Registry at
/// dispatch time: a live recipient advances the row to `delivered` and
/// produces a push; otherwise the row stays `sent` and delivery waits
/// for a later history fetch.
pub async fn send_direct_message(
    ctx: &ApiContext,
    sender_id: UserId,
    recipient_id: UserId,
    client_nonce: &str,
    draft: &MessageDraft,
    recipient_is_live: bool,
) -> Result<DirectSendOutcome, ApiError> {
    let mut stored = persist_draft(ctx, sender_id, Some(recipient_id), None, draft).await?;

    let push = if recipient_is_live {
        if let Some(updated) = ctx
            .storage
            .advance_message_status(stored.message_id, MessageStatus::Delivered, None)
            .await
            .map_err(internal)?
        {
            stored = updated;
        }
        Some(ServerEvent::MessageReceived {
            message: message_payload(ctx, &stored).await?,
        })
    } else {
        None
    };

    Ok(DirectSendOutcome {
        ack: ServerEvent::MessageSent {
            client_nonce: client_nonce.to_string(),
            message: message_payload(ctx, &stored).await?,
        },
        push,
        recipient_id,
    })
}

/// Group send. Membership is checked against the durable store here,
/// independently of the room-subscription check made at join time.
pub async fn send_group_message(
    ctx: &ApiContext,
    sender_id: UserId,
    group_id: GroupId,
    client_nonce: &str,
    draft: &MessageDraft,
) -> Result<GroupSendOutcome, ApiError> {
    let is_member = ctx
        .storage
        .is_group_member(group_id, sender_id)
        .await
        .map_err(internal)?;
    if !is_member {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "sender is not a member of this group",
        ));
    }

    let stored = persist_draft(ctx, sender_id, None, Some(group_id), draft).await?;
    let payload = message_payload(ctx, &stored).await?;

    Ok(GroupSendOutcome {
        ack: ServerEvent::MessageSent {
            client_nonce: client_nonce.to_string(),
            message: payload.clone(),
        },
        broadcast: ServerEvent::GroupMessageReceived { message: payload },
        group_id,
    })
}

pub async fn join_group(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
) -> Result<(), ApiError> {
    let is_member = ctx
        .storage
        .is_group_member(group_id, user_id)
        .await
        .map_err(internal)?;
    if !is_member {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a member of this group",
        ));
    }
    Ok(())
}

/// Idempotent `sent -> delivered` advance, accepted from the recipient
/// only. Yields a status push for the original sender when the row
/// actually transitioned.
pub async fn mark_delivered(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<Option<TargetedEvent>, ApiError> {
    let stored = require_message(ctx, message_id).await?;
    if stored.recipient_id != Some(user_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the recipient can acknowledge delivery",
        ));
    }
    let updated = ctx
        .storage
        .advance_message_status(message_id, MessageStatus::Delivered, None)
        .await
        .map_err(internal)?;
    Ok(updated.map(|stored| TargetedEvent {
        target: stored.sender_id,
        event: ServerEvent::MessageStatus {
            message_id: stored.message_id,
            status: stored.status,
            read_at: stored.read_at,
        },
    }))
}

/// Idempotent read transition, accepted from the recipient only so a
/// guessed id can never forge a receipt. Read receipts go to the
/// sender's session, never to third parties; an already-read message
/// is a no-op.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    read_at: DateTime<Utc>,
) -> Result<Option<TargetedEvent>, ApiError> {
    let stored = require_message(ctx, message_id).await?;
    if stored.recipient_id != Some(user_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the recipient can mark a message read",
        ));
    }
    let updated = ctx
        .storage
        .advance_message_status(message_id, MessageStatus::Read, Some(read_at))
        .await
        .map_err(internal)?;
    Ok(updated.map(|stored| TargetedEvent {
        target: stored.sender_id,
        event: ServerEvent::MessageStatus {
            message_id: stored.message_id,
            status: stored.status,
            read_at: stored.read_at,
        },
    }))
}

/// Reaction toggle: same emoji removes, a different emoji replaces,
/// absent creates. Returns the full recomputed reaction list addressed
/// to both parties so clients resync deterministically.
pub async fn react(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<Vec<TargetedEvent>, ApiError> {
    let stored = require_message(ctx, message_id).await?;
    if stored.deleted_at.is_some() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot react to an unsent message",
        ));
    }
    ensure_participant(ctx, &stored, user_id).await?;

    let existing = ctx
        .storage
        .find_reaction(message_id, user_id)
        .await
        .map_err(internal)?;
    match existing.as_deref() {
        Some(current) if current == emoji => {
            ctx.storage
                .delete_reaction(message_id, user_id)
                .await
                .map_err(internal)?;
        }
        _ => {
            ctx.storage
                .upsert_reaction(message_id, user_id, emoji)
                .await
                .map_err(internal)?;
        }
    }

    let reactions = ctx
        .storage
        .list_reactions(message_id)
        .await
        .map_err(internal)?;
    let event = ServerEvent::MessageReaction {
        message_id,
        reactions,
    };
    Ok(message_parties(&stored)
        .into_iter()
        .map(|target| TargetedEvent {
            target,
            event: event.clone(),
        })
        .collect())
}

/// Unsend: sender-only soft delete. Content and reactions are erased
/// for all readers; the storage row and its file columns survive.
pub async fn unsend(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<Vec<TargetedEvent>, ApiError> {
    let stored = require_message(ctx, message_id).await?;
    if stored.sender_id != user_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender can unsend a message",
        ));
    }
    if stored.deleted_at.is_some() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message is already unsent",
        ));
    }

    ctx.storage
        .mark_unsent(message_id, Utc::now())
        .await
        .map_err(internal)?;

    let event = ServerEvent::MessageUnsent { message_id };
    Ok(message_parties(&stored)
        .into_iter()
        .map(|target| TargetedEvent {
            target,
            event: event.clone(),
        })
        .collect())
}

/// History fetch between two users, newest first. As a side effect,
/// the unread messages in the returned page that are addressed to the
/// requester are batch marked read; messages outside the page stay
/// unread until they are actually fetched. The resulting receipts are
/// returned for the caller to push.
pub async fn history(
    ctx: &ApiContext,
    user_id: UserId,
    peer_id: UserId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<HistoryPage, ApiError> {
    if let Some(cursor) = before {
        ctx.storage
            .find_message(cursor)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::Validation, "unknown history cursor"))?;
    }
    let stored = ctx
        .storage
        .list_messages_between(user_id, peer_id, limit, before)
        .await
        .map_err(internal)?;

    let page_ids: Vec<MessageId> = stored
        .iter()
        .filter(|row| row.recipient_id == Some(user_id))
        .map(|row| row.message_id)
        .collect();
    let marked = ctx
        .storage
        .mark_messages_read(user_id, &page_ids, Utc::now())
        .await
        .map_err(internal)?;
    let marked: std::collections::HashSet<i64> = marked.into_iter().map(|id| id.0).collect();

    let mut messages = Vec::with_capacity(stored.len());
    let mut read_receipts = Vec::new();
    for mut row in stored {
        if marked.contains(&row.message_id.0) {
            row.status = MessageStatus::Read;
            read_receipts.push(TargetedEvent {
                target: row.sender_id,
                event: ServerEvent::MessageStatus {
                    message_id: row.message_id,
                    status: MessageStatus::Read,
                    read_at: row.read_at.or_else(|| Some(Utc::now())),
                },
            });
        }
        messages.push(message_payload(ctx, &row).await?);
    }

    Ok(HistoryPage {
        messages,
        read_receipts,
    })
}

/// Playback progress from the recipient of a voice message, forwarded
/// to the sender. A finished playback (`is_ended`) is the only signal
/// that marks an audio message read.
pub async fn audio_listening(
    ctx: &ApiContext,
    listener_id: UserId,
    message_id: MessageId,
    is_listening: bool,
    is_ended: bool,
) -> Result<Vec<TargetedEvent>, ApiError> {
    let stored = require_message(ctx, message_id).await?;
    ensure_participant(ctx, &stored, listener_id).await?;

    let mut events = vec![TargetedEvent {
        target: stored.sender_id,
        event: ServerEvent::AudioListening {
            user_id: listener_id,
            message_id,
            is_listening,
            is_ended,
        },
    }];

    // Finished playback reads the message, but only for actual voice
    // messages and only when the listener is the recipient.
    if is_ended
        && stored.kind == MessageKind::Audio
        && stored.recipient_id == Some(listener_id)
    {
        if let Some(receipt) = mark_read(ctx, listener_id, message_id, Utc::now()).await? {
            events.push(receipt);
        }
    }

    Ok(events)
}

/// Waveform backfill for an audio message, produced asynchronously by
/// the upload pipeline. Both parties get the push so either client can
/// render the waveform without a refetch.
pub async fn set_waveform(
    ctx: &ApiContext,
    message_id: MessageId,
    waveform: &[f32],
) -> Result<Vec<TargetedEvent>, ApiError> {
    let updated = ctx
        .storage
        .set_waveform(message_id, waveform)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;

    let event = ServerEvent::AudioWaveform {
        message_id,
        waveform: waveform.to_vec(),
    };
    Ok(message_parties(&updated)
        .into_iter()
        .map(|target| TargetedEvent {
            target,
            event: event.clone(),
        })
        .collect())
}

async fn require_message(
    ctx: &ApiContext,
    message_id: MessageId,
) -> Result<StoredMessage, ApiError> {
    ctx.storage
        .find_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))
}

/// The sessions interested in a message-level mutation: sender and
/// direct recipient. Group messages address the sender only here; room
/// broadcasts are the server loop's concern.
fn message_parties(stored: &StoredMessage) -> Vec<UserId> {
    let mut parties = vec![stored.sender_id];
    if let Some(recipient) = stored.recipient_id {
        if recipient != stored.sender_id {
            parties.push(recipient);
        }
    }
    parties
}

async fn ensure_participant(
    ctx: &ApiContext,
    stored: &StoredMessage,
    user_id: UserId,
) -> Result<(), ApiError> {
    if stored.sender_id == user_id || stored.recipient_id == Some(user_id) {
        return Ok(());
    }
    if let Some(group_id) = stored.group_id {
        let is_member = ctx
            .storage
            .is_group_member(group_id, user_id)
            .await
            .map_err(internal)?;
        if is_member {
            return Ok(());
        }
    }
    Err(ApiError::new(
        ErrorCode::Forbidden,
        "user is not a participant of this conversation",
    ))
}

fn internal(err: anyhow::Error) -> ApiError {
    warn!(%err, "durable store call failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
