use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{GroupId, MessageId, MessageStatus, PresenceStatus, UserId, UserIdentity},
    protocol::{ClientRequest, MessageDraft, MessagePayload, PresenceEntry, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Client-side clocks: indicator expiry, draft-mirroring throttle, and
/// the presence poll cadence. Tests shrink these to milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct ClientTimings {
    pub typing_signal_ttl: Duration,
    pub recording_signal_ttl: Duration,
    pub ghost_typing_throttle: Duration,
    pub presence_poll_interval: Duration,
}

impl Default for ClientTimings {
    fn default() -> Self {
        Self {
            typing_signal_ttl: Duration::from_secs(3),
            recording_signal_ttl: Duration::from_secs(10),
            ghost_typing_throttle: Duration::from_millis(100),
            presence_poll_interval: Duration::from_secs(10),
        }
    }
}

/// Client-side identifier for an optimistic message that has no server
/// id yet. Correlated with the server row via the client nonce once the
/// acknowledgement arrives.
pub type LocalMessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendTarget {
    Direct(UserId),
    Group(GroupId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Direct(UserId),
    Group(GroupId),
}

/// Ephemeral peer signal rendered in the conversation header. Each kind
/// expires on its own clock unless refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Typing,
    GhostTyping,
    Recording,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub local_id: LocalMessageId,
    pub client_nonce: String,
    pub target: SendTarget,
    pub draft: MessageDraft,
    pub status: MessageStatus,
}

#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    pub last_message: Option<MessagePayload>,
    pub unread_count: u32,
}

impl ConversationSummary {
    fn new(key: ConversationKey) -> Self {
        Self {
            key,
            last_message: None,
            unread_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Raw pass-through of everything the server pushed.
    Server(ServerEvent),
    MessageQueued {
        local_id: LocalMessageId,
    },
    MessageSending {
        local_id: LocalMessageId,
    },
    MessageAcknowledged {
        local_id: LocalMessageId,
        message: MessagePayload,
    },
    MessageFailed {
        local_id: LocalMessageId,
        reason: String,
    },
    SignalExpired {
        user_id: UserId,
        kind: SignalKind,
    },
    ConversationsUpdated,
    Disconnected,
}

#[derive(Debug, Serialize)]
struct LoginRequest {
    username: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: UserId,
    token: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    messages: Vec<MessagePayload>,
}

struct ClientState {
    server_url: Option<String>,
    user_id: Option<UserId>,
    token: Option<String>,
    connected: bool,
    manual_offline: bool,
    next_local_id: LocalMessageId,
    ws_outbound: Option<mpsc::UnboundedSender<ClientRequest>>,
    /// Sent but not yet acknowledged, keyed by client nonce.
    in_flight: HashMap<String, OutgoingMessage>,
    /// Ordered queue of sends composed while offline.
    outbox: VecDeque<OutgoingMessage>,
    conversations: HashMap<ConversationKey, ConversationSummary>,
    active_conversation: Option<ConversationKey>,
    presence: HashMap<UserId, PresenceEntry>,
    signal_timers: HashMap<(UserId, SignalKind), JoinHandle<()>>,
    /// Latest draft text per recipient awaiting its throttled flush.
    ghost_typing_pending: HashMap<UserId, String>,
    presence_poller: Option<JoinHandle<()>>,
}

/// Stateful client over the realtime protocol: optimistic sends, an
/// offline outbox, conversation summaries, and a presence cache kept
/// consistent between pushed updates and authoritative polls.
pub struct ChatClient {
    http: Client,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
    timings: ClientTimings,
}

impl ChatClient {
    pub fn new() -> Arc<Self> {
        Self::new_with_timings(ClientTimings::default())
    }

    pub fn new_with_timings(timings: ClientTimings) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            inner: Mutex::new(ClientState {
                server_url: None,
                user_id: None,
                token: None,
                connected: false,
                manual_offline: false,
                next_local_id: 0,
                ws_outbound: None,
                in_flight: HashMap::new(),
                outbox: VecDeque::new(),
                conversations: HashMap::new(),
                active_conversation: None,
                presence: HashMap::new(),
                signal_timers: HashMap::new(),
                ghost_typing_pending: HashMap::new(),
                presence_poller: None,
            }),
            events,
            timings,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn login(
        &self,
        server_url: &str,
        username: &str,
        display_name: &str,
    ) -> Result<UserId> {
        let response = self
            .http
            .post(format!("{server_url}/login"))
            .json(&LoginRequest {
                username: username.to_string(),
                display_name: display_name.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let body: LoginResponse = response.json().await?;

        let mut guard = self.inner.lock().await;
        guard.server_url = Some(server_url.trim_end_matches('/').to_string());
        guard.user_id = Some(body.user_id);
        guard.token = Some(body.token);
        Ok(body.user_id)
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner.lock().await.user_id
    }

    /// Open the realtime session and drain anything queued while
    /// offline. The reader task owns event fan-in until the socket
    /// closes.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (server_url, token) = {
            let guard = self.inner.lock().await;
            (
                guard
                    .server_url
                    .clone()
                    .ok_or_else(|| anyhow!("login before connecting"))?,
                guard
                    .token
                    .clone()
                    .ok_or_else(|| anyhow!("login before connecting"))?,
            )
        };

        let ws_url = format!("{}/ws?token={token}", http_to_ws(&server_url)?);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let Ok(text) = serde_json::to_string(&request) else {
                    continue;
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => client.handle_server_event(event).await,
                        Err(err) => debug!(%err, "ignoring unparseable server frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            client.handle_ws_closed().await;
        });

        {
            let mut guard = self.inner.lock().await;
            guard.connected = true;
            guard.ws_outbound = Some(outbound_tx);
            let poller = self.spawn_presence_poller();
            if let Some(previous) = guard.presence_poller.replace(poller) {
                previous.abort();
            }
        }
        self.drain_outbox().await;
        Ok(())
    }

    /// Periodic drift correction: pushed presence can be missed around
    /// reconnects, so every peer in the cache is re-polled on an
    /// interval for as long as the session is up.
    fn spawn_presence_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.timings.presence_poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (tx, user_ids, paused) = {
                    let guard = client.inner.lock().await;
                    (
                        guard.ws_outbound.clone(),
                        guard.presence.keys().copied().collect::<Vec<_>>(),
                        guard.manual_offline,
                    )
                };
                let Some(tx) = tx else { break };
                if paused || user_ids.is_empty() {
                    continue;
                }
                if tx
                    .send(ClientRequest::PresenceRequest { user_ids })
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    /// Simulated airplane mode: composed messages queue locally until
    /// the flag is lifted, even while the socket stays open.
    pub async fn set_manual_offline(&self, offline: bool) {
        {
            let mut guard = self.inner.lock().await;
            guard.manual_offline = offline;
        }
        if !offline {
            self.drain_outbox().await;
        }
    }

    pub async fn send_message(
        &self,
        recipient_id: UserId,
        draft: MessageDraft,
    ) -> Result<LocalMessageId> {
        self.enqueue_or_send(SendTarget::Direct(recipient_id), draft)
            .await
    }

    pub async fn send_group_message(
        &self,
        group_id: GroupId,
        draft: MessageDraft,
    ) -> Result<LocalMessageId> {
        self.enqueue_or_send(SendTarget::Group(group_id), draft)
            .await
    }

    async fn enqueue_or_send(
        &self,
        target: SendTarget,
        draft: MessageDraft,
    ) -> Result<LocalMessageId> {
        let mut guard = self.inner.lock().await;
        guard.next_local_id += 1;
        let mut message = OutgoingMessage {
            local_id: guard.next_local_id,
            client_nonce: uuid::Uuid::new_v4().to_string(),
            target,
            draft,
            status: MessageStatus::Queued,
        };
        let local_id = message.local_id;

        let online = guard.connected && !guard.manual_offline;
        let tx = guard.ws_outbound.clone();
        match (online, tx) {
            (true, Some(tx)) => {
                message.status = MessageStatus::Sending;
                let request = outbound_request(&message);
                let nonce = message.client_nonce.clone();
                guard.in_flight.insert(nonce.clone(), message);
                drop(guard);

                if tx.send(request).is_err() {
                    // Socket closed under us; the message falls back to
                    // the queue without losing its position.
                    let mut guard = self.inner.lock().await;
                    if let Some(mut message) = guard.in_flight.remove(&nonce) {
                        message.status = MessageStatus::Queued;
                        guard.outbox.push_back(message);
                    }
                    drop(guard);
                    let _ = self.events.send(ClientEvent::MessageQueued { local_id });
                } else {
                    let _ = self.events.send(ClientEvent::MessageSending { local_id });
                }
            }
            _ => {
                guard.outbox.push_back(message);
                drop(guard);
                let _ = self.events.send(ClientEvent::MessageQueued { local_id });
            }
        }
        Ok(local_id)
    }

    /// Flush the offline queue in compose order. Stops at the first
    /// transport failure; the failed entry keeps its place at the head.
    pub async fn drain_outbox(&self) {
        loop {
            let step = {
                let mut guard = self.inner.lock().await;
                if !guard.connected || guard.manual_offline {
                    return;
                }
                let Some(tx) = guard.ws_outbound.clone() else {
                    return;
                };
                let Some(mut message) = guard.outbox.pop_front() else {
                    return;
                };
                message.status = MessageStatus::Sending;
                let request = outbound_request(&message);
                let nonce = message.client_nonce.clone();
                let local_id = message.local_id;
                guard.in_flight.insert(nonce.clone(), message);
                (tx, request, nonce, local_id)
            };

            let (tx, request, nonce, local_id) = step;
            if tx.send(request).is_err() {
                let mut guard = self.inner.lock().await;
                if let Some(mut message) = guard.in_flight.remove(&nonce) {
                    message.status = MessageStatus::Queued;
                    guard.outbox.push_front(message);
                }
                guard.connected = false;
                guard.ws_outbound = None;
                drop(guard);
                let _ = self.events.send(ClientEvent::Disconnected);
                return;
            }
            let _ = self.events.send(ClientEvent::MessageSending { local_id });
        }
    }

    pub async fn queued_messages(&self) -> Vec<OutgoingMessage> {
        self.inner.lock().await.outbox.iter().cloned().collect()
    }

    async fn handle_ws_closed(&self) {
        let mut guard = self.inner.lock().await;
        guard.connected = false;
        guard.ws_outbound = None;
        guard.ghost_typing_pending.clear();
        if let Some(poller) = guard.presence_poller.take() {
            poller.abort();
        }

        // Unacknowledged sends return to the queue head in send order.
        let mut stranded: Vec<OutgoingMessage> = guard.in_flight.drain().map(|(_, m)| m).collect();
        stranded.sort_by_key(|m| m.local_id);
        for mut message in stranded.into_iter().rev() {
            message.status = MessageStatus::Queued;
            guard.outbox.push_front(message);
        }
        drop(guard);
        warn!("realtime session closed");
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match &event {
            ServerEvent::MessageSent {
                client_nonce,
                message,
            } => {
                let resolved = {
                    let mut guard = self.inner.lock().await;
                    guard.in_flight.remove(client_nonce).map(|m| m.local_id)
                };
                self.record_outbound(message).await;
                if let Some(local_id) = resolved {
                    let _ = self.events.send(ClientEvent::MessageAcknowledged {
                        local_id,
                        message: message.clone(),
                    });
                }
            }
            ServerEvent::SendFailed {
                client_nonce,
                error,
            } => {
                // A rejected send is terminal for that message; later
                // queue entries are unaffected.
                let resolved = {
                    let mut guard = self.inner.lock().await;
                    guard.in_flight.remove(client_nonce).map(|m| m.local_id)
                };
                if let Some(local_id) = resolved {
                    let _ = self.events.send(ClientEvent::MessageFailed {
                        local_id,
                        reason: error.message.clone(),
                    });
                }
            }
            ServerEvent::MessageReceived { message }
            | ServerEvent::GroupMessageReceived { message } => {
                self.record_inbound(message).await;
            }
            ServerEvent::MessageStatus {
                message_id,
                status,
                read_at,
            } => {
                let mut guard = self.inner.lock().await;
                for summary in guard.conversations.values_mut() {
                    if let Some(last) = summary.last_message.as_mut() {
                        if last.message_id == *message_id {
                            last.status = *status;
                            last.read_at = *read_at;
                        }
                    }
                }
                drop(guard);
                let _ = self.events.send(ClientEvent::ConversationsUpdated);
            }
            ServerEvent::MessageUnsent { message_id } => {
                let mut guard = self.inner.lock().await;
                for summary in guard.conversations.values_mut() {
                    if let Some(last) = summary.last_message.as_mut() {
                        if last.message_id == *message_id {
                            last.content.clear();
                            last.reactions.clear();
                            last.file_url = None;
                            last.waveform = None;
                        }
                    }
                }
                drop(guard);
                let _ = self.events.send(ClientEvent::ConversationsUpdated);
            }
            ServerEvent::TypingStatus { user_id, is_typing } => {
                if *is_typing {
                    self.arm_signal_timer(
                        *user_id,
                        SignalKind::Typing,
                        self.timings.typing_signal_ttl,
                    )
                    .await;
                } else {
                    self.clear_signal_timer(*user_id, SignalKind::Typing).await;
                }
            }
            // Empty mirrored text means the peer stopped typing.
            ServerEvent::GhostTyping { user_id, text } => {
                if text.is_empty() {
                    self.clear_signal_timer(*user_id, SignalKind::GhostTyping)
                        .await;
                } else {
                    self.arm_signal_timer(
                        *user_id,
                        SignalKind::GhostTyping,
                        self.timings.typing_signal_ttl,
                    )
                    .await;
                }
            }
            ServerEvent::AudioRecording {
                user_id,
                is_recording,
            } => {
                if *is_recording {
                    self.arm_signal_timer(
                        *user_id,
                        SignalKind::Recording,
                        self.timings.recording_signal_ttl,
                    )
                    .await;
                } else {
                    self.clear_signal_timer(*user_id, SignalKind::Recording)
                        .await;
                }
            }
            ServerEvent::UserStatus {
                user_id,
                status,
                timestamp,
            } => {
                let mut guard = self.inner.lock().await;
                guard.presence.insert(
                    *user_id,
                    PresenceEntry {
                        user_id: *user_id,
                        status: *status,
                        last_seen: Some(*timestamp),
                    },
                );
            }
            // Polls and the connect snapshot are authoritative for the
            // users they cover, superseding any pushed state.
            ServerEvent::PresenceSnapshot { entries }
            | ServerEvent::PresenceResponse { entries } => {
                let mut guard = self.inner.lock().await;
                for entry in entries {
                    guard.presence.insert(entry.user_id, entry.clone());
                }
            }
            _ => {}
        }
        let _ = self.events.send(ClientEvent::Server(event));
    }

    async fn record_inbound(&self, message: &MessagePayload) {
        let key = match message.group_id {
            Some(group_id) => ConversationKey::Group(group_id),
            None => ConversationKey::Direct(message.sender_id),
        };

        let mark_read_over = {
            let mut guard = self.inner.lock().await;
            let active = guard.active_conversation == Some(key);
            let summary = guard
                .conversations
                .entry(key)
                .or_insert_with(|| ConversationSummary::new(key));
            summary.last_message = Some(message.clone());
            if !active {
                summary.unread_count += 1;
            }
            if active && guard.connected && !guard.manual_offline {
                guard.ws_outbound.clone()
            } else {
                None
            }
        };

        // Reading happens implicitly when the conversation is on screen.
        if let Some(tx) = mark_read_over {
            let _ = tx.send(ClientRequest::MarkRead {
                message_id: message.message_id,
            });
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
    }

    async fn record_outbound(&self, message: &MessagePayload) {
        let key = match (message.group_id, message.recipient_id) {
            (Some(group_id), _) => ConversationKey::Group(group_id),
            (None, Some(recipient_id)) => ConversationKey::Direct(recipient_id),
            (None, None) => return,
        };
        let mut guard = self.inner.lock().await;
        let summary = guard
            .conversations
            .entry(key)
            .or_insert_with(|| ConversationSummary::new(key));
        summary.last_message = Some(message.clone());
        drop(guard);
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
    }

    /// Bring a conversation on screen: its unread count resets and
    /// subsequent inbound messages are read immediately.
    pub async fn set_active_conversation(&self, key: Option<ConversationKey>) {
        let mut guard = self.inner.lock().await;
        guard.active_conversation = key;
        if let Some(key) = key {
            if let Some(summary) = guard.conversations.get_mut(&key) {
                summary.unread_count = 0;
            }
        }
        drop(guard);
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
    }

    /// Summaries newest-activity-first, for a conversation list pane.
    pub async fn conversation_summaries(&self) -> Vec<ConversationSummary> {
        let guard = self.inner.lock().await;
        let mut summaries: Vec<ConversationSummary> =
            guard.conversations.values().cloned().collect();
        summaries.sort_by(|a, b| {
            let a_at = a.last_message.as_ref().map(|m| m.created_at);
            let b_at = b.last_message.as_ref().map(|m| m.created_at);
            b_at.cmp(&a_at)
        });
        summaries
    }

    pub async fn presence_for(&self, user_id: UserId) -> Option<PresenceEntry> {
        self.inner.lock().await.presence.get(&user_id).cloned()
    }

    async fn arm_signal_timer(self: &Arc<Self>, user_id: UserId, kind: SignalKind, ttl: Duration) {
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            {
                let mut guard = client.inner.lock().await;
                guard.signal_timers.remove(&(user_id, kind));
            }
            let _ = client.events.send(ClientEvent::SignalExpired { user_id, kind });
        });

        let mut guard = self.inner.lock().await;
        if let Some(previous) = guard.signal_timers.insert((user_id, kind), handle) {
            previous.abort();
        }
    }

    async fn clear_signal_timer(&self, user_id: UserId, kind: SignalKind) {
        let mut guard = self.inner.lock().await;
        if let Some(handle) = guard.signal_timers.remove(&(user_id, kind)) {
            handle.abort();
        }
    }

    async fn send_request(&self, request: ClientRequest) -> Result<()> {
        let tx = {
            let guard = self.inner.lock().await;
            if guard.manual_offline {
                return Err(anyhow!("client is in manual offline mode"));
            }
            guard
                .ws_outbound
                .clone()
                .ok_or_else(|| anyhow!("not connected"))?
        };
        tx.send(request).map_err(|_| anyhow!("connection closed"))
    }

    pub async fn mark_delivered(&self, message_id: MessageId) -> Result<()> {
        self.send_request(ClientRequest::MarkDelivered { message_id })
            .await
    }

    pub async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        self.send_request(ClientRequest::MarkRead { message_id })
            .await
    }

    pub async fn react(&self, message_id: MessageId, emoji: &str) -> Result<()> {
        self.send_request(ClientRequest::React {
            message_id,
            emoji: emoji.to_string(),
        })
        .await
    }

    pub async fn unsend(&self, message_id: MessageId) -> Result<()> {
        self.send_request(ClientRequest::Unsend { message_id })
            .await
    }

    pub async fn join_group(&self, group_id: GroupId) -> Result<()> {
        self.send_request(ClientRequest::JoinGroup { group_id })
            .await
    }

    pub async fn leave_group(&self, group_id: GroupId) -> Result<()> {
        self.send_request(ClientRequest::LeaveGroup { group_id })
            .await
    }

    pub async fn typing_start(&self, recipient_id: UserId) -> Result<()> {
        self.send_request(ClientRequest::TypingStart { recipient_id })
            .await
    }

    pub async fn typing_stop(&self, recipient_id: UserId) -> Result<()> {
        self.send_request(ClientRequest::TypingStop { recipient_id })
            .await
    }

    /// Mirror in-progress draft text to the recipient. Emission is
    /// coalesced per recipient: keystrokes within one throttle window
    /// collapse into a single frame carrying the latest text.
    pub async fn ghost_typing(self: &Arc<Self>, recipient_id: UserId, text: &str) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            if guard.manual_offline {
                return Err(anyhow!("client is in manual offline mode"));
            }
            if guard.ws_outbound.is_none() {
                return Err(anyhow!("not connected"));
            }
            if let Some(pending) = guard.ghost_typing_pending.get_mut(&recipient_id) {
                // A flush is already scheduled; it picks up this text.
                *pending = text.to_string();
                return Ok(());
            }
            guard
                .ghost_typing_pending
                .insert(recipient_id, text.to_string());
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(client.timings.ghost_typing_throttle).await;
            let (tx, text) = {
                let mut guard = client.inner.lock().await;
                (
                    guard.ws_outbound.clone(),
                    guard.ghost_typing_pending.remove(&recipient_id),
                )
            };
            if let (Some(tx), Some(text)) = (tx, text) {
                let _ = tx.send(ClientRequest::GhostTyping { recipient_id, text });
            }
        });
        Ok(())
    }

    pub async fn audio_recording(&self, recipient_id: UserId, is_recording: bool) -> Result<()> {
        self.send_request(ClientRequest::AudioRecording {
            recipient_id,
            is_recording,
        })
        .await
    }

    pub async fn audio_listening(
        &self,
        message_id: MessageId,
        is_listening: bool,
        is_ended: bool,
    ) -> Result<()> {
        self.send_request(ClientRequest::AudioListening {
            message_id,
            is_listening,
            is_ended,
        })
        .await
    }

    pub async fn presence_update(&self, status: PresenceStatus) -> Result<()> {
        self.send_request(ClientRequest::PresenceUpdate { status })
            .await
    }

    pub async fn presence_request(&self, user_ids: Vec<UserId>) -> Result<()> {
        self.send_request(ClientRequest::PresenceRequest { user_ids })
            .await
    }

    /// Identity lookup for a peer that shows up in a push before any of
    /// their profile data is known locally.
    pub async fn fetch_user_identity(&self, user_id: UserId) -> Result<UserIdentity> {
        let (server_url, token) = {
            let guard = self.inner.lock().await;
            (
                guard
                    .server_url
                    .clone()
                    .ok_or_else(|| anyhow!("login before fetching identities"))?,
                guard
                    .token
                    .clone()
                    .ok_or_else(|| anyhow!("login before fetching identities"))?,
            )
        };
        let identity = self
            .http
            .get(format!("{server_url}/users/{}", user_id.0))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(identity)
    }

    /// Paged history over REST. Viewing history counts as reading, so
    /// the local unread counter resets alongside the server-side batch
    /// mark-read the endpoint performs.
    pub async fn fetch_history(
        &self,
        peer_id: UserId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let (server_url, token) = {
            let guard = self.inner.lock().await;
            (
                guard
                    .server_url
                    .clone()
                    .ok_or_else(|| anyhow!("login before fetching history"))?,
                guard
                    .token
                    .clone()
                    .ok_or_else(|| anyhow!("login before fetching history"))?,
            )
        };

        let mut request = self
            .http
            .get(format!("{server_url}/history"))
            .bearer_auth(token)
            .query(&[("other_user_id", peer_id.0), ("limit", limit as i64)]);
        if let Some(before) = before {
            request = request.query(&[("before", before.0)]);
        }
        let body: HistoryResponse = request.send().await?.error_for_status()?.json().await?;

        {
            let mut guard = self.inner.lock().await;
            let key = ConversationKey::Direct(peer_id);
            let summary = guard
                .conversations
                .entry(key)
                .or_insert_with(|| ConversationSummary::new(key));
            summary.unread_count = 0;
            if let Some(newest) = body.messages.first() {
                summary.last_message = Some(newest.clone());
            }
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        Ok(body.messages)
    }
}

/// The message-centric surface a frontend binds to, kept narrow so UI
/// layers can be tested against a stub.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn send_text(&self, recipient_id: UserId, text: &str) -> Result<LocalMessageId>;
    async fn mark_read(&self, message_id: MessageId) -> Result<()>;
    async fn react(&self, message_id: MessageId, emoji: &str) -> Result<()>;
    async fn unsend(&self, message_id: MessageId) -> Result<()>;
    async fn conversation_summaries(&self) -> Vec<ConversationSummary>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

#[async_trait]
impl ChatHandle for ChatClient {
    async fn send_text(&self, recipient_id: UserId, text: &str) -> Result<LocalMessageId> {
        self.send_message(recipient_id, MessageDraft::text(text))
            .await
    }

    async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        ChatClient::mark_read(self, message_id).await
    }

    async fn react(&self, message_id: MessageId, emoji: &str) -> Result<()> {
        ChatClient::react(self, message_id, emoji).await
    }

    async fn unsend(&self, message_id: MessageId) -> Result<()> {
        ChatClient::unsend(self, message_id).await
    }

    async fn conversation_summaries(&self) -> Vec<ConversationSummary> {
        ChatClient::conversation_summaries(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        ChatClient::subscribe_events(self)
    }
}

fn outbound_request(message: &OutgoingMessage) -> ClientRequest {
    match message.target {
        SendTarget::Direct(recipient_id) => ClientRequest::SendMessage {
            client_nonce: message.client_nonce.clone(),
            recipient_id,
            draft: message.draft.clone(),
        },
        SendTarget::Group(group_id) => ClientRequest::SendGroupMessage {
            client_nonce: message.client_nonce.clone(),
            group_id,
            draft: message.draft.clone(),
        },
    }
}

fn http_to_ws(server_url: &str) -> Result<String> {
    if let Some(rest) = server_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(anyhow!("server_url must start with http:// or https://"))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
