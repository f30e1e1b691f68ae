//! In-memory directory of users and conversations.
//!
//! The directory is the single writer of user and conversation entries.
//! Lookups go through the session transport; concurrent lookups of the same
//! id share one in-flight request, and a failed lookup resolves to a
//! placeholder identity so rendering never stalls on one missing user.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use shared::{
    domain::{CallId, SubscriptionInfo, UserId, UserStatus},
    protocol::{ConversationPayload, EnvelopeBody, MessagePayload, UserPayload},
};
use storage::KeyValueStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::transport::{PushEvent, PushKind, SessionTransport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub subscription: Option<SubscriptionInfo>,
    #[serde(default)]
    pub public_key: Option<String>,
    /// Set on the identity a failed lookup resolves to. Placeholders are
    /// never cached or persisted.
    #[serde(default)]
    pub is_placeholder: bool,
}

impl UserRecord {
    pub fn from_payload(user: UserPayload) -> Self {
        let display_name = user
            .display
            .clone()
            .filter(|display| !display.is_empty())
            .unwrap_or_else(|| user.username.clone());
        Self {
            user_id: user.user_id,
            username: user.username,
            display_name,
            avatar_url: user.avatar_url,
            status: user.status,
            subscription: user.subscription,
            public_key: user.public_key,
            is_placeholder: false,
        }
    }

    pub fn placeholder(user_id: UserId) -> Self {
        Self {
            user_id,
            username: String::new(),
            display_name: "Unknown User".into(),
            avatar_url: None,
            status: UserStatus::Offline,
            subscription: None,
            public_key: None,
            is_placeholder: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub user_id: UserId,
    pub active_calls: Vec<CallId>,
    pub messages: Vec<MessagePayload>,
}

impl Conversation {
    fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            active_calls: Vec::new(),
            messages: Vec::new(),
        }
    }

    fn from_payload(payload: ConversationPayload) -> Self {
        Self {
            user_id: payload.user_id,
            active_calls: payload.active_calls,
            messages: payload.messages,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    UserUpdated(UserRecord),
    ConversationUpdated(UserId),
}

struct DirectoryState {
    users: HashMap<UserId, UserRecord>,
    conversations: HashMap<UserId, Conversation>,
    inflight: HashMap<UserId, broadcast::Sender<UserRecord>>,
}

enum Flight {
    Leader,
    Follower(broadcast::Receiver<UserRecord>),
}

pub struct UserDirectory {
    transport: Arc<SessionTransport>,
    store: Option<Arc<dyn KeyValueStore>>,
    inner: Mutex<DirectoryState>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl UserDirectory {
    pub async fn new(
        transport: Arc<SessionTransport>,
        store: Option<Arc<dyn KeyValueStore>>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let directory = Arc::new(Self {
            transport,
            store,
            inner: Mutex::new(DirectoryState {
                users: HashMap::new(),
                conversations: HashMap::new(),
                inflight: HashMap::new(),
            }),
            events,
        });
        directory.hydrate().await;
        directory.register_push_handlers().await;
        directory
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    /// Returns the cached record, or issues one lookup over the transport.
    /// Concurrent calls for the same id while a lookup is in flight share
    /// that request. Never fails: a lost lookup yields a placeholder.
    pub async fn get(&self, user_id: UserId, force_refresh: bool) -> UserRecord {
        let flight = {
            let mut state = self.inner.lock().await;
            if !force_refresh {
                if let Some(record) = state.users.get(&user_id) {
                    return record.clone();
                }
            }
            match state.inflight.get(&user_id) {
                Some(inflight) => Flight::Follower(inflight.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    state.inflight.insert(user_id, tx);
                    Flight::Leader
                }
            }
        };

        match flight {
            Flight::Follower(mut rx) => rx
                .recv()
                .await
                .unwrap_or_else(|_| UserRecord::placeholder(user_id)),
            Flight::Leader => self.lead_lookup(user_id).await,
        }
    }

    pub async fn conversation(&self, user_id: UserId) -> Option<Conversation> {
        self.inner.lock().await.conversations.get(&user_id).cloned()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner
            .lock()
            .await
            .conversations
            .values()
            .cloned()
            .collect()
    }

    async fn lead_lookup(&self, user_id: UserId) -> UserRecord {
        let record = match self
            .transport
            .request(EnvelopeBody::GetUser { user_id })
            .await
        {
            Ok(EnvelopeBody::UserResponse { user }) => UserRecord::from_payload(user),
            Ok(other) => {
                warn!(
                    user_id = user_id.0,
                    kind = other.kind_name(),
                    "unexpected user lookup response"
                );
                UserRecord::placeholder(user_id)
            }
            Err(err) => {
                warn!(user_id = user_id.0, "user lookup failed: {err}");
                UserRecord::placeholder(user_id)
            }
        };

        {
            let mut state = self.inner.lock().await;
            if !record.is_placeholder {
                state.users.insert(user_id, record.clone());
            }
            if let Some(inflight) = state.inflight.remove(&user_id) {
                let _ = inflight.send(record.clone());
            }
        }

        if !record.is_placeholder {
            self.persist(&record).await;
            let _ = self.events.send(DirectoryEvent::UserUpdated(record.clone()));
        }

        record
    }

    /// Loads persisted records so a restart renders names before the first
    /// round trip. First run (no store, no keys) is a no-op.
    async fn hydrate(&self) {
        let Some(store) = &self.store else { return };
        let keys = match store.list_keys("user/").await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("directory warm start skipped: {err}");
                return;
            }
        };

        let mut state = self.inner.lock().await;
        for key in keys {
            match store.get(&key).await {
                Ok(Some(json)) => match serde_json::from_str::<UserRecord>(&json) {
                    Ok(record) => {
                        state.users.insert(record.user_id, record);
                    }
                    Err(err) => debug!(%key, "dropping unreadable persisted user: {err}"),
                },
                Ok(None) => {}
                Err(err) => warn!(%key, "failed to read persisted user: {err}"),
            }
        }
        if !state.users.is_empty() {
            debug!(count = state.users.len(), "directory warm start loaded");
        }
    }

    async fn persist(&self, record: &UserRecord) {
        let Some(store) = &self.store else { return };
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(err) = store.set(&format!("user/{}", record.user_id.0), &json).await {
                    warn!(user_id = record.user_id.0, "failed to persist user: {err}");
                }
            }
            Err(err) => warn!(user_id = record.user_id.0, "failed to encode user: {err}"),
        }
    }

    async fn register_push_handlers(self: &Arc<Self>) {
        let directory = Arc::clone(self);
        self.transport
            .on_push(PushKind::MessageReceived, move |event| {
                if let PushEvent::Envelope(EnvelopeBody::MessageReceived { message }) = event {
                    let directory = Arc::clone(&directory);
                    let message = message.clone();
                    tokio::spawn(async move {
                        directory.record_incoming_message(message).await;
                    });
                }
            })
            .await;

        let directory = Arc::clone(self);
        self.transport
            .on_push(PushKind::ConversationUpdated, move |event| {
                if let PushEvent::Envelope(EnvelopeBody::ConversationUpdated { conversation }) =
                    event
                {
                    let directory = Arc::clone(&directory);
                    let conversation = conversation.clone();
                    tokio::spawn(async move {
                        directory.replace_conversation(conversation).await;
                    });
                }
            })
            .await;

        let directory = Arc::clone(self);
        self.transport
            .on_push(PushKind::CallStarted, move |event| {
                if let PushEvent::Envelope(EnvelopeBody::CallStarted { call_id, user_id }) = event {
                    let directory = Arc::clone(&directory);
                    let call_id = call_id.clone();
                    let user_id = *user_id;
                    tokio::spawn(async move {
                        directory.record_call_started(user_id, call_id).await;
                    });
                }
            })
            .await;

        let directory = Arc::clone(self);
        self.transport
            .on_push(PushKind::CallEnded, move |event| {
                if let PushEvent::Envelope(EnvelopeBody::CallEnded { call_id, user_id }) = event {
                    let directory = Arc::clone(&directory);
                    let call_id = call_id.clone();
                    let user_id = *user_id;
                    tokio::spawn(async move {
                        directory.record_call_ended(user_id, &call_id).await;
                    });
                }
            })
            .await;

        // A reopened socket means missed pushes: re-fetch instead of
        // assuming continuity.
        let directory = Arc::clone(self);
        self.transport
            .on_push(PushKind::Reconnected, move |event| {
                if matches!(event, PushEvent::Reconnected) {
                    let directory = Arc::clone(&directory);
                    tokio::spawn(async move {
                        directory.resync_conversations().await;
                    });
                }
            })
            .await;
    }

    async fn record_incoming_message(&self, message: MessagePayload) {
        let peer = message.sender_id;
        {
            let mut state = self.inner.lock().await;
            let conversation = state
                .conversations
                .entry(peer)
                .or_insert_with(|| Conversation::empty(peer));
            conversation.messages.push(message);
        }
        let _ = self.events.send(DirectoryEvent::ConversationUpdated(peer));
    }

    async fn replace_conversation(&self, payload: ConversationPayload) {
        let user_id = payload.user_id;
        {
            let mut state = self.inner.lock().await;
            state
                .conversations
                .insert(user_id, Conversation::from_payload(payload));
        }
        let _ = self
            .events
            .send(DirectoryEvent::ConversationUpdated(user_id));
    }

    async fn record_call_started(&self, user_id: UserId, call_id: CallId) {
        {
            let mut state = self.inner.lock().await;
            let conversation = state
                .conversations
                .entry(user_id)
                .or_insert_with(|| Conversation::empty(user_id));
            if !conversation.active_calls.contains(&call_id) {
                conversation.active_calls.push(call_id);
            }
        }
        let _ = self
            .events
            .send(DirectoryEvent::ConversationUpdated(user_id));
    }

    async fn record_call_ended(&self, user_id: UserId, call_id: &CallId) {
        {
            let mut state = self.inner.lock().await;
            if let Some(conversation) = state.conversations.get_mut(&user_id) {
                conversation.active_calls.retain(|active| active != call_id);
            }
        }
        let _ = self
            .events
            .send(DirectoryEvent::ConversationUpdated(user_id));
    }

    async fn resync_conversations(&self) {
        match self.transport.request(EnvelopeBody::ListConversations).await {
            Ok(EnvelopeBody::ConversationsResponse { conversations }) => {
                let mut state = self.inner.lock().await;
                state.conversations = conversations
                    .into_iter()
                    .map(|payload| (payload.user_id, Conversation::from_payload(payload)))
                    .collect();
                debug!(
                    count = state.conversations.len(),
                    "conversations resynchronized after reconnect"
                );
            }
            Ok(other) => warn!(
                kind = other.kind_name(),
                "unexpected conversations response"
            ),
            Err(err) => warn!("conversation resync failed: {err}"),
        }
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
