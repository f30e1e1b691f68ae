use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{CallId, MessageId, SubscriptionInfo, UserId, UserStatus},
    error::ApiError,
};

/// Correlation id linking a request envelope to its response.
///
/// UUIDv7 is time-ordered, so the send order of requests is recoverable from
/// the ids alone without a separate sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One discrete WebSocket message.
///
/// Request-style envelopes carry a unique correlation id; responses echo the
/// id of the request they answer; server-initiated pushes carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn request(body: EnvelopeBody) -> Self {
        Self {
            id: Some(CorrelationId::generate()),
            body,
        }
    }

    pub fn response(id: CorrelationId, body: EnvelopeBody) -> Self {
        Self { id: Some(id), body }
    }

    pub fn push(body: EnvelopeBody) -> Self {
        Self { id: None, body }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EnvelopeBody {
    // Identity lookups.
    GetUser {
        user_id: UserId,
    },
    GetUserByName {
        username: String,
    },
    UserResponse {
        user: UserPayload,
    },
    // Conversation sync.
    ListConversations,
    ConversationsResponse {
        conversations: Vec<ConversationPayload>,
    },
    ConversationUpdated {
        conversation: ConversationPayload,
    },
    // Messaging.
    SendMessage {
        to: UserId,
        body: String,
    },
    MessageAck {
        message_id: MessageId,
    },
    MessageReceived {
        message: MessagePayload,
    },
    // Call control.
    RequestCallToken {
        call_id: CallId,
    },
    CallTokenIssued {
        call_id: CallId,
        token: String,
    },
    CallInvite {
        call_id: CallId,
        from: UserId,
        to: UserId,
    },
    CallStarted {
        call_id: CallId,
        user_id: UserId,
    },
    CallEnded {
        call_id: CallId,
        user_id: UserId,
    },
    Error {
        error: ApiError,
    },
}

impl EnvelopeBody {
    /// Wire discriminant, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EnvelopeBody::GetUser { .. } => "get_user",
            EnvelopeBody::GetUserByName { .. } => "get_user_by_name",
            EnvelopeBody::UserResponse { .. } => "user_response",
            EnvelopeBody::ListConversations => "list_conversations",
            EnvelopeBody::ConversationsResponse { .. } => "conversations_response",
            EnvelopeBody::ConversationUpdated { .. } => "conversation_updated",
            EnvelopeBody::SendMessage { .. } => "send_message",
            EnvelopeBody::MessageAck { .. } => "message_ack",
            EnvelopeBody::MessageReceived { .. } => "message_received",
            EnvelopeBody::RequestCallToken { .. } => "request_call_token",
            EnvelopeBody::CallTokenIssued { .. } => "call_token_issued",
            EnvelopeBody::CallInvite { .. } => "call_invite",
            EnvelopeBody::CallStarted { .. } => "call_started",
            EnvelopeBody::CallEnded { .. } => "call_ended",
            EnvelopeBody::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    pub user_id: UserId,
    pub username: String,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Per-peer conversation snapshot. A call id disappears from `active_calls`
/// when the call ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub user_id: UserId,
    #[serde(default)]
    pub active_calls: Vec<CallId>,
    #[serde(default)]
    pub messages: Vec<MessagePayload>,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
