//! Broadcast payload contract.
//!
//! Every event is a flat JSON envelope:
//!
//! ```json
//! {
//!     "type": "message.created",
//!     "version": 1,
//!     "timestamp": "2026-01-10T10:30:00Z",
//!     "conversation_id": "uuid",
//!     "sender_id": "uuid",
//!     "origin": "uuid",
//!     ...event fields
//! }
//! ```
//!
//! Consumers parse it contractually, so the shape is versioned and
//! serialization happens in exactly one place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MemberRole, Message, UserProfile};
use crate::websocket::{pubsub, ConnectionRegistry};

/// Bumped whenever the envelope or an event's fields change shape.
pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorPayload {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub content: String,
    pub conversation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub author: AuthorPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
}

impl MessagePayload {
    pub fn from_message(message: &Message, author: &UserProfile) -> Self {
        Self {
            id: message.id,
            content: message.content.clone(),
            conversation_id: message.conversation_id,
            created_at: message.created_at,
            updated_at: message.edited_at.unwrap_or(message.created_at),
            author: AuthorPayload {
                id: author.id,
                name: author.name.clone(),
                email: Some(author.email.clone()),
            },
            reply_to: message.reply_to,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    #[serde(rename = "message.created")]
    MessageCreated { message: MessagePayload },

    #[serde(rename = "message.edited")]
    MessageEdited { message: MessagePayload },

    #[serde(rename = "message.deleted")]
    MessageDeleted { message_id: Uuid },

    #[serde(rename = "member.joined")]
    MemberJoined { user_id: Uuid, role: MemberRole },

    #[serde(rename = "member.left")]
    MemberLeft { user_id: Uuid },

    #[serde(rename = "conversation.updated")]
    ConversationUpdated {
        name: Option<String>,
        description: Option<String>,
    },
}

impl ChatEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageCreated { .. } => "message.created",
            Self::MessageEdited { .. } => "message.edited",
            Self::MessageDeleted { .. } => "message.deleted",
            Self::MemberJoined { .. } => "member.joined",
            Self::MemberLeft { .. } => "member.left",
            Self::ConversationUpdated { .. } => "conversation.updated",
        }
    }

    /// The single serialization point: envelope fields first, event fields
    /// flattened on top (including the serde `type` tag).
    pub fn to_payload_value(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        origin: Uuid,
    ) -> Result<serde_json::Value, serde_json::Error> {
        let mut payload = serde_json::json!({
            "version": PAYLOAD_VERSION,
            "timestamp": Utc::now().to_rfc3339(),
            "conversation_id": conversation_id,
            "sender_id": sender_id,
            "origin": origin,
        });

        let fields = serde_json::to_value(self)?;
        if let (serde_json::Value::Object(envelope), serde_json::Value::Object(fields)) =
            (&mut payload, fields)
        {
            for (key, value) in fields {
                envelope.insert(key, value);
            }
        }

        Ok(payload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("failed to serialize event: {0}")]
    Serialization(String),
}

/// Canonical fan-out path for an event that already happened: the write is
/// committed before this runs, and nothing here can fail the sender's
/// request. Delivery goes to the conversation channel (author excluded) and
/// to each recipient's private user channel; the redis mirror carries the
/// same payload to other instances, whose bridge applies the same exclusion.
/// Redis failures and dead subscribers are logged and dropped.
pub async fn broadcast_event(
    registry: &ConnectionRegistry,
    redis: &redis::Client,
    instance_id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    user_channel_recipients: &[Uuid],
    event: ChatEvent,
) -> Result<(), BroadcastError> {
    let payload = event
        .to_payload_value(conversation_id, sender_id, instance_id)
        .map_err(|e| BroadcastError::Serialization(e.to_string()))?
        .to_string();

    if let Err(e) = pubsub::publish_conversation(redis, conversation_id, &payload).await {
        tracing::warn!(error = %e, %conversation_id, "redis publish failed; local delivery only");
    }
    for recipient in user_channel_recipients {
        if let Err(e) = pubsub::publish_user(redis, *recipient, &payload).await {
            tracing::warn!(error = %e, user_id = %recipient, "redis user publish failed");
        }
    }

    let delivered = registry
        .broadcast_conversation(
            conversation_id,
            Some(sender_id),
            axum::extract::ws::Message::Text(payload.clone()),
        )
        .await;
    for recipient in user_channel_recipients {
        registry
            .notify_user(*recipient, axum::extract::ws::Message::Text(payload.clone()))
            .await;
    }

    tracing::debug!(
        event = event.event_type(),
        %conversation_id,
        delivered,
        "event broadcast"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message_payload(conversation_id: Uuid, sender_id: Uuid) -> MessagePayload {
        MessagePayload {
            id: Uuid::new_v4(),
            content: "hello".into(),
            conversation_id,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            author: AuthorPayload {
                id: sender_id,
                name: "Alice".into(),
                email: Some("alice@example.com".into()),
            },
            reply_to: None,
        }
    }

    #[test]
    fn event_types_match_the_contract() {
        let event = ChatEvent::MessageDeleted {
            message_id: Uuid::new_v4(),
        };
        assert_eq!(event.event_type(), "message.deleted");
    }

    #[test]
    fn message_created_payload_carries_the_full_contract() {
        let conversation_id = Uuid::new_v4();
        let sender_id = Uuid::new_v4();
        let origin = Uuid::new_v4();
        let event = ChatEvent::MessageCreated {
            message: sample_message_payload(conversation_id, sender_id),
        };

        let payload = event
            .to_payload_value(conversation_id, sender_id, origin)
            .unwrap();

        assert_eq!(payload["type"], "message.created");
        assert_eq!(payload["version"], PAYLOAD_VERSION);
        assert_eq!(payload["conversation_id"], conversation_id.to_string());
        assert_eq!(payload["sender_id"], sender_id.to_string());
        assert_eq!(payload["origin"], origin.to_string());
        assert!(payload["timestamp"].is_string());

        let message = &payload["message"];
        assert!(message["id"].is_string());
        assert_eq!(message["content"], "hello");
        assert_eq!(message["conversation_id"], conversation_id.to_string());
        assert!(message["created_at"].is_string());
        assert!(message["updated_at"].is_string());
        assert_eq!(message["author"]["id"], sender_id.to_string());
        assert_eq!(message["author"]["name"], "Alice");
        assert_eq!(message["author"]["email"], "alice@example.com");
    }

    #[test]
    fn omitted_email_is_absent_not_null() {
        let mut payload = sample_message_payload(Uuid::new_v4(), Uuid::new_v4());
        payload.author.email = None;
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value["author"].get("email").is_none());
    }

    #[test]
    fn member_events_flatten_into_the_envelope() {
        let user_id = Uuid::new_v4();
        let event = ChatEvent::MemberJoined {
            user_id,
            role: MemberRole::Member,
        };
        let payload = event
            .to_payload_value(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .unwrap();
        assert_eq!(payload["type"], "member.joined");
        assert_eq!(payload["user_id"], user_id.to_string());
        assert_eq!(payload["role"], "member");
    }
}
