use axum::extract::ws::Message;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::Client;
use uuid::Uuid;

use crate::websocket::ConnectionRegistry;

fn conversation_channel(id: Uuid) -> String {
    format!("conversation:{id}")
}

fn user_channel(id: Uuid) -> String {
    format!("user:{id}")
}

pub async fn publish_conversation(
    client: &Client,
    conversation_id: Uuid,
    payload: &str,
) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.publish::<_, _, ()>(conversation_channel(conversation_id), payload)
        .await
}

pub async fn publish_user(client: &Client, user_id: Uuid, payload: &str) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.publish::<_, _, ()>(user_channel(user_id), payload).await
}

/// Bridge redis pub/sub into the local registry so instances fan out each
/// other's events. Payloads this instance published are dropped on an
/// `origin` match, since local delivery already happened, and the
/// author-exclusion rule is re-applied from the envelope's `sender_id`.
pub async fn start_psub_listener(
    client: Client,
    registry: ConnectionRegistry,
    instance_id: Uuid,
) -> redis::RedisResult<()> {
    // PubSub requires a dedicated connection, not multiplexed.
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.psubscribe("conversation:*").await?;
    pubsub.psubscribe("user:*").await?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel: String = msg.get_channel_name().into();
        let payload: String = msg.get_payload()?;

        let envelope: serde_json::Value = match serde_json::from_str(&payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, %channel, "dropping malformed pubsub payload");
                continue;
            }
        };
        if envelope.get("origin").and_then(|v| v.as_str()) == Some(instance_id.to_string().as_str())
        {
            continue;
        }
        let sender_id = envelope
            .get("sender_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        if let Some(rest) = channel.strip_prefix("conversation:") {
            if let Ok(conversation_id) = Uuid::parse_str(rest) {
                registry
                    .broadcast_conversation(conversation_id, sender_id, Message::Text(payload))
                    .await;
            }
        } else if let Some(rest) = channel.strip_prefix("user:") {
            if let Ok(user_id) = Uuid::parse_str(rest) {
                registry.notify_user(user_id, Message::Text(payload)).await;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_follow_the_convention() {
        let id = Uuid::new_v4();
        assert_eq!(conversation_channel(id), format!("conversation:{id}"));
        assert_eq!(user_channel(id), format!("user:{id}"));
    }
}
