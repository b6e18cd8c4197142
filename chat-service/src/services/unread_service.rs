use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Conversation, ConversationKind};
use crate::services::membership_service::MembershipService;

/// Last message of a conversation, shaped for list rendering without
/// hydrating full history.
#[derive(Debug, Clone, Serialize)]
pub struct LastMessage {
    pub id: Uuid,
    pub content: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub last_message: Option<LastMessage>,
    pub unread_count: i64,
}

/// Derives per-user unread counts and conversation summaries from the message
/// store and each member's read cursor. Counts are range queries over the
/// (conversation, created_at) index; message bodies are only touched for the
/// single last-message preview.
pub struct UnreadService;

fn summary_from_row(row: &sqlx::postgres::PgRow) -> ConversationSummary {
    let kind: String = row.get("kind");
    let conversation = Conversation {
        id: row.get("id"),
        kind: ConversationKind::parse(&kind),
        name: row.get("name"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        last_activity_at: row.get("last_activity_at"),
        created_at: row.get("created_at"),
    };
    let last_message_id: Option<Uuid> = row.get("last_message_id");
    let last_message = last_message_id.map(|id| LastMessage {
        id,
        content: row.get("last_message_content"),
        sender_id: row.get("last_message_sender_id"),
        sender_name: row.get("last_message_sender_name"),
        created_at: row.get("last_message_at"),
    });
    ConversationSummary {
        conversation,
        last_message,
        unread_count: row.get("unread_count"),
    }
}

const SUMMARY_QUERY: &str = r#"
    SELECT c.id, c.kind, c.name, c.description, c.created_by, c.last_activity_at, c.created_at,
           lm.id AS last_message_id,
           lm.content AS last_message_content,
           lm.sender_id AS last_message_sender_id,
           lm.created_at AS last_message_at,
           u.name AS last_message_sender_name,
           (
               SELECT COUNT(*) FROM messages m
               WHERE m.conversation_id = c.id
                 AND m.sender_id <> cm.user_id
                 AND (cm.last_read_at IS NULL OR m.created_at > cm.last_read_at)
           ) AS unread_count
    FROM conversations c
    JOIN conversation_members cm ON cm.conversation_id = c.id AND cm.user_id = $1
    LEFT JOIN LATERAL (
        SELECT m.id, m.content, m.sender_id, m.created_at
        FROM messages m
        WHERE m.conversation_id = c.id
        ORDER BY m.created_at DESC, m.id DESC
        LIMIT 1
    ) lm ON TRUE
    LEFT JOIN users u ON u.id = lm.sender_id
"#;

impl UnreadService {
    /// Messages in the conversation authored by someone else and newer than
    /// the member's read cursor (all of them when the cursor is unset). A
    /// single range count; bodies are never loaded.
    pub async fn unread_count(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<i64> {
        MembershipService::require_member(db, conversation_id, user_id).await?;

        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages m
            WHERE m.conversation_id = $1
              AND m.sender_id <> $2
              AND m.created_at > COALESCE(
                  (
                      SELECT cm.last_read_at FROM conversation_members cm
                      WHERE cm.conversation_id = $1 AND cm.user_id = $2
                  ),
                  '-infinity'::timestamptz
              )
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(db)
        .await?;

        Ok(count)
    }

    /// Summary of one conversation for the member: last message + unread
    /// count, enough to render a list row.
    pub async fn conversation_summary(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<ConversationSummary> {
        MembershipService::require_member(db, conversation_id, user_id).await?;

        let query = format!("{SUMMARY_QUERY} WHERE c.id = $2");
        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(conversation_id)
            .fetch_one(db)
            .await?;

        Ok(summary_from_row(&row))
    }

    /// All of the member's conversations, most recently active first.
    pub async fn summaries_for_user(db: &PgPool, user_id: Uuid) -> AppResult<Vec<ConversationSummary>> {
        let query = format!("{SUMMARY_QUERY} ORDER BY c.last_activity_at DESC LIMIT 100");
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(db)
            .await?;

        Ok(rows.iter().map(summary_from_row).collect())
    }

    /// Advance the member's read cursor to now. Monotonic via the membership
    /// store; a stale client can never move the cursor backward.
    pub async fn mark_read(db: &PgPool, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        MembershipService::advance_read_cursor(db, conversation_id, user_id, Utc::now()).await
    }
}
