use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Message, MessageKind, UserProfile};
use crate::services::membership_service::MembershipService;

/// Upper bound on message content, counted in code points.
pub const MAX_CONTENT_CHARS: usize = 5000;

/// Keyset cursor into a conversation's history. Ordering is
/// (created_at, id) ascending; the cursor names the last row already seen, so
/// a sequence can be resumed from any point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next: Option<PageCursor>,
}

/// Preview of the quoted message attached to a reply. `None` when the quoted
/// message has been deleted; readers render that as "original message
/// deleted" rather than erroring on the dangling reference.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyPreview {
    pub id: Uuid,
    pub content: String,
    pub author_name: String,
}

pub struct MessageService;

fn message_from_row(row: &sqlx::postgres::PgRow) -> Message {
    let kind: String = row.get("kind");
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        kind: MessageKind::parse(&kind),
        reply_to: row.get("reply_to"),
        is_edited: row.get("is_edited"),
        edited_at: row.get("edited_at"),
        created_at: row.get("created_at"),
    }
}

fn validate_content(content: &str) -> AppResult<()> {
    if content.trim().is_empty() {
        return Err(AppError::Validation("message content cannot be empty".into()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::Validation(format!(
            "message content too long (max {MAX_CONTENT_CHARS} characters)"
        )));
    }
    Ok(())
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, kind, reply_to, is_edited, edited_at, created_at";

impl MessageService {
    /// Persist a message. The insert, the conversation activity bump and the
    /// author's own read-cursor advance commit together: a sender never sees
    /// their own message as unread, and `last_activity_at` can never fall
    /// behind a stored message.
    pub async fn send(
        db: &PgPool,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        reply_to: Option<Uuid>,
        kind: MessageKind,
    ) -> AppResult<Message> {
        MembershipService::require_member(db, conversation_id, sender_id).await?;
        validate_content(content)?;

        let mut tx = db.begin().await?;

        if let Some(parent_id) = reply_to {
            let parent =
                sqlx::query("SELECT conversation_id FROM messages WHERE id = $1")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| {
                        AppError::InvalidReference("reply target does not exist".into())
                    })?;
            let parent_conversation: Uuid = parent.get("conversation_id");
            if parent_conversation != conversation_id {
                return Err(AppError::InvalidReference(
                    "reply target belongs to another conversation".into(),
                ));
            }
        }

        let id = Uuid::new_v4();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, kind, reply_to)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(content)
        .bind(kind.as_str())
        .bind(reply_to)
        .fetch_one(&mut *tx)
        .await?;
        let message = message_from_row(&row);

        sqlx::query(
            "UPDATE conversations SET last_activity_at = GREATEST(last_activity_at, $2) WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE conversation_members
            SET last_read_at = GREATEST(COALESCE(last_read_at, $3), $3)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    /// Author-only content edit. The creation timestamp is untouched; the
    /// edit is visible through `is_edited`/`edited_at`.
    pub async fn edit(
        db: &PgPool,
        message_id: Uuid,
        editor: Uuid,
        new_content: &str,
    ) -> AppResult<Message> {
        let message = Self::get(db, message_id).await?;
        if message.sender_id != editor {
            return Err(AppError::Forbidden);
        }
        validate_content(new_content)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE messages
            SET content = $2, is_edited = TRUE, edited_at = now()
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(message_id)
        .bind(new_content)
        .fetch_one(db)
        .await?;

        Ok(message_from_row(&row))
    }

    /// Hard delete by the author or a conversation admin. Replies keep their
    /// `reply_to` pointing at the removed row (the schema sets it NULL),
    /// never cascade.
    pub async fn delete(db: &PgPool, message_id: Uuid, requester: Uuid) -> AppResult<Message> {
        let message = Self::get(db, message_id).await?;
        if message.sender_id != requester {
            MembershipService::require_admin(db, message.conversation_id, requester).await?;
        }

        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(message_id)
            .execute(db)
            .await?;

        Ok(message)
    }

    pub async fn get(db: &PgPool, message_id: Uuid) -> AppResult<Message> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(message_id)
        .fetch_optional(db)
        .await?
        .ok_or(AppError::NotFound)?;

        Ok(message_from_row(&row))
    }

    /// One page of a conversation's history in (created_at, id) ascending
    /// order. Returns a cursor for the next page while more rows remain; the
    /// sequence is restartable from any previously returned cursor.
    pub async fn list_page(
        db: &PgPool,
        conversation_id: Uuid,
        after: Option<PageCursor>,
        limit: i64,
    ) -> AppResult<MessagePage> {
        let limit = limit.clamp(1, 200);

        let rows = match after {
            Some(cursor) => {
                sqlx::query(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS}
                    FROM messages
                    WHERE conversation_id = $1 AND (created_at, id) > ($2, $3)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $4
                    "#
                ))
                .bind(conversation_id)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(limit + 1)
                .fetch_all(db)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    r#"
                    SELECT {MESSAGE_COLUMNS}
                    FROM messages
                    WHERE conversation_id = $1
                    ORDER BY created_at ASC, id ASC
                    LIMIT $2
                    "#
                ))
                .bind(conversation_id)
                .bind(limit + 1)
                .fetch_all(db)
                .await?
            }
        };

        let mut messages: Vec<Message> = rows.iter().map(message_from_row).collect();
        let next = if messages.len() as i64 > limit {
            messages.truncate(limit as usize);
            messages.last().map(|m| PageCursor {
                created_at: m.created_at,
                id: m.id,
            })
        } else {
            None
        };

        Ok(MessagePage { messages, next })
    }

    /// Author details for the broadcast payload and response DTOs.
    pub async fn sender_profile(db: &PgPool, user_id: Uuid) -> AppResult<UserProfile> {
        let row = sqlx::query("SELECT id, name, email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(db)
            .await?
            .ok_or(AppError::NotFound)?;

        Ok(UserProfile {
            id: row.get("id"),
            name: row.get("name"),
            email: row.get("email"),
        })
    }

    /// Resolve the quoted message for a reply. A dangling or missing
    /// reference resolves to `None`, meaning "original message deleted".
    pub async fn reply_preview(
        db: &PgPool,
        reply_to: Option<Uuid>,
    ) -> AppResult<Option<ReplyPreview>> {
        let Some(parent_id) = reply_to else {
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT m.id, m.content, u.name AS author_name
            FROM messages m
            JOIN users u ON u.id = m.sender_id
            WHERE m.id = $1
            "#,
        )
        .bind(parent_id)
        .fetch_optional(db)
        .await?;

        Ok(row.map(|r| ReplyPreview {
            id: r.get("id"),
            content: r.get("content"),
            author_name: r.get("author_name"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_must_be_non_empty() {
        assert!(matches!(
            validate_content(""),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_content("   \n "),
            Err(AppError::Validation(_))
        ));
        assert!(validate_content("hi").is_ok());
    }

    #[test]
    fn content_limit_counts_code_points_not_bytes() {
        // 5000 multibyte characters are within the limit.
        let at_limit: String = "é".repeat(MAX_CONTENT_CHARS);
        assert!(validate_content(&at_limit).is_ok());

        let over: String = "é".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            validate_content(&over),
            Err(AppError::Validation(_))
        ));
    }
}
