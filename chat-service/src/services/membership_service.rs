use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Member, MemberRole};

/// Owns the conversation <-> user relation: roles, join state, mute flag and
/// per-member read cursors. Uniqueness of the (conversation, user) pair is
/// enforced by the schema; every write here rides that constraint instead of
/// scanning first.
pub struct MembershipService;

fn member_from_row(row: &sqlx::postgres::PgRow) -> Member {
    let role: String = row.get("role");
    Member {
        conversation_id: row.get("conversation_id"),
        user_id: row.get("user_id"),
        role: MemberRole::parse(&role),
        joined_at: row.get("joined_at"),
        last_read_at: row.get("last_read_at"),
        is_muted: row.get("is_muted"),
    }
}

impl MembershipService {
    /// Insert a membership row. Concurrent adds for the same pair race on the
    /// unique constraint; the loser observes no inserted row and gets
    /// `AlreadyMember`.
    pub async fn add_member(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> AppResult<Member> {
        let row = sqlx::query(
            r#"
            INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (conversation_id, user_id) DO NOTHING
            RETURNING conversation_id, user_id, role, joined_at, last_read_at, is_muted
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(role.as_str())
        .fetch_optional(db)
        .await?;

        row.map(|r| member_from_row(&r)).ok_or(AppError::AlreadyMember)
    }

    /// Same insert inside a caller-owned transaction (conversation creation
    /// attaches members atomically with the conversation row).
    pub async fn add_member_tx(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
        role: MemberRole,
    ) -> AppResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (conversation_id, user_id) DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(AppError::AlreadyMember);
        }
        Ok(())
    }

    /// Delete the membership and report how many members remain, in one
    /// transaction so the caller's deletion-policy decision sees a consistent
    /// count.
    pub async fn remove_member(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<i64> {
        let mut tx = db.begin().await?;
        let remaining = Self::remove_member_tx(&mut tx, conversation_id, user_id).await?;
        tx.commit().await?;
        Ok(remaining)
    }

    pub async fn remove_member_tx(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<i64> {
        let deleted = sqlx::query(
            "DELETE FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(remaining)
    }

    /// Advance the read cursor, never backward. Concurrent advances merge via
    /// GREATEST instead of last-write-wins.
    pub async fn advance_read_cursor(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> AppResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE conversation_members
            SET last_read_at = GREATEST(COALESCE(last_read_at, $3), $3)
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(timestamp)
        .execute(db)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::Forbidden);
        }
        Ok(())
    }

    pub async fn get_member(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<Member>> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, user_id, role, joined_at, last_read_at, is_muted
            FROM conversation_members
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(db)
        .await?;

        Ok(row.map(|r| member_from_row(&r)))
    }

    pub async fn get_role(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Option<MemberRole>> {
        Ok(Self::get_member(db, conversation_id, user_id)
            .await?
            .map(|m| m.role))
    }

    /// Membership rows for a conversation, collapsed to one row per user by
    /// earliest insert even if a historical defect left duplicates behind.
    pub async fn list_members(db: &PgPool, conversation_id: Uuid) -> AppResult<Vec<Member>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (user_id)
                conversation_id, user_id, role, joined_at, last_read_at, is_muted
            FROM conversation_members
            WHERE conversation_id = $1
            ORDER BY user_id, id ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(db)
        .await?;

        Ok(rows.iter().map(member_from_row).collect())
    }

    pub async fn set_muted(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
        muted: bool,
    ) -> AppResult<()> {
        let updated = sqlx::query(
            "UPDATE conversation_members SET is_muted = $3 WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(muted)
        .execute(db)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(AppError::Forbidden);
        }
        Ok(())
    }

    /// Authorization helper used by every other component: membership is the
    /// read/write capability for a conversation.
    pub async fn require_member(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Member> {
        Self::get_member(db, conversation_id, user_id)
            .await?
            .ok_or(AppError::Forbidden)
    }

    pub async fn require_admin(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Member> {
        let member = Self::require_member(db, conversation_id, user_id).await?;
        if !member.role.is_admin() {
            return Err(AppError::Forbidden);
        }
        Ok(member)
    }
}
