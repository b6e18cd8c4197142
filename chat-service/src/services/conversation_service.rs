use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::conversation::pair_key;
use crate::models::{Conversation, ConversationKind, MemberRole};
use crate::services::membership_service::MembershipService;

const MAX_NAME_LEN: usize = 255;
const MAX_DESCRIPTION_LEN: usize = 1000;

/// Outcome of a `leave` or member removal after the type-keyed deletion
/// policy ran.
#[derive(Debug, Clone, Copy)]
pub struct LeaveOutcome {
    pub remaining_members: i64,
    pub conversation_deleted: bool,
}

/// Owns conversation entities and their lifecycle: creation (with
/// dedup-of-private), activity timestamps, and deletion-on-empty.
pub struct ConversationService;

fn conversation_from_row(row: &sqlx::postgres::PgRow) -> Conversation {
    let kind: String = row.get("kind");
    Conversation {
        id: row.get("id"),
        kind: ConversationKind::parse(&kind),
        name: row.get("name"),
        description: row.get("description"),
        created_by: row.get("created_by"),
        last_activity_at: row.get("last_activity_at"),
        created_at: row.get("created_at"),
    }
}

fn validate_group_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("group name cannot be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(AppError::Validation(format!(
            "group name too long (max {MAX_NAME_LEN})"
        )));
    }
    Ok(name.to_string())
}

fn validate_description(description: &Option<String>) -> AppResult<()> {
    if let Some(desc) = description {
        if desc.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(AppError::Validation(format!(
                "description too long (max {MAX_DESCRIPTION_LEN})"
            )));
        }
    }
    Ok(())
}

/// Whether removing a member leaves the conversation with no reason to
/// exist. Private conversations are meaningless with one party; groups
/// persist as long as anyone remains.
fn should_delete_after_leave(kind: ConversationKind, remaining: i64) -> bool {
    match kind {
        ConversationKind::Private => remaining <= 1,
        ConversationKind::Group => remaining == 0,
    }
}

impl ConversationService {
    /// Create (or return the existing) private conversation for an unordered
    /// pair of users. The pair-key unique index makes the dedup check and the
    /// create-and-attach effectively atomic: concurrent creators race on the
    /// index, the loser picks up the winner's row.
    pub async fn create_private(db: &PgPool, creator: Uuid, peer: Uuid) -> AppResult<(Uuid, bool)> {
        if creator == peer {
            return Err(AppError::Validation(
                "a private conversation needs two distinct users".into(),
            ));
        }

        for _ in 0..2 {
            if let Some(outcome) = Self::try_create_private(db, creator, peer).await? {
                return Ok(outcome);
            }
        }
        Err(AppError::Conflict(
            "concurrent private conversation creation".into(),
        ))
    }

    async fn try_create_private(
        db: &PgPool,
        creator: Uuid,
        peer: Uuid,
    ) -> AppResult<Option<(Uuid, bool)>> {
        let key = pair_key(creator, peer);

        if let Some(row) = sqlx::query("SELECT id FROM conversations WHERE pair_key = $1")
            .bind(&key)
            .fetch_optional(db)
            .await?
        {
            return Ok(Some((row.get("id"), false)));
        }

        let id = Uuid::new_v4();
        let mut tx = db.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (id, kind, created_by, pair_key)
            VALUES ($1, 'private', $2, $3)
            ON CONFLICT (pair_key) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(creator)
        .bind(&key)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Lost the race; the winner's row becomes visible once it commits.
            tx.rollback().await?;
            let row = sqlx::query("SELECT id FROM conversations WHERE pair_key = $1")
                .bind(&key)
                .fetch_optional(db)
                .await?;
            return Ok(row.map(|r| (r.get("id"), false)));
        }

        MembershipService::add_member_tx(&mut tx, id, creator, MemberRole::Admin).await?;
        MembershipService::add_member_tx(&mut tx, id, peer, MemberRole::Member).await?;
        tx.commit().await?;

        Ok(Some((id, true)))
    }

    /// Create a group conversation with the creator as admin. Member ids are
    /// deduplicated first so a repeated id cannot produce two membership rows.
    pub async fn create_group(
        db: &PgPool,
        creator: Uuid,
        name: &str,
        description: Option<String>,
        member_ids: &[Uuid],
    ) -> AppResult<Uuid> {
        let name = validate_group_name(name)?;
        validate_description(&description)?;

        let mut members: Vec<Uuid> = Vec::new();
        for id in member_ids {
            if *id != creator && !members.contains(id) {
                members.push(*id);
            }
        }
        if members.is_empty() {
            return Err(AppError::Validation(
                "a group needs at least one member besides the creator".into(),
            ));
        }

        let id = Uuid::new_v4();
        let mut tx = db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO conversations (id, kind, name, description, created_by)
            VALUES ($1, 'group', $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(&name)
        .bind(&description)
        .bind(creator)
        .execute(&mut *tx)
        .await?;

        MembershipService::add_member_tx(&mut tx, id, creator, MemberRole::Admin).await?;
        for member in &members {
            MembershipService::add_member_tx(&mut tx, id, *member, MemberRole::Member).await?;
        }
        tx.commit().await?;

        tracing::info!(conversation_id = %id, members = members.len() + 1, "group conversation created");
        Ok(id)
    }

    pub async fn get(db: &PgPool, id: Uuid) -> AppResult<Conversation> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, name, description, created_by, last_activity_at, created_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(AppError::NotFound)?;

        Ok(conversation_from_row(&row))
    }

    /// Bump the activity timestamp. Monotonic: concurrent touches merge via
    /// GREATEST, the timestamp never decreases.
    pub async fn touch_activity(db: &PgPool, id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE conversations SET last_activity_at = GREATEST(last_activity_at, now()) WHERE id = $1",
        )
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Admin-only rename/description edit.
    pub async fn update(
        db: &PgPool,
        id: Uuid,
        requester: Uuid,
        name: Option<String>,
        description: Option<String>,
    ) -> AppResult<Conversation> {
        MembershipService::require_admin(db, id, requester).await?;
        let conversation = Self::get(db, id).await?;

        let name = match (conversation.kind, name) {
            (ConversationKind::Group, Some(n)) => Some(validate_group_name(&n)?),
            (ConversationKind::Group, None) => conversation.name.clone(),
            // Private conversations never carry a display name.
            (ConversationKind::Private, _) => None,
        };
        validate_description(&description)?;

        let row = sqlx::query(
            r#"
            UPDATE conversations
            SET name = $2, description = $3, last_activity_at = GREATEST(last_activity_at, now())
            WHERE id = $1
            RETURNING id, kind, name, description, created_by, last_activity_at, created_at
            "#,
        )
        .bind(id)
        .bind(&name)
        .bind(&description)
        .fetch_one(db)
        .await?;

        Ok(conversation_from_row(&row))
    }

    /// A member leaves on their own. Removal and the deletion-policy decision
    /// run in one transaction with the conversation row locked, so concurrent
    /// leavers see consistent counts.
    pub async fn leave(db: &PgPool, conversation_id: Uuid, user_id: Uuid) -> AppResult<LeaveOutcome> {
        Self::remove_with_policy(db, conversation_id, user_id).await
    }

    /// An admin removes another member (groups only). Runs the same deletion
    /// policy as `leave`; with the admin still present a group can never hit
    /// zero members here.
    pub async fn remove_member(
        db: &PgPool,
        conversation_id: Uuid,
        requester: Uuid,
        target: Uuid,
    ) -> AppResult<LeaveOutcome> {
        if requester != target {
            let conversation = Self::get(db, conversation_id).await?;
            if conversation.kind != ConversationKind::Group {
                return Err(AppError::Forbidden);
            }
            MembershipService::require_admin(db, conversation_id, requester).await?;
        }
        Self::remove_with_policy(db, conversation_id, target).await
    }

    async fn remove_with_policy(
        db: &PgPool,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<LeaveOutcome> {
        let mut tx = db.begin().await?;

        let row = sqlx::query("SELECT kind FROM conversations WHERE id = $1 FOR UPDATE")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AppError::NotFound)?;
        let kind: String = row.get("kind");
        let kind = ConversationKind::parse(&kind);

        let remaining = match MembershipService::remove_member_tx(&mut tx, conversation_id, user_id)
            .await
        {
            Ok(remaining) => remaining,
            // Not being a member of an existing conversation is an
            // authorization failure, not a missing entity.
            Err(AppError::NotFound) => return Err(AppError::Forbidden),
            Err(e) => return Err(e),
        };

        let conversation_deleted = should_delete_after_leave(kind, remaining);
        if conversation_deleted {
            sqlx::query("DELETE FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(
                "UPDATE conversations SET last_activity_at = GREATEST(last_activity_at, now()) WHERE id = $1",
            )
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        if conversation_deleted {
            tracing::info!(%conversation_id, "conversation deleted after member left");
        }
        Ok(LeaveOutcome {
            remaining_members: if conversation_deleted { 0 } else { remaining },
            conversation_deleted,
        })
    }

    /// Explicit admin deletion. Memberships and messages go with the
    /// conversation via the schema's cascades.
    pub async fn delete(db: &PgPool, conversation_id: Uuid, requester: Uuid) -> AppResult<()> {
        MembershipService::require_admin(db, conversation_id, requester).await?;
        let deleted = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .execute(db)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        tracing::info!(%conversation_id, %requester, "conversation deleted by admin");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_name_is_trimmed_and_required() {
        assert!(validate_group_name("  team  ").is_ok_and(|n| n == "team"));
        assert!(matches!(
            validate_group_name("   "),
            Err(AppError::Validation(_))
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            validate_group_name(&long),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn description_length_is_bounded() {
        assert!(validate_description(&None).is_ok());
        assert!(validate_description(&Some("ok".into())).is_ok());
        let long = Some("x".repeat(MAX_DESCRIPTION_LEN + 1));
        assert!(matches!(
            validate_description(&long),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn deletion_policy_is_keyed_by_kind() {
        // Private: meaningless once it no longer serves two parties.
        assert!(should_delete_after_leave(ConversationKind::Private, 1));
        assert!(should_delete_after_leave(ConversationKind::Private, 0));
        assert!(!should_delete_after_leave(ConversationKind::Private, 2));
        // Group: persists while anyone remains, admin or not.
        assert!(!should_delete_after_leave(ConversationKind::Group, 2));
        assert!(!should_delete_after_leave(ConversationKind::Group, 1));
        assert!(should_delete_after_leave(ConversationKind::Group, 0));
    }
}
