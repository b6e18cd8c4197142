//! Authorization guards that enforce permission checks at the type level:
//! handlers that need a verified member or admin take one as an argument
//! instead of remembering to check.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Member;
use crate::services::membership_service::MembershipService;

/// Caller identity. Authentication itself lives upstream; the auth layer
/// injects the verified id as `x-user-id` and this extractor is the seam
/// where that verdict enters.
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for User
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(AppError::Unauthorized)?;

        Ok(User { id })
    }
}

/// A verified conversation member.
#[derive(Debug, Clone)]
pub struct ConversationMember {
    pub member: Member,
}

impl ConversationMember {
    pub async fn verify(
        db: &PgPool,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Self, AppError> {
        let member = MembershipService::require_member(db, conversation_id, user_id).await?;
        Ok(ConversationMember { member })
    }
}

/// A verified conversation admin; stricter than `ConversationMember`.
#[derive(Debug, Clone)]
pub struct ConversationAdmin {
    pub member: Member,
}

impl ConversationAdmin {
    pub async fn verify(
        db: &PgPool,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> Result<Self, AppError> {
        let member = MembershipService::require_admin(db, conversation_id, user_id).await?;
        Ok(ConversationAdmin { member })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<User, AppError> {
        let (mut parts, _) = request.into_parts();
        User::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn extracts_the_injected_user_id() {
        let id = Uuid::new_v4();
        let request = Request::builder()
            .header("x-user-id", id.to_string())
            .body(())
            .unwrap();
        let user = extract(request).await.unwrap();
        assert_eq!(user.id, id);
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let request = Request::builder().body(()).unwrap();
        assert!(matches!(extract(request).await, Err(AppError::Unauthorized)));
    }

    #[tokio::test]
    async fn malformed_id_is_unauthorized() {
        let request = Request::builder()
            .header("x-user-id", "not-a-uuid")
            .body(())
            .unwrap();
        assert!(matches!(extract(request).await, Err(AppError::Unauthorized)));
    }
}
