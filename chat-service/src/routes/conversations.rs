use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::guards::{ConversationAdmin, ConversationMember, User};
use crate::models::{Conversation, ConversationKind, Member, MemberRole};
use crate::services::conversation_service::ConversationService;
use crate::services::membership_service::MembershipService;
use crate::services::message_service::{MessagePage, MessageService, PageCursor};
use crate::services::unread_service::{ConversationSummary, UnreadService};
use crate::state::AppState;
use crate::websocket::events::{broadcast_event, ChatEvent};

#[derive(Deserialize)]
pub struct CreatePrivateRequest {
    pub peer_id: Uuid,
}

#[derive(Serialize)]
pub struct PrivateConversationResponse {
    pub id: Uuid,
    /// False when an existing conversation for the pair was returned.
    pub created: bool,
}

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: Option<String>,
    pub member_ids: Vec<Uuid>,
}

#[derive(Deserialize)]
pub struct UpdateConversationRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    pub role: Option<MemberRole>,
}

#[derive(Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Serialize)]
pub struct LeaveResponse {
    pub remaining_members: i64,
    pub conversation_deleted: bool,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub after: Option<DateTime<Utc>>,
    pub after_id: Option<Uuid>,
    pub limit: Option<i64>,
}

impl HistoryParams {
    pub fn cursor(&self) -> Option<PageCursor> {
        match (self.after, self.after_id) {
            (Some(created_at), Some(id)) => Some(PageCursor { created_at, id }),
            _ => None,
        }
    }
}

#[derive(Serialize)]
pub struct ConversationDetailResponse {
    pub conversation: Conversation,
    pub members: Vec<Member>,
    pub messages: MessagePage,
}

/// GET /conversations: the caller's conversations, most recently active
/// first, with last-message previews and unread counts.
pub async fn list_conversations(
    State(state): State<AppState>,
    user: User,
) -> Result<Json<Vec<ConversationSummary>>, AppError> {
    let summaries = UnreadService::summaries_for_user(&state.db, user.id).await?;
    Ok(Json(summaries))
}

/// POST /conversations: create (or return the existing) private
/// conversation with another user.
pub async fn create_conversation(
    State(state): State<AppState>,
    user: User,
    Json(body): Json<CreatePrivateRequest>,
) -> Result<(StatusCode, Json<PrivateConversationResponse>), AppError> {
    let (id, created) = ConversationService::create_private(&state.db, user.id, body.peer_id).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(PrivateConversationResponse { id, created })))
}

/// POST /conversations/groups
pub async fn create_group_conversation(
    State(state): State<AppState>,
    user: User,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<Conversation>), AppError> {
    let id = ConversationService::create_group(
        &state.db,
        user.id,
        &body.name,
        body.description,
        &body.member_ids,
    )
    .await?;
    let conversation = ConversationService::get(&state.db, id).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /conversations/:id: detail plus one page of history.
pub async fn get_conversation(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<ConversationDetailResponse>, AppError> {
    ConversationMember::verify(&state.db, user.id, id).await?;

    let conversation = ConversationService::get(&state.db, id).await?;
    let members = MembershipService::list_members(&state.db, id).await?;
    let messages =
        MessageService::list_page(&state.db, id, params.cursor(), params.limit.unwrap_or(50))
            .await?;

    Ok(Json(ConversationDetailResponse {
        conversation,
        members,
        messages,
    }))
}

/// PUT /conversations/:id: admin-only rename/description edit.
pub async fn update_conversation(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateConversationRequest>,
) -> Result<Json<Conversation>, AppError> {
    let conversation =
        ConversationService::update(&state.db, id, user.id, body.name, body.description).await?;

    let event = ChatEvent::ConversationUpdated {
        name: conversation.name.clone(),
        description: conversation.description.clone(),
    };
    if let Err(e) = broadcast_event(
        &state.registry,
        &state.redis,
        state.instance_id,
        id,
        user.id,
        &[],
        event,
    )
    .await
    {
        tracing::warn!(error = %e, conversation_id = %id, "update broadcast skipped");
    }

    Ok(Json(conversation))
}

/// DELETE /conversations/:id: explicit admin deletion; cascades and closes
/// every live subscription on the channel.
pub async fn delete_conversation(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    ConversationService::delete(&state.db, id, user.id).await?;
    state.registry.close_conversation(id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /conversations/:id/leave
pub async fn leave_conversation(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<LeaveResponse>, AppError> {
    let outcome = ConversationService::leave(&state.db, id, user.id).await?;

    if outcome.conversation_deleted {
        state.registry.close_conversation(id).await;
    } else {
        state.registry.close_member(id, user.id).await;
        let event = ChatEvent::MemberLeft { user_id: user.id };
        if let Err(e) = broadcast_event(
            &state.registry,
            &state.redis,
            state.instance_id,
            id,
            user.id,
            &[],
            event,
        )
        .await
        {
            tracing::warn!(error = %e, conversation_id = %id, "leave broadcast skipped");
        }
    }

    Ok(Json(LeaveResponse {
        remaining_members: outcome.remaining_members,
        conversation_deleted: outcome.conversation_deleted,
    }))
}

/// GET /conversations/:id/members
pub async fn list_members(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Member>>, AppError> {
    ConversationMember::verify(&state.db, user.id, id).await?;
    let members = MembershipService::list_members(&state.db, id).await?;
    Ok(Json(members))
}

/// POST /conversations/:id/members: admin-only, and only groups accept new
/// members; a private conversation is closed to third parties.
pub async fn add_member(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
    Json(body): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<Member>), AppError> {
    let conversation = ConversationService::get(&state.db, id).await?;
    if conversation.kind != ConversationKind::Group {
        return Err(AppError::Forbidden);
    }
    ConversationAdmin::verify(&state.db, user.id, id).await?;

    let role = body.role.unwrap_or(MemberRole::Member);
    let member = MembershipService::add_member(&state.db, id, body.user_id, role).await?;
    ConversationService::touch_activity(&state.db, id).await?;

    let event = ChatEvent::MemberJoined {
        user_id: member.user_id,
        role: member.role,
    };
    if let Err(e) = broadcast_event(
        &state.registry,
        &state.redis,
        state.instance_id,
        id,
        user.id,
        &[],
        event,
    )
    .await
    {
        tracing::warn!(error = %e, conversation_id = %id, "member broadcast skipped");
    }

    Ok((StatusCode::CREATED, Json(member)))
}

/// DELETE /conversations/:id/members/:user_id: self-removal, or admin
/// removal of another member (groups only).
pub async fn remove_member(
    State(state): State<AppState>,
    user: User,
    Path((id, target)): Path<(Uuid, Uuid)>,
) -> Result<Json<LeaveResponse>, AppError> {
    let outcome = ConversationService::remove_member(&state.db, id, user.id, target).await?;

    if outcome.conversation_deleted {
        state.registry.close_conversation(id).await;
    } else {
        state.registry.close_member(id, target).await;
        let event = ChatEvent::MemberLeft { user_id: target };
        if let Err(e) = broadcast_event(
            &state.registry,
            &state.redis,
            state.instance_id,
            id,
            user.id,
            &[],
            event,
        )
        .await
        {
            tracing::warn!(error = %e, conversation_id = %id, "member broadcast skipped");
        }
    }

    Ok(Json(LeaveResponse {
        remaining_members: outcome.remaining_members,
        conversation_deleted: outcome.conversation_deleted,
    }))
}

/// PUT /conversations/:id/members/me/mute
pub async fn set_muted(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
    Json(body): Json<MuteRequest>,
) -> Result<StatusCode, AppError> {
    MembershipService::set_muted(&state.db, id, user.id, body.muted).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /conversations/:id/read: advance the caller's read cursor to now.
pub async fn mark_as_read(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    UnreadService::mark_read(&state.db, id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}
