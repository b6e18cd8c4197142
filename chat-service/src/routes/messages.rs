use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::guards::{ConversationMember, User};
use crate::models::{Message, MessageKind, UserProfile};
use crate::routes::conversations::HistoryParams;
use crate::services::membership_service::MembershipService;
use crate::services::message_service::{MessagePage, MessageService, ReplyPreview};
use crate::state::AppState;
use crate::websocket::events::{broadcast_event, AuthorPayload, ChatEvent, MessagePayload};

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    pub reply_to: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct UpdateMessageRequest {
    pub content: String,
}

#[derive(Serialize)]
pub struct MessageDto {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    pub is_edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    pub author: AuthorPayload,
    /// Preview of the quoted message; `None` with `reply_to` set on the raw
    /// message means the original was deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

impl MessageDto {
    fn build(message: &Message, author: &UserProfile, reply_to: Option<ReplyPreview>) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            content: message.content.clone(),
            kind: message.kind,
            created_at: message.created_at,
            is_edited: message.is_edited,
            edited_at: message.edited_at,
            author: AuthorPayload {
                id: author.id,
                name: author.name.clone(),
                email: Some(author.email.clone()),
            },
            reply_to,
        }
    }
}

/// Members whose personal channels should be pinged: everyone but the author,
/// minus members who muted the conversation. Conversation-channel delivery is
/// separate and unaffected by mutes.
async fn user_channel_recipients(
    state: &AppState,
    conversation_id: Uuid,
    author: Uuid,
) -> Result<Vec<Uuid>, AppError> {
    let members = MembershipService::list_members(&state.db, conversation_id).await?;
    Ok(members
        .iter()
        .filter(|m| m.user_id != author && !m.is_muted)
        .map(|m| m.user_id)
        .collect())
}

/// POST /conversations/:id/messages: persist, then fan out to everyone else.
/// The message is durably stored before any delivery is attempted, and no
/// delivery failure can fail this request.
pub async fn send_message(
    State(state): State<AppState>,
    user: User,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageDto>), AppError> {
    let message = MessageService::send(
        &state.db,
        conversation_id,
        user.id,
        &body.content,
        body.reply_to,
        MessageKind::Text,
    )
    .await?;

    let author = MessageService::sender_profile(&state.db, user.id).await?;
    let reply_preview = MessageService::reply_preview(&state.db, message.reply_to).await?;
    let recipients = user_channel_recipients(&state, conversation_id, user.id).await?;

    let event = ChatEvent::MessageCreated {
        message: MessagePayload::from_message(&message, &author),
    };
    if let Err(e) = broadcast_event(
        &state.registry,
        &state.redis,
        state.instance_id,
        conversation_id,
        user.id,
        &recipients,
        event,
    )
    .await
    {
        tracing::warn!(error = %e, %conversation_id, "message broadcast skipped");
    }

    Ok((
        StatusCode::CREATED,
        Json(MessageDto::build(&message, &author, reply_preview)),
    ))
}

/// GET /conversations/:id/messages: one page of ordered history; pass the
/// returned cursor back to resume.
pub async fn get_message_history(
    State(state): State<AppState>,
    user: User,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<MessagePage>, AppError> {
    ConversationMember::verify(&state.db, user.id, conversation_id).await?;
    let page = MessageService::list_page(
        &state.db,
        conversation_id,
        params.cursor(),
        params.limit.unwrap_or(50),
    )
    .await?;
    Ok(Json(page))
}

/// PUT /messages/:id: author-only edit; rebroadcast as `message.edited`.
pub async fn update_message(
    State(state): State<AppState>,
    user: User,
    Path(message_id): Path<Uuid>,
    Json(body): Json<UpdateMessageRequest>,
) -> Result<Json<MessageDto>, AppError> {
    let message = MessageService::edit(&state.db, message_id, user.id, &body.content).await?;
    let author = MessageService::sender_profile(&state.db, user.id).await?;
    let reply_preview = MessageService::reply_preview(&state.db, message.reply_to).await?;

    let event = ChatEvent::MessageEdited {
        message: MessagePayload::from_message(&message, &author),
    };
    if let Err(e) = broadcast_event(
        &state.registry,
        &state.redis,
        state.instance_id,
        message.conversation_id,
        user.id,
        &[],
        event,
    )
    .await
    {
        tracing::warn!(error = %e, conversation_id = %message.conversation_id, "edit broadcast skipped");
    }

    Ok(Json(MessageDto::build(&message, &author, reply_preview)))
}

/// DELETE /messages/:id: author or conversation admin. Replies to the
/// removed message stay, with their reference left dangling.
pub async fn delete_message(
    State(state): State<AppState>,
    user: User,
    Path(message_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let message = MessageService::delete(&state.db, message_id, user.id).await?;

    let event = ChatEvent::MessageDeleted {
        message_id: message.id,
    };
    if let Err(e) = broadcast_event(
        &state.registry,
        &state.redis,
        state.instance_id,
        message.conversation_id,
        user.id,
        &[],
        event,
    )
    .await
    {
        tracing::warn!(error = %e, conversation_id = %message.conversation_id, "delete broadcast skipped");
    }

    Ok(StatusCode::NO_CONTENT)
}
