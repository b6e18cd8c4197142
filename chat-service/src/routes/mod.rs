use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::state::AppState;
use crate::websocket::handlers::{conversation_ws_handler, user_ws_handler};

pub mod conversations;
pub mod messages;

use conversations::{
    add_member, create_conversation, create_group_conversation, delete_conversation,
    get_conversation, leave_conversation, list_conversations, list_members, mark_as_read,
    remove_member, set_muted, update_conversation,
};
use messages::{delete_message, get_message_history, send_message, update_message};

pub fn build_router() -> Router<AppState> {
    // Introspection stays outside the API prefix so healthchecks need no auth.
    let introspection = Router::new().route("/health", get(|| async { "OK" }));

    let api_v1 = Router::new()
        // Conversations
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/groups", post(create_group_conversation))
        .route(
            "/conversations/:id",
            get(get_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        )
        .route("/conversations/:id/leave", post(leave_conversation))
        .route("/conversations/:id/read", post(mark_as_read))
        // Membership
        .route(
            "/conversations/:id/members",
            get(list_members).post(add_member),
        )
        .route("/conversations/:id/members/:user_id", delete(remove_member))
        .route("/conversations/:id/members/me/mute", put(set_muted))
        // Messages
        .route(
            "/conversations/:id/messages",
            get(get_message_history).post(send_message),
        )
        .route("/messages/:id", put(update_message).delete(delete_message))
        // Live channels
        .route("/ws", get(conversation_ws_handler))
        .route("/ws/user", get(user_ws_handler));

    let router = introspection.merge(Router::new().nest("/api/v1", api_v1));
    crate::middleware::with_defaults(router)
}
