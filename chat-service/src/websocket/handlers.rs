use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::guards::User;
use crate::services::membership_service::MembershipService;
use crate::state::AppState;
use crate::websocket::subscription::ConversationSubscription;

/// Revocations normally reach a subscription through the registry, but a
/// membership revoked by another instance only shows up in the store; this is
/// how often long-lived subscriptions re-check it.
const REVALIDATE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub conversation_id: Uuid,
}

/// Live channel for one conversation. Membership is re-checked on every
/// subscribe, never taken from a cached "was a member" decision.
pub async fn conversation_ws_handler(
    State(state): State<AppState>,
    user: User,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_conversation_socket(state, params.conversation_id, user.id, socket)
    })
}

async fn handle_conversation_socket(
    state: AppState,
    conversation_id: Uuid,
    user_id: Uuid,
    mut socket: WebSocket,
) {
    let mut subscription =
        ConversationSubscription::new(state.registry.clone(), conversation_id, user_id);

    // Denial is surfaced as a close, never treated as a server failure, and a
    // store error fails secure the same way.
    match subscription.authorize(&state.db).await {
        Ok(()) => {}
        Err(AppError::Forbidden) => {
            warn!(%user_id, %conversation_id, "subscription denied: not a member");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, %user_id, %conversation_id, "subscription denied: membership check failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    let (mut sender, mut receiver) = socket.split();
    let mut revalidate = tokio::time::interval(REVALIDATE_INTERVAL);
    revalidate.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            maybe = subscription.recv() => {
                match maybe {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Subscription ended: membership revoked mid-session or
                    // the registry shut down.
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Inbound frames are ignored; clients publish through the
                    // HTTP send path.
                    Some(Ok(_)) => {}
                }
            }
            _ = revalidate.tick() => {
                if MembershipService::require_member(&state.db, conversation_id, user_id)
                    .await
                    .is_err()
                {
                    warn!(%user_id, %conversation_id, "membership no longer valid; closing subscription");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    subscription.close().await;
}

/// Private per-user channel carrying cross-conversation notifications. The
/// channel belongs to the authenticated caller by construction, so there is
/// no membership predicate to evaluate.
pub async fn user_ws_handler(
    State(state): State<AppState>,
    user: User,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_user_socket(state, user.id, socket))
}

async fn handle_user_socket(state: AppState, user_id: Uuid, socket: WebSocket) {
    let (subscriber_id, mut rx) = state.registry.subscribe_user(user_id).await;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(msg) => {
                        if sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.registry.unsubscribe_user(user_id, subscriber_id).await;
}
