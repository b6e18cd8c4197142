use axum::extract::ws::Message;
use sqlx::PgPool;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::membership_service::MembershipService;
use crate::websocket::ConnectionRegistry;

/// Lifecycle of one (conversation, user) subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unauthorized,
    Authorized,
    Closed,
}

/// A conversation-channel subscription that only hands out a receiver after
/// the subscribing user's membership was verified against current state.
///
/// Transitions: `Unauthorized -> Authorized` on a successful membership check
/// at subscribe time (never a cached decision); `Authorized -> Closed` on
/// explicit close, on disconnect, or when the registry invalidates the
/// subscription because membership was revoked. A denied authorization leaves
/// the subscription `Unauthorized`: a denial, not a failure of the service.
pub struct ConversationSubscription {
    conversation_id: Uuid,
    user_id: Uuid,
    state: SubscriptionState,
    subscriber_id: Option<Uuid>,
    rx: Option<UnboundedReceiver<Message>>,
    registry: ConnectionRegistry,
}

impl ConversationSubscription {
    pub fn new(registry: ConnectionRegistry, conversation_id: Uuid, user_id: Uuid) -> Self {
        Self {
            conversation_id,
            user_id,
            state: SubscriptionState::Unauthorized,
            subscriber_id: None,
            rx: None,
            registry,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Re-check membership against the store and, if the user is a current
    /// member, attach to the conversation channel.
    pub async fn authorize(&mut self, db: &PgPool) -> AppResult<()> {
        if self.state != SubscriptionState::Unauthorized {
            return Err(AppError::Conflict("subscription already used".into()));
        }
        MembershipService::require_member(db, self.conversation_id, self.user_id).await?;
        self.attach().await;
        Ok(())
    }

    async fn attach(&mut self) {
        let (id, rx) = self
            .registry
            .subscribe_conversation(self.conversation_id, self.user_id)
            .await;
        self.subscriber_id = Some(id);
        self.rx = Some(rx);
        self.state = SubscriptionState::Authorized;
    }

    /// Next event, or `None` once the subscription ends. Either side can end
    /// it: an explicit `close`, or the registry dropping the sender after
    /// membership revocation.
    pub async fn recv(&mut self) -> Option<Message> {
        let rx = self.rx.as_mut()?;
        let msg = rx.recv().await;
        if msg.is_none() {
            self.state = SubscriptionState::Closed;
        }
        msg
    }

    pub async fn close(&mut self) {
        if let Some(id) = self.subscriber_id.take() {
            self.registry
                .unsubscribe_conversation(self.conversation_id, id)
                .await;
        }
        self.rx = None;
        self.state = SubscriptionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(registry: &ConnectionRegistry) -> ConversationSubscription {
        ConversationSubscription::new(registry.clone(), Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn starts_unauthorized_without_a_receiver() {
        let registry = ConnectionRegistry::new();
        let mut sub = subscription(&registry);
        assert_eq!(sub.state(), SubscriptionState::Unauthorized);
        // No receiver attached: recv resolves immediately with None.
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn attach_authorizes_and_receives_broadcasts() {
        let registry = ConnectionRegistry::new();
        let mut sub = subscription(&registry);
        sub.attach().await;
        assert_eq!(sub.state(), SubscriptionState::Authorized);

        registry
            .broadcast_conversation(sub.conversation_id(), None, Message::Text("hi".into()))
            .await;
        assert_eq!(sub.recv().await, Some(Message::Text("hi".into())));
    }

    #[tokio::test]
    async fn revoking_membership_closes_the_subscription() {
        let registry = ConnectionRegistry::new();
        let mut sub = subscription(&registry);
        sub.attach().await;

        registry
            .close_member(sub.conversation_id(), sub.user_id())
            .await;
        assert!(sub.recv().await.is_none());
        assert_eq!(sub.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn explicit_close_detaches_from_the_registry() {
        let registry = ConnectionRegistry::new();
        let mut sub = subscription(&registry);
        sub.attach().await;
        assert_eq!(
            registry
                .conversation_subscriber_count(sub.conversation_id())
                .await,
            1
        );

        sub.close().await;
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(
            registry
                .conversation_subscriber_count(sub.conversation_id())
                .await,
            0
        );
    }
}
