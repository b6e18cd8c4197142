use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use uuid::Uuid;

pub mod events;
pub mod handlers;
pub mod pubsub;
pub mod subscription;

struct ConversationSubscriber {
    id: Uuid,
    user_id: Uuid,
    tx: UnboundedSender<Message>,
}

struct UserSubscriber {
    id: Uuid,
    tx: UnboundedSender<Message>,
}

/// Process-wide set of live subscriptions: one channel per conversation, one
/// private channel per user. Created at service start, dropped at shutdown,
/// and mutated only through this API; components never reach into it.
///
/// Delivery is best-effort, at-most-once per connected subscriber: a send
/// into a gone channel prunes the subscriber and is otherwise dropped.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    conversations: Arc<RwLock<HashMap<Uuid, Vec<ConversationSubscriber>>>>,
    users: Arc<RwLock<HashMap<Uuid, Vec<UserSubscriber>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber to a conversation channel. Callers go through
    /// `subscription::ConversationSubscription`, which owns the membership
    /// check; the registry itself does not authorize.
    pub(crate) async fn subscribe_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> (Uuid, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let id = Uuid::new_v4();
        let mut guard = self.conversations.write().await;
        guard
            .entry(conversation_id)
            .or_default()
            .push(ConversationSubscriber { id, user_id, tx });
        (id, rx)
    }

    pub async fn subscribe_user(&self, user_id: Uuid) -> (Uuid, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let id = Uuid::new_v4();
        let mut guard = self.users.write().await;
        guard
            .entry(user_id)
            .or_default()
            .push(UserSubscriber { id, tx });
        (id, rx)
    }

    pub(crate) async fn unsubscribe_conversation(&self, conversation_id: Uuid, subscriber_id: Uuid) {
        let mut guard = self.conversations.write().await;
        if let Some(list) = guard.get_mut(&conversation_id) {
            list.retain(|sub| sub.id != subscriber_id);
            if list.is_empty() {
                guard.remove(&conversation_id);
            }
        }
    }

    pub async fn unsubscribe_user(&self, user_id: Uuid, subscriber_id: Uuid) {
        let mut guard = self.users.write().await;
        if let Some(list) = guard.get_mut(&user_id) {
            list.retain(|sub| sub.id != subscriber_id);
            if list.is_empty() {
                guard.remove(&user_id);
            }
        }
    }

    /// Push a payload to every connected subscriber of the conversation,
    /// skipping `except_user` (the author already has the message from the
    /// synchronous response). Dead subscribers are pruned, per-subscriber
    /// failures never propagate. Returns the number of deliveries.
    pub async fn broadcast_conversation(
        &self,
        conversation_id: Uuid,
        except_user: Option<Uuid>,
        msg: Message,
    ) -> usize {
        let mut delivered = 0;
        let mut guard = self.conversations.write().await;
        if let Some(list) = guard.get_mut(&conversation_id) {
            list.retain(|sub| {
                if Some(sub.user_id) == except_user {
                    return true;
                }
                match sub.tx.send(msg.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(_) => false,
                }
            });
            if list.is_empty() {
                guard.remove(&conversation_id);
            }
        }
        delivered
    }

    /// Push a payload to every connection on a user's private channel.
    pub async fn notify_user(&self, user_id: Uuid, msg: Message) -> usize {
        let mut delivered = 0;
        let mut guard = self.users.write().await;
        if let Some(list) = guard.get_mut(&user_id) {
            list.retain(|sub| match sub.tx.send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            });
            if list.is_empty() {
                guard.remove(&user_id);
            }
        }
        delivered
    }

    /// Invalidate every subscription a user holds on a conversation channel.
    /// Called when membership is revoked so a removed member stops receiving
    /// events mid-session; their receivers end and the sockets close.
    pub async fn close_member(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut guard = self.conversations.write().await;
        if let Some(list) = guard.get_mut(&conversation_id) {
            list.retain(|sub| sub.user_id != user_id);
            if list.is_empty() {
                guard.remove(&conversation_id);
            }
        }
    }

    /// Drop every subscription on a conversation channel (conversation
    /// deleted).
    pub async fn close_conversation(&self, conversation_id: Uuid) {
        self.conversations.write().await.remove(&conversation_id);
    }

    pub async fn conversation_subscriber_count(&self, conversation_id: Uuid) -> usize {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    #[tokio::test]
    async fn broadcast_skips_the_author() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_, mut alice_rx) = registry.subscribe_conversation(conversation, alice).await;
        let (_, mut bob_rx) = registry.subscribe_conversation(conversation, bob).await;

        let delivered = registry
            .broadcast_conversation(conversation, Some(alice), text("hi"))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(bob_rx.recv().await, Some(text("hi")));
        // Alice got nothing: her channel is empty, not closed.
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_other_member() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let author = Uuid::new_v4();

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (_, rx) = registry
                .subscribe_conversation(conversation, Uuid::new_v4())
                .await;
            receivers.push(rx);
        }

        let delivered = registry
            .broadcast_conversation(conversation, Some(author), text("fan-out"))
            .await;
        assert_eq!(delivered, 3);
        for rx in &mut receivers {
            assert_eq!(rx.recv().await, Some(text("fan-out")));
        }
    }

    #[tokio::test]
    async fn revoked_member_stops_receiving() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_, mut alice_rx) = registry.subscribe_conversation(conversation, alice).await;
        let (_, mut bob_rx) = registry.subscribe_conversation(conversation, bob).await;

        registry.close_member(conversation, bob).await;

        // Bob's receiver ends; Alice is unaffected.
        assert_eq!(bob_rx.recv().await, None);
        registry
            .broadcast_conversation(conversation, None, text("after"))
            .await;
        assert_eq!(alice_rx.recv().await, Some(text("after")));
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned_without_failing_the_publish() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let alive = Uuid::new_v4();

        let (_, gone_rx) = registry
            .subscribe_conversation(conversation, Uuid::new_v4())
            .await;
        let (_, mut alive_rx) = registry.subscribe_conversation(conversation, alive).await;
        drop(gone_rx);

        let delivered = registry
            .broadcast_conversation(conversation, None, text("still works"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(alive_rx.recv().await, Some(text("still works")));
        assert_eq!(registry.conversation_subscriber_count(conversation).await, 1);
    }

    #[tokio::test]
    async fn closing_the_conversation_ends_every_subscription() {
        let registry = ConnectionRegistry::new();
        let conversation = Uuid::new_v4();
        let (_, mut rx_a) = registry
            .subscribe_conversation(conversation, Uuid::new_v4())
            .await;
        let (_, mut rx_b) = registry
            .subscribe_conversation(conversation, Uuid::new_v4())
            .await;

        registry.close_conversation(conversation).await;

        assert_eq!(rx_a.recv().await, None);
        assert_eq!(rx_b.recv().await, None);
        assert_eq!(registry.conversation_subscriber_count(conversation).await, 0);
    }

    #[tokio::test]
    async fn user_channels_deliver_per_connection() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (_, mut rx_phone) = registry.subscribe_user(user).await;
        let (_, mut rx_laptop) = registry.subscribe_user(user).await;

        let delivered = registry.notify_user(user, text("ping")).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx_phone.recv().await, Some(text("ping")));
        assert_eq!(rx_laptop.recv().await, Some(text("ping")));

        // Nothing for someone with no connections.
        assert_eq!(registry.notify_user(Uuid::new_v4(), text("ping")).await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_connection() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();

        let (id_phone, mut rx_phone) = registry.subscribe_user(user).await;
        let (_, mut rx_laptop) = registry.subscribe_user(user).await;

        registry.unsubscribe_user(user, id_phone).await;
        assert_eq!(rx_phone.recv().await, None);

        registry.notify_user(user, text("still here")).await;
        assert_eq!(rx_laptop.recv().await, Some(text("still here")));
    }
}
