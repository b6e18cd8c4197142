use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Private,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Private => "private",
            ConversationKind::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "group" => ConversationKind::Group,
            _ => ConversationKind::Private,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub kind: ConversationKind,
    /// Required for groups, always None for private conversations.
    pub name: Option<String>,
    pub description: Option<String>,
    /// Nullable: a conversation outlives its creator.
    pub created_by: Option<Uuid>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Canonical key identifying the unordered pair of parties of a private
/// conversation. The unique index over this key is what serializes
/// dedup-on-create under concurrent requests.
pub fn pair_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_key(a, b), pair_key(b, a));
    }

    #[test]
    fn pair_key_distinguishes_pairs() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert_ne!(pair_key(a, b), pair_key(a, c));
    }

    #[test]
    fn kind_round_trips_through_strings() {
        assert_eq!(ConversationKind::parse("group"), ConversationKind::Group);
        assert_eq!(ConversationKind::parse("private"), ConversationKind::Private);
        assert_eq!(ConversationKind::Group.as_str(), "group");
    }
}
