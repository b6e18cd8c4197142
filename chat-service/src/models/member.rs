use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Moderator,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Moderator => "moderator",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "admin" => MemberRole::Admin,
            "moderator" => MemberRole::Moderator,
            _ => MemberRole::Member,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, MemberRole::Admin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    pub joined_at: DateTime<Utc>,
    /// None means "never read, all messages unread".
    pub last_read_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_strings() {
        for role in [MemberRole::Admin, MemberRole::Moderator, MemberRole::Member] {
            assert_eq!(MemberRole::parse(role.as_str()), role);
        }
    }

    #[test]
    fn unknown_role_defaults_to_member() {
        assert_eq!(MemberRole::parse("owner"), MemberRole::Member);
    }
}
