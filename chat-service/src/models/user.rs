use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Read-only view of a row in the identity service's users mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}
