pub mod conversation;
pub mod member;
pub mod message;
pub mod user;

pub use conversation::{Conversation, ConversationKind};
pub use member::{Member, MemberRole};
pub use message::{Message, MessageKind};
pub use user::UserProfile;
