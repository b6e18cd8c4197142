pub mod conversation_service;
pub mod membership_service;
pub mod message_service;
pub mod unread_service;
