pub mod chat;
pub mod events;
pub mod extract;
pub mod transcript;
