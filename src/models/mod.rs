pub mod chat;
pub mod echo;
