#![deny(unsafe_code)]

/// Session gate and the application event loop.
pub mod app;
/// Login and signup form state.
pub mod auth;
/// Conversation view, peer sidebar and message sending.
pub mod chat;
pub mod notification;
/// Settings persistence.
pub mod settings;
pub mod terminal;
