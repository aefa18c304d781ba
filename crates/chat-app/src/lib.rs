#![deny(unsafe_code)]

/// Service wiring shared by every view.
pub mod app;
/// Plan catalog and checkout.
pub mod billing;
/// Conversation view, exchange client and message types.
pub mod chat;
pub mod repl;
/// Session gate and the local identity provider.
pub mod session;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;
