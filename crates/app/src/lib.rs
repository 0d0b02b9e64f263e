#![deny(unsafe_code)]

/// Terminal front-end: landing prompt, chat loop and CLI.
pub mod app;
/// Chat domain: initiator, transcript and session lifecycle.
pub mod chat;
/// Settings persistence.
pub mod settings;
