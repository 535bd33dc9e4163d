//! Core domain + application logic for the Jira mail notifier.
//!
//! This crate is framework-agnostic. Telegram, IMAP and the OAuth redirect
//! server live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod conversation;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod jira;
pub mod logging;
pub mod mailbox;
pub mod messaging;
pub mod oauth;
pub mod poller;
pub mod quiet;
pub mod store;

pub use errors::{Error, Result};
