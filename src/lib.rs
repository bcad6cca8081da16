//! Keyword monitor for Showstart activities.
//!
//! Polls the Showstart WAP API for configured keywords and pushes a webhook
//! notification when a matching activity opens timed purchase (and,
//! optionally, when it first appears). Dedup state survives restarts.

pub mod auth;
pub mod client;
pub mod config;
pub mod monitor;
pub mod notify;
pub mod store;
