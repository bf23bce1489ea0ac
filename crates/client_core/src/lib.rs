pub mod auth;
pub mod cache;
pub mod channel;
pub mod config;
pub mod conversation;
pub mod counters;
pub mod engine;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod rest;
pub mod screens;
pub mod transport;

pub use auth::{AuthSource, Session, SessionStore};
pub use channel::{CanonicalEvent, ChannelManager, ConnectionStatus};
pub use config::{load_settings, SyncSettings};
pub use conversation::{Delivery, Message};
pub use counters::NotificationCounters;
pub use engine::{ClientEvent, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use history::LoadOlder;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
