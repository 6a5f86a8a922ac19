//! Boardsync keeps a local, instantly updated copy of a collaborative board.
//!
//! # Features
//!
//! - Optimistic mutations
//!     - changes are visible in the cache before the server answers
//!     - failed changes are rolled back, unless something newer was written since
//!     - requests time out, late answers are discarded
//! - Realtime change feed
//!     - one subscription per collection and filter
//!     - automatic reconnect with exponential backoff
//! - Domain stores
//!     - board (columns and tasks)
//!     - chat (messages by channel)
//!     - presence (status and typing indicator per user)

// Re-export shared types and the store core
pub use boardsync_types::error;
pub use boardsync_types::gateway_adapter;
pub use boardsync_types::model;
pub use boardsync_types::types;
pub use boardsync_types::utils;

pub use boardsync_store as store;

// Local modules
pub mod board;
pub mod chat;
pub mod config;
pub mod prelude;
pub mod presence;
pub mod session;

pub use crate::board::BoardStore;
pub use crate::chat::ChatStore;
pub use crate::config::SessionConfig;
pub use crate::presence::PresenceStore;
pub use crate::session::{Session, SessionBuilder};

// vim: ts=4
