//! Optimistic mutation store.
//!
//! - [`cache::EntityCache`]: normalized, revisioned entity storage with secondary
//!   indexes and change notifications
//! - [`mutation::MutationEngine`]: optimistic apply, then confirm or conditionally
//!   roll back
//! - [`feed::ChangeFeed`]: applies authoritative change events from the gateway

pub mod boundary;
pub mod cache;
pub mod feed;
pub mod index;
pub mod merge;
pub mod mutation;

mod prelude;

pub use cache::{CacheChange, ChangeKind, ConfirmOutcome, EntityCache};
pub use feed::{ChangeFeed, FeedConfig, SubscriptionHandle, SubscriptionState, apply_event};
pub use index::IndexDef;
pub use mutation::{MutationEngine, MutationHandle, MutationToken, PendingMutation, ProposedChange};

// vim: ts=4
