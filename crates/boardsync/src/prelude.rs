pub use boardsync_types::prelude::*;

pub use boardsync_store::{MutationHandle, SubscriptionHandle, SubscriptionState};

// vim: ts=4
