pub use boardsync_types::error::{Error, SyncResult};
pub use boardsync_types::types::{Collection, Entity, EntityId, Revision};

pub use tracing::{debug, info, warn};

// vim: ts=4
