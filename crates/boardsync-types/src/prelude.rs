pub use crate::error::{Error, SyncResult};
pub use crate::types::{Collection, Entity, EntityId, Revision};
pub use crate::utils::now;

pub use tracing::{debug, error, info, warn};

// vim: ts=4
