//! Error taxonomy shared by the store, the session layer and gateway adapters.

use std::fmt;

use crate::types::{Collection, EntityId};

pub type SyncResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// Network or timeout failure talking to the gateway. Retryable.
	TransientFailure(String),
	/// The gateway rejected the change (validation, authorization). Not retryable as-is.
	RejectedChange(String),
	/// A local precondition failed before anything was applied (patch target absent).
	StaleEntity { collection: Collection, id: EntityId },
	/// Cache or gateway lookup miss.
	NotFound,
	/// Gateway data did not have the expected shape.
	MalformedResponse(String),
	/// The subscription handle was closed and must be recreated.
	SubscriptionClosed,
	ConfigError(String),
	Internal(String),
}

impl Error {
	/// Only transient failures are worth offering a "retry" for.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::TransientFailure(_))
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::TransientFailure(msg) => write!(f, "transient failure: {}", msg),
			Error::RejectedChange(msg) => write!(f, "change rejected: {}", msg),
			Error::StaleEntity { collection, id } => {
				write!(f, "stale entity: {}/{} is not in the cache", collection, id)
			}
			Error::NotFound => write!(f, "not found"),
			Error::MalformedResponse(msg) => write!(f, "malformed response: {}", msg),
			Error::SubscriptionClosed => write!(f, "subscription closed"),
			Error::ConfigError(msg) => write!(f, "config error: {}", msg),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::MalformedResponse(err.to_string())
	}
}

impl From<tokio::time::error::Elapsed> for Error {
	fn from(_err: tokio::time::error::Elapsed) -> Self {
		Error::TransientFailure("request timed out".to_string())
	}
}


// vim: ts=4
