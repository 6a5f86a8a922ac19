use boardsync::error::Error as BoardsyncError;
use std::fmt;

/// Internal error type for the memory gateway
#[derive(Debug)]
pub enum Error {
	Unavailable(String),
	Duplicate(String),
	Constraint(String),
	NotFound(String),
	InvalidRow(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Error::Unavailable(msg) => write!(f, "gateway unavailable: {}", msg),
			Error::Duplicate(msg) => write!(f, "duplicate key: {}", msg),
			Error::Constraint(msg) => write!(f, "constraint violation: {}", msg),
			Error::NotFound(msg) => write!(f, "row not found: {}", msg),
			Error::InvalidRow(msg) => write!(f, "invalid row: {}", msg),
		}
	}
}

impl std::error::Error for Error {}

impl From<Error> for BoardsyncError {
	fn from(e: Error) -> Self {
		match e {
			Error::Unavailable(_) => BoardsyncError::TransientFailure(e.to_string()),
			Error::NotFound(_) => BoardsyncError::NotFound,
			Error::Duplicate(_) | Error::Constraint(_) | Error::InvalidRow(_) => {
				BoardsyncError::RejectedChange(e.to_string())
			}
		}
	}
}

// vim: ts=4
