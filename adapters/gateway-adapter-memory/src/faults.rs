//! Fault injection for exercising rollback, timeout and reconnect paths.

use serde_json::Value;
use std::collections::VecDeque;

/// Outcome forced on the next request instead of the normal one.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
	/// Network failure (maps to `TransientFailure`).
	Unavailable(String),
	/// Validation or permission refusal (maps to `RejectedChange`).
	Reject(String),
	/// Succeed without applying anything and return this raw body.
	Malformed(Value),
}

#[derive(Debug, Default)]
pub(crate) struct FaultPlan {
	pub(crate) requests: VecDeque<Fault>,
	pub(crate) subscribe_failures: usize,
}

impl FaultPlan {
	pub(crate) fn next_request(&mut self) -> Option<Fault> {
		self.requests.pop_front()
	}

	pub(crate) fn take_subscribe_failure(&mut self) -> bool {
		if self.subscribe_failures == 0 {
			return false;
		}
		self.subscribe_failures -= 1;
		true
	}
}

// vim: ts=4
