//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::prelude::*;
use boardsync_store::FeedConfig;

pub const ENV_MUTATION_TIMEOUT_MS: &str = "BOARDSYNC_MUTATION_TIMEOUT_MS";
pub const ENV_RECONNECT_INITIAL_MS: &str = "BOARDSYNC_RECONNECT_INITIAL_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "BOARDSYNC_RECONNECT_MAX_MS";
pub const ENV_CHANGE_BUFFER: &str = "BOARDSYNC_CHANGE_BUFFER";

/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
	/// After this long a pending mutation is rolled back as a transient failure.
	#[serde(with = "duration_ms")]
	pub mutation_timeout: Duration,
	#[serde(with = "duration_ms")]
	pub reconnect_initial_delay: Duration,
	#[serde(with = "duration_ms")]
	pub reconnect_max_delay: Duration,
	/// Capacity of the cache change broadcast.
	pub change_buffer: usize,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			mutation_timeout: Duration::from_secs(10),
			reconnect_initial_delay: Duration::from_millis(250),
			reconnect_max_delay: Duration::from_secs(30),
			change_buffer: 256,
		}
	}
}

impl SessionConfig {
	/// Defaults overlaid with `BOARDSYNC_*` environment variables.
	pub fn from_env() -> SyncResult<Self> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Defaults overlaid with the values `lookup` returns for the `BOARDSYNC_*` names.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
		let mut cfg = Self::default();

		if let Some(v) = lookup(ENV_MUTATION_TIMEOUT_MS) {
			cfg.mutation_timeout = Duration::from_millis(parse_u64(ENV_MUTATION_TIMEOUT_MS, &v)?);
		}
		if let Some(v) = lookup(ENV_RECONNECT_INITIAL_MS) {
			cfg.reconnect_initial_delay =
				Duration::from_millis(parse_u64(ENV_RECONNECT_INITIAL_MS, &v)?);
		}
		if let Some(v) = lookup(ENV_RECONNECT_MAX_MS) {
			cfg.reconnect_max_delay = Duration::from_millis(parse_u64(ENV_RECONNECT_MAX_MS, &v)?);
		}
		if let Some(v) = lookup(ENV_CHANGE_BUFFER) {
			let buffer = parse_u64(ENV_CHANGE_BUFFER, &v)?;
			cfg.change_buffer = usize::try_from(buffer).map_err(|_| {
				Error::ConfigError(format!("{} is out of range: {}", ENV_CHANGE_BUFFER, buffer))
			})?;
		}

		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> SyncResult<()> {
		if self.mutation_timeout.is_zero() {
			return Err(Error::ConfigError("mutation timeout must be greater than 0".into()));
		}
		if self.reconnect_initial_delay.is_zero() {
			return Err(Error::ConfigError("reconnect initial delay must be greater than 0".into()));
		}
		if self.reconnect_max_delay < self.reconnect_initial_delay {
			return Err(Error::ConfigError(format!(
				"reconnect max delay ({:?}) is shorter than the initial delay ({:?})",
				self.reconnect_max_delay, self.reconnect_initial_delay
			)));
		}
		if self.change_buffer == 0 {
			return Err(Error::ConfigError("change buffer must be greater than 0".into()));
		}
		Ok(())
	}

	pub fn feed_config(&self) -> FeedConfig {
		FeedConfig {
			reconnect_initial_delay: self.reconnect_initial_delay,
			reconnect_max_delay: self.reconnect_max_delay,
		}
	}
}

fn parse_u64(name: &str, value: &str) -> SyncResult<u64> {
	value.trim().parse::<u64>().map_err(|_| {
		Error::ConfigError(format!("{} must be a non-negative integer, got '{}'", name, value))
	})
}

mod duration_ms {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}


// vim: ts=4
