//! Session builder - wires one cache, mutation engine and change feed together
//!
//! Every session owns its own state; several sessions (one per board, or one per
//! test) can live in the same process.

use std::sync::Arc;

use boardsync_store::{ChangeFeed, EntityCache, IndexDef, MutationEngine};
use boardsync_types::gateway_adapter::{GatewayAdapter, SubscriptionOptions};

use crate::board::BoardStore;
use crate::chat::ChatStore;
use crate::config::SessionConfig;
use crate::prelude::*;
use crate::presence::PresenceStore;

/// Task ids by `columnId`.
pub const TASKS_BY_COLUMN: &str = "tasks_by_column";
/// Column ids by `boardId`.
pub const COLUMNS_BY_BOARD: &str = "columns_by_board";
/// Message ids by `channelId`.
pub const MESSAGES_BY_CHANNEL: &str = "messages_by_channel";

fn standard_indexes() -> [IndexDef; 3] {
	[
		IndexDef::new(TASKS_BY_COLUMN, Collection::Tasks, "columnId"),
		IndexDef::new(COLUMNS_BY_BOARD, Collection::Columns, "boardId"),
		IndexDef::new(MESSAGES_BY_CHANNEL, Collection::Messages, "channelId"),
	]
}

pub struct SessionBuilder {
	config: SessionConfig,
	gateway: Option<Arc<dyn GatewayAdapter>>,
	indexes: Vec<IndexDef>,
}

impl Default for SessionBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl SessionBuilder {
	pub fn new() -> Self {
		let _ = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
			.with_target(false)
			.try_init();
		SessionBuilder { config: SessionConfig::default(), gateway: None, indexes: Vec::new() }
	}

	// Config
	pub fn config(&mut self, config: SessionConfig) -> &mut Self {
		self.config = config;
		self
	}
	pub fn mutation_timeout(&mut self, timeout: std::time::Duration) -> &mut Self {
		self.config.mutation_timeout = timeout;
		self
	}
	pub fn reconnect_initial_delay(&mut self, delay: std::time::Duration) -> &mut Self {
		self.config.reconnect_initial_delay = delay;
		self
	}
	pub fn reconnect_max_delay(&mut self, delay: std::time::Duration) -> &mut Self {
		self.config.reconnect_max_delay = delay;
		self
	}
	pub fn change_buffer(&mut self, capacity: usize) -> &mut Self {
		self.config.change_buffer = capacity;
		self
	}

	// Adapters
	pub fn gateway(&mut self, gateway: Arc<dyn GatewayAdapter>) -> &mut Self {
		self.gateway = Some(gateway);
		self
	}

	/// Register an extra secondary index next to the standard ones.
	pub fn index(&mut self, def: IndexDef) -> &mut Self {
		self.indexes.push(def);
		self
	}

	pub fn build(self) -> SyncResult<Session> {
		self.config.validate()?;
		let Some(gateway) = self.gateway else {
			error!("no gateway adapter configured");
			return Err(Error::ConfigError("no gateway adapter configured".into()));
		};

		let cache = Arc::new(EntityCache::new(self.config.change_buffer));
		for def in standard_indexes().into_iter().chain(self.indexes) {
			cache.define_index(def)?;
		}

		let engine =
			MutationEngine::with_timeout(cache.clone(), gateway.clone(), self.config.mutation_timeout);
		let feed = ChangeFeed::new(cache.clone(), gateway.clone(), self.config.feed_config());
		info!(
			"session started (mutation timeout {:?}, reconnect {:?}..{:?})",
			self.config.mutation_timeout,
			self.config.reconnect_initial_delay,
			self.config.reconnect_max_delay
		);

		Ok(Session {
			inner: Arc::new(SessionInner { config: self.config, cache, engine, feed, gateway }),
		})
	}
}

struct SessionInner {
	config: SessionConfig,
	cache: Arc<EntityCache>,
	engine: MutationEngine,
	feed: ChangeFeed,
	gateway: Arc<dyn GatewayAdapter>,
}

/// Explicit context holding the cache, the mutation engine and the subscriptions of
/// one logical session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("config", &self.inner.config)
			.field("engine", &self.inner.engine)
			.field("feed", &self.inner.feed)
			.finish_non_exhaustive()
	}
}

impl Session {
	pub fn builder() -> SessionBuilder {
		SessionBuilder::new()
	}

	pub fn config(&self) -> &SessionConfig {
		&self.inner.config
	}

	pub fn cache(&self) -> &Arc<EntityCache> {
		&self.inner.cache
	}

	pub fn engine(&self) -> &MutationEngine {
		&self.inner.engine
	}

	pub fn feed(&self) -> &ChangeFeed {
		&self.inner.feed
	}

	pub fn gateway(&self) -> &Arc<dyn GatewayAdapter> {
		&self.inner.gateway
	}

	pub fn board(&self, board_id: impl Into<Box<str>>) -> BoardStore {
		BoardStore::new(self.clone(), board_id)
	}

	pub fn chat(&self, user_id: impl Into<Box<str>>) -> ChatStore {
		ChatStore::new(self.clone(), user_id)
	}

	pub fn presence(&self, user_id: impl Into<Box<str>>) -> PresenceStore {
		PresenceStore::new(self.clone(), user_id)
	}

	/// Subscribe and wait for the initial rows, bounded by the mutation timeout.
	pub async fn subscribe_ready(
		&self,
		opts: SubscriptionOptions,
	) -> SyncResult<Arc<SubscriptionHandle>> {
		let handle = self.inner.feed.subscribe(opts);
		self.wait_ready(&handle).await?;
		Ok(handle)
	}

	/// Wait for a handle's initial rows, bounded by the mutation timeout.
	pub async fn wait_ready(&self, handle: &SubscriptionHandle) -> SyncResult<()> {
		tokio::time::timeout(self.inner.config.mutation_timeout, handle.wait_ready()).await?
	}

	/// Close every subscription. Pending mutations still settle.
	pub fn shutdown(&self) {
		self.inner.feed.close_all();
		info!("session closed ({} mutations pending)", self.inner.engine.pending_count());
	}

	/// Current entity decoded into a typed record.
	pub(crate) fn record<T: serde::de::DeserializeOwned>(
		&self,
		collection: &Collection,
		id: &EntityId,
	) -> SyncResult<T> {
		self.inner.cache.get(collection, id).ok_or(Error::NotFound)?.decode()
	}

	/// Typed records listed under `key` in the named index.
	pub(crate) fn indexed<T: serde::de::DeserializeOwned>(
		&self,
		collection: &Collection,
		index: &str,
		key: &str,
	) -> SyncResult<Vec<T>> {
		self.inner
			.cache
			.index_members(index, key)
			.iter()
			.filter_map(|id| self.inner.cache.get(collection, id))
			.map(|entity| entity.decode())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_build_requires_gateway() {
		let res = SessionBuilder::new().build();
		assert!(matches!(res, Err(Error::ConfigError(_))));
	}
}

// vim: ts=4
