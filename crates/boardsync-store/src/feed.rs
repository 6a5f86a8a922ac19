//! Change Feed Subscriber
//!
//! Applies authoritative change events from the gateway to the cache, independently
//! of locally originated mutations. Each (collection, filter) pair is served by at
//! most one `SubscriptionHandle`, driven by a background task:
//!
//! ```text
//! Connecting -> Active -> (Reconnecting -> Active)* -> Closed
//! ```
//!
//! A transport disconnect (end of the gateway stream) moves the handle to
//! `Reconnecting`; it resubscribes with exponential backoff and the cache keeps
//! serving the last known state meanwhile. A closed handle delivers nothing more and
//! has to be recreated.
//!
//! Handles are shared: every `subscribe` for a key adds an owner, every
//! `unsubscribe` drops one, and the handle closes when the last owner is gone.

use boardsync_types::gateway_adapter::{
	ChangeEvent, GatewayAdapter, SubscriptionKey, SubscriptionOptions,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use crate::boundary;
use crate::cache::EntityCache;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
	Connecting,
	Active,
	Reconnecting,
	Closed,
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
	pub reconnect_initial_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for FeedConfig {
	fn default() -> Self {
		Self {
			reconnect_initial_delay: Duration::from_millis(250),
			reconnect_max_delay: Duration::from_secs(30),
		}
	}
}

/// Apply one change event to the cache.
///
/// Create events replace the cached entity; update events merge the fields they carry
/// over it (or insert it if absent); delete events remove it. Applying the same event
/// twice leaves the cache as applying it once. Malformed events are rejected with
/// `MalformedResponse` and leave the cache untouched.
pub fn apply_event(cache: &EntityCache, event: &ChangeEvent) -> SyncResult<()> {
	let collection = event.collection();
	match event {
		ChangeEvent::Create { data, .. } => {
			let entity = parse_event_row(&collection, event, data)?;
			cache.put(&collection, entity);
		}
		ChangeEvent::Update { data, .. } => {
			let entity = parse_event_row(&collection, event, data)?;
			let id = entity.id().clone();
			match cache.patch(&collection, &id, entity.fields()) {
				Ok(_) => {}
				Err(Error::NotFound) => {
					cache.put(&collection, entity);
				}
				Err(err) => return Err(err),
			}
		}
		ChangeEvent::Delete { .. } => {
			let id = event
				.id()
				.ok_or_else(|| Error::MalformedResponse(format!("bad path '{}'", event.path())))?;
			cache.remove(&collection, &EntityId::from(id));
		}
		ChangeEvent::Ready { .. } => {}
	}
	Ok(())
}

fn parse_event_row(
	collection: &Collection,
	event: &ChangeEvent,
	data: &serde_json::Value,
) -> SyncResult<Entity> {
	let entity = boundary::parse_row(collection, data.clone())?;
	if event.id() != Some(entity.id().as_str()) {
		return Err(Error::MalformedResponse(format!(
			"path '{}' does not match row id {}",
			event.path(),
			entity.id()
		)));
	}
	Ok(entity)
}

/// An active change feed listener for one (collection, filter) pair.
#[derive(Debug)]
pub struct SubscriptionHandle {
	key: SubscriptionKey,
	opts: SubscriptionOptions,
	state_rx: watch::Receiver<SubscriptionState>,
	shutdown_tx: watch::Sender<bool>,
	ready_rx: watch::Receiver<bool>,
	applied: Arc<AtomicU64>,
	skipped: Arc<AtomicU64>,
}

impl SubscriptionHandle {
	pub fn key(&self) -> &SubscriptionKey {
		&self.key
	}

	pub fn options(&self) -> &SubscriptionOptions {
		&self.opts
	}

	pub fn state(&self) -> SubscriptionState {
		*self.state_rx.borrow()
	}

	/// Whether the initial rows have been received at least once.
	pub fn is_ready(&self) -> bool {
		*self.ready_rx.borrow()
	}

	/// Wait for the initial rows. Fails if the handle closes first.
	pub async fn wait_ready(&self) -> SyncResult<()> {
		let mut rx = self.ready_rx.clone();
		rx.wait_for(|ready| *ready).await.map(|_| ()).map_err(|_| Error::SubscriptionClosed)
	}

	/// Number of events applied to the cache.
	pub fn applied_events(&self) -> u64 {
		self.applied.load(Ordering::Relaxed)
	}

	/// Number of malformed events skipped.
	pub fn skipped_events(&self) -> u64 {
		self.skipped.load(Ordering::Relaxed)
	}

	/// Wait until the handle reaches `state`. Fails if it closes first.
	pub async fn wait_for(&self, state: SubscriptionState) -> SyncResult<()> {
		let mut rx = self.state_rx.clone();
		let reached = rx
			.wait_for(|current| *current == state || *current == SubscriptionState::Closed)
			.await
			.map_err(|_| Error::SubscriptionClosed)?;
		if *reached == state { Ok(()) } else { Err(Error::SubscriptionClosed) }
	}

	/// Whether `close` was called or the worker has stopped. Subscribing again opens a
	/// new handle.
	pub fn is_closed(&self) -> bool {
		*self.shutdown_tx.borrow() || self.state() == SubscriptionState::Closed
	}

	/// Stop delivering events, for every owner. Idempotent.
	pub fn close(&self) {
		self.shutdown_tx.send_replace(true);
	}
}

struct SharedHandle {
	handle: Arc<SubscriptionHandle>,
	owners: usize,
}

struct FeedInner {
	cache: Arc<EntityCache>,
	gateway: Arc<dyn GatewayAdapter>,
	config: FeedConfig,
	handles: Mutex<HashMap<SubscriptionKey, SharedHandle>>,
}

/// Owns the subscription handles of one session.
#[derive(Clone)]
pub struct ChangeFeed {
	inner: Arc<FeedInner>,
}

impl std::fmt::Debug for ChangeFeed {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChangeFeed")
			.field("config", &self.inner.config)
			.field("handles", &self.inner.handles.lock().len())
			.finish_non_exhaustive()
	}
}

impl ChangeFeed {
	pub fn new(cache: Arc<EntityCache>, gateway: Arc<dyn GatewayAdapter>, config: FeedConfig) -> Self {
		Self { inner: Arc::new(FeedInner { cache, gateway, config, handles: Mutex::new(HashMap::new()) }) }
	}

	/// Subscribe to a collection. If a handle for the same (collection, filter) pair is
	/// still open it is returned instead of opening a second one, and the caller becomes
	/// one more owner of it.
	///
	/// Must be called within a tokio runtime.
	pub fn subscribe(&self, opts: SubscriptionOptions) -> Arc<SubscriptionHandle> {
		let key = opts.key();
		let mut handles = self.inner.handles.lock();
		if let Some(shared) = handles.get_mut(&key) {
			if !shared.handle.is_closed() {
				shared.owners += 1;
				return Arc::clone(&shared.handle);
			}
		}

		let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let (ready_tx, ready_rx) = watch::channel(false);
		let handle = Arc::new(SubscriptionHandle {
			key: key.clone(),
			opts: opts.clone(),
			state_rx,
			shutdown_tx,
			ready_rx,
			applied: Arc::new(AtomicU64::new(0)),
			skipped: Arc::new(AtomicU64::new(0)),
		});
		handles.insert(key.clone(), SharedHandle { handle: Arc::clone(&handle), owners: 1 });
		drop(handles);

		let worker = FeedWorker {
			key,
			opts,
			cache: Arc::clone(&self.inner.cache),
			gateway: Arc::clone(&self.inner.gateway),
			config: self.inner.config,
			state_tx,
			shutdown_rx,
			ready_tx,
			applied: Arc::clone(&handle.applied),
			skipped: Arc::clone(&handle.skipped),
		};
		tokio::spawn(worker.run());

		handle
	}

	/// Give up one ownership of `handle`. The last owner closes it. Releasing a handle
	/// that was already replaced or closed changes nothing.
	pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
		let mut handles = self.inner.handles.lock();
		let Some(shared) = handles.get_mut(handle.key()) else {
			return;
		};
		if !std::ptr::eq(Arc::as_ptr(&shared.handle), handle) {
			return;
		}
		shared.owners = shared.owners.saturating_sub(1);
		if shared.owners > 0 {
			debug!("subscription {} released, {} owners left", handle.key(), shared.owners);
			return;
		}
		if let Some(shared) = handles.remove(handle.key()) {
			shared.handle.close();
		}
	}

	pub fn handle(&self, key: &SubscriptionKey) -> Option<Arc<SubscriptionHandle>> {
		self.inner.handles.lock().get(key).map(|shared| Arc::clone(&shared.handle))
	}

	/// Number of owners of the open handle for `key`.
	pub fn owners(&self, key: &SubscriptionKey) -> usize {
		self.inner
			.handles
			.lock()
			.get(key)
			.filter(|shared| !shared.handle.is_closed())
			.map_or(0, |shared| shared.owners)
	}

	/// Number of handles that are not closed.
	pub fn active_handles(&self) -> usize {
		self.inner.handles.lock().values().filter(|shared| !shared.handle.is_closed()).count()
	}

	/// Apply one event directly, outside any subscription.
	pub fn on_change_event(&self, event: &ChangeEvent) -> SyncResult<()> {
		apply_event(&self.inner.cache, event)
	}

	/// Close every handle.
	pub fn close_all(&self) {
		let handles: Vec<SharedHandle> =
			self.inner.handles.lock().drain().map(|(_, shared)| shared).collect();
		for shared in handles {
			shared.handle.close();
		}
	}
}

struct FeedWorker {
	key: SubscriptionKey,
	opts: SubscriptionOptions,
	cache: Arc<EntityCache>,
	gateway: Arc<dyn GatewayAdapter>,
	config: FeedConfig,
	state_tx: watch::Sender<SubscriptionState>,
	shutdown_rx: watch::Receiver<bool>,
	ready_tx: watch::Sender<bool>,
	applied: Arc<AtomicU64>,
	skipped: Arc<AtomicU64>,
}

enum StreamEnd {
	Disconnected,
	Shutdown,
}

impl FeedWorker {
	async fn run(mut self) {
		let mut delay = self.config.reconnect_initial_delay;
		let mut was_active = false;

		while !self.is_shutdown() {
			let subscribed = tokio::select! {
				res = self.gateway.subscribe(self.opts.clone()) => res,
				_ = self.shutdown_rx.changed() => break,
			};

			match subscribed {
				Ok(stream) => {
					self.set_state(SubscriptionState::Active);
					was_active = true;
					delay = self.config.reconnect_initial_delay;
					match self.consume(stream).await {
						StreamEnd::Shutdown => break,
						StreamEnd::Disconnected => {
							warn!("subscription {} disconnected", self.key);
						}
					}
				}
				Err(err) => {
					warn!("subscription {} failed to connect: {}", self.key, err);
				}
			}

			if was_active {
				self.set_state(SubscriptionState::Reconnecting);
			}
			debug!("subscription {} retrying in {:?}", self.key, delay);
			tokio::select! {
				() = tokio::time::sleep(delay) => {}
				_ = self.shutdown_rx.changed() => break,
			}
			delay = delay.saturating_mul(2).min(self.config.reconnect_max_delay);
		}

		self.set_state(SubscriptionState::Closed);
		debug!("subscription {} closed", self.key);
	}

	async fn consume(&mut self, mut stream: boardsync_types::gateway_adapter::ChangeStream) -> StreamEnd {
		loop {
			let item = tokio::select! {
				item = stream.next() => item,
				_ = self.shutdown_rx.changed() => return StreamEnd::Shutdown,
			};
			let Some(item) = item else {
				return StreamEnd::Disconnected;
			};

			match item {
				Ok(ChangeEvent::Ready { .. }) => {
					if !self.ready_tx.send_replace(true) {
						info!("subscription {} ready", self.key);
					}
				}
				Ok(event) => match apply_event(&self.cache, &event) {
					Ok(()) => {
						self.applied.fetch_add(1, Ordering::Relaxed);
					}
					Err(err) => {
						self.skipped.fetch_add(1, Ordering::Relaxed);
						warn!("subscription {} skipped event {}: {}", self.key, event.path(), err);
					}
				},
				Err(err) => {
					self.skipped.fetch_add(1, Ordering::Relaxed);
					warn!("subscription {} skipped undeliverable event: {}", self.key, err);
				}
			}
		}
	}

	fn is_shutdown(&self) -> bool {
		*self.shutdown_rx.borrow()
	}

	fn set_state(&self, state: SubscriptionState) {
		let previous = self.state_tx.send_replace(state);
		if previous != state {
			debug!("subscription {}: {:?} -> {:?}", self.key, previous, state);
		}
	}
}


// vim: ts=4
