#![forbid(unsafe_code)]

//! In-process implementation of `GatewayAdapter`.
//!
//! Keeps one table of JSON rows per collection, assigns server-side fields
//! (`createdAt`, `updatedAt`, optionally ids), validates rows against the
//! collection's record type, and pushes change events to subscribers. Test hooks
//! can hold requests, inject faults, simulate other users' writes, inject raw
//! events and drop every subscriber connection.

mod error;
mod faults;
pub mod storage;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, info};

pub use error::Error;
pub use faults::Fault;

use boardsync::error::{Error as SyncError, SyncResult};
use boardsync::gateway_adapter::*;
use boardsync::types::Collection;
use boardsync::utils::random_id;
use faults::FaultPlan;

/// Gateway configuration options
#[derive(Debug, Clone)]
pub struct GatewayConfig {
	/// Ignore client-provided ids and always generate one
	pub assign_ids: bool,

	/// Stamp `createdAt` on insert and `updatedAt` on update
	pub server_timestamps: bool,

	/// Delay applied to every request
	pub latency: Duration,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self { assign_ids: false, server_timestamps: true, latency: Duration::ZERO }
	}
}

#[derive(Debug)]
struct Subscriber {
	opts: SubscriptionOptions,
	tx: mpsc::UnboundedSender<SyncResult<ChangeEvent>>,
}

#[derive(Debug, Default)]
struct GatewayState {
	tables: HashMap<Collection, BTreeMap<String, Value>>,
	subscribers: Vec<Subscriber>,
}

impl GatewayState {
	/// Deliver an event to every subscriber of its collection whose filter matches the
	/// row before or after the change.
	fn broadcast(&mut self, event: &ChangeEvent, previous: Option<&Value>) {
		let collection = event.collection();
		self.subscribers.retain(|sub| !sub.tx.is_closed());
		for sub in self.subscribers.iter().filter(|sub| sub.opts.collection == collection) {
			let matches = match &sub.opts.filter {
				None => true,
				Some(filter) => {
					event.data().is_some_and(|data| filter.matches(data))
						|| previous.is_some_and(|row| filter.matches(row))
				}
			};
			if matches {
				let _ = sub.tx.send(Ok(event.clone()));
			}
		}
	}
}

#[derive(Debug)]
pub struct MemoryGateway {
	state: RwLock<GatewayState>,
	faults: Mutex<FaultPlan>,
	hold_tx: watch::Sender<bool>,
	held: AtomicUsize,
	config: GatewayConfig,
}

impl Default for MemoryGateway {
	fn default() -> Self {
		Self::new(GatewayConfig::default())
	}
}

impl MemoryGateway {
	pub fn new(config: GatewayConfig) -> Self {
		let (hold_tx, _) = watch::channel(false);
		Self {
			state: RwLock::new(GatewayState::default()),
			faults: Mutex::new(FaultPlan::default()),
			hold_tx,
			held: AtomicUsize::new(0),
			config,
		}
	}

	// Test hooks

	/// Insert rows directly, without events.
	pub async fn seed(&self, collection: &Collection, rows: Vec<Value>) {
		let mut state = self.state.write().await;
		let table = state.tables.entry(collection.clone()).or_default();
		for row in rows {
			if let Some(id) = row.get("id").and_then(Value::as_str) {
				table.insert(id.to_string(), row.clone());
			}
		}
	}

	/// Stored row, bypassing holds and faults.
	pub async fn row(&self, collection: &Collection, id: &str) -> Option<Value> {
		self.state.read().await.tables.get(collection).and_then(|table| table.get(id)).cloned()
	}

	pub async fn row_count(&self, collection: &Collection) -> usize {
		self.state.read().await.tables.get(collection).map_or(0, BTreeMap::len)
	}

	/// Force the outcome of the next request.
	pub async fn fail_next(&self, fault: Fault) {
		self.faults.lock().await.requests.push_back(fault);
	}

	/// Make the next `count` subscribe attempts fail.
	pub async fn fail_subscribes(&self, count: usize) {
		self.faults.lock().await.subscribe_failures = count;
	}

	/// Park every subsequent request until `release` is called.
	pub fn hold(&self) {
		self.hold_tx.send_replace(true);
	}

	pub fn release(&self) {
		self.hold_tx.send_replace(false);
	}

	/// Number of requests currently parked by `hold`.
	pub fn held_requests(&self) -> usize {
		self.held.load(Ordering::Acquire)
	}

	/// Write as another client would: no holds, no faults, events are broadcast.
	pub async fn remote_create(&self, collection: &Collection, data: Value) -> SyncResult<Value> {
		self.apply_create(collection, data).await
	}

	pub async fn remote_update(
		&self,
		collection: &Collection,
		id: &str,
		patch: Value,
	) -> SyncResult<Value> {
		self.apply_update(collection, id, patch).await
	}

	pub async fn remote_delete(&self, collection: &Collection, id: &str) -> SyncResult<()> {
		self.apply_delete(collection, id).await
	}

	/// Push a raw item to every subscriber of `collection`, ignoring filters and tables.
	pub async fn inject(&self, collection: &Collection, item: SyncResult<ChangeEvent>) {
		let state = self.state.read().await;
		for sub in state.subscribers.iter().filter(|sub| sub.opts.collection == *collection) {
			let _ = sub.tx.send(item.clone());
		}
	}

	/// Drop every subscriber connection; their streams end.
	pub async fn disconnect_all(&self) {
		let mut state = self.state.write().await;
		info!("dropping {} subscriber connections", state.subscribers.len());
		state.subscribers.clear();
	}

	pub async fn subscriber_count(&self) -> usize {
		let mut state = self.state.write().await;
		state.subscribers.retain(|sub| !sub.tx.is_closed());
		state.subscribers.len()
	}

	// Request pipeline

	/// Wait out holds and latency, then consume a pending fault if any.
	async fn before_request(&self, op: &str) -> SyncResult<Option<Value>> {
		let mut hold_rx = self.hold_tx.subscribe();
		if *hold_rx.borrow() {
			self.held.fetch_add(1, Ordering::AcqRel);
			let res = hold_rx.wait_for(|held| !*held).await.map(|_| ());
			self.held.fetch_sub(1, Ordering::AcqRel);
			res.map_err(|_| Error::Unavailable("gateway shut down".into()))?;
		}

		if !self.config.latency.is_zero() {
			tokio::time::sleep(self.config.latency).await;
		}

		match self.faults.lock().await.next_request() {
			None => Ok(None),
			Some(Fault::Unavailable(msg)) => {
				debug!("injected failure for {}", op);
				Err(Error::Unavailable(msg).into())
			}
			Some(Fault::Reject(msg)) => {
				debug!("injected rejection for {}", op);
				Err(SyncError::RejectedChange(msg))
			}
			Some(Fault::Malformed(body)) => {
				debug!("injected malformed response for {}", op);
				Ok(Some(body))
			}
		}
	}

	async fn apply_create(&self, collection: &Collection, data: Value) -> SyncResult<Value> {
		let Value::Object(mut row) = data else {
			return Err(Error::InvalidRow("insert body is not an object".into()).into());
		};

		let id = match row.get("id").and_then(Value::as_str) {
			Some(id) if !self.config.assign_ids => id.to_string(),
			_ => random_id(),
		};
		row.insert("id".to_string(), Value::String(id.clone()));
		if self.config.server_timestamps {
			row.entry("createdAt").or_insert_with(|| Value::String(storage::server_timestamp()));
		}
		let row = Value::Object(row);
		collection.validate(&row).map_err(|err| Error::Constraint(err.to_string()))?;

		let mut state = self.state.write().await;
		let table = state.tables.entry(collection.clone()).or_default();
		if table.contains_key(&id) {
			return Err(Error::Duplicate(format!("{}/{}", collection, id)).into());
		}
		table.insert(id.clone(), row.clone());
		state.broadcast(&ChangeEvent::create(collection, &id, row.clone()), None);
		debug!("inserted {}/{}", collection, id);

		Ok(row)
	}

	async fn apply_update(&self, collection: &Collection, id: &str, patch: Value) -> SyncResult<Value> {
		let Value::Object(patch) = patch else {
			return Err(Error::InvalidRow("update body is not an object".into()).into());
		};

		let mut state = self.state.write().await;
		let previous = state
			.tables
			.get(collection)
			.and_then(|table| table.get(id))
			.cloned()
			.ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))?;

		let mut row: Map<String, Value> = match &previous {
			Value::Object(map) => map.clone(),
			_ => Map::new(),
		};
		storage::apply_patch(&mut row, &patch);
		if self.config.server_timestamps {
			row.insert("updatedAt".to_string(), Value::String(storage::server_timestamp()));
		}
		let row = Value::Object(row);
		collection.validate(&row).map_err(|err| Error::Constraint(err.to_string()))?;

		state.tables.entry(collection.clone()).or_default().insert(id.to_string(), row.clone());
		state.broadcast(&ChangeEvent::update(collection, id, row.clone()), Some(&previous));
		debug!("updated {}/{}", collection, id);

		Ok(row)
	}

	async fn apply_delete(&self, collection: &Collection, id: &str) -> SyncResult<()> {
		let mut state = self.state.write().await;
		let previous = state
			.tables
			.get_mut(collection)
			.and_then(|table| table.remove(id))
			.ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))?;
		state.broadcast(&ChangeEvent::delete(collection, id), Some(&previous));
		debug!("deleted {}/{}", collection, id);
		Ok(())
	}
}

#[async_trait]
impl GatewayAdapter for MemoryGateway {
	async fn create(&self, collection: &Collection, data: Value) -> SyncResult<Value> {
		if let Some(body) = self.before_request("create").await? {
			return Ok(body);
		}
		self.apply_create(collection, data).await
	}

	async fn get(&self, collection: &Collection, id: &str) -> SyncResult<Option<Value>> {
		if let Some(body) = self.before_request("get").await? {
			return Ok(Some(body));
		}
		Ok(self.row(collection, id).await)
	}

	async fn update(&self, collection: &Collection, id: &str, patch: Value) -> SyncResult<Value> {
		if let Some(body) = self.before_request("update").await? {
			return Ok(body);
		}
		self.apply_update(collection, id, patch).await
	}

	async fn delete(&self, collection: &Collection, id: &str) -> SyncResult<()> {
		if self.before_request("delete").await?.is_some() {
			return Ok(());
		}
		self.apply_delete(collection, id).await
	}

	async fn query(&self, collection: &Collection, opts: QueryOptions) -> SyncResult<Vec<Value>> {
		if let Some(body) = self.before_request("query").await? {
			return Ok(vec![body]);
		}
		let state = self.state.read().await;
		Ok(state
			.tables
			.get(collection)
			.map(|table| storage::select_rows(table.values(), &opts))
			.unwrap_or_default())
	}

	async fn subscribe(&self, opts: SubscriptionOptions) -> SyncResult<ChangeStream> {
		if self.faults.lock().await.take_subscribe_failure() {
			return Err(Error::Unavailable("realtime connection refused".into()).into());
		}

		// Snapshot and register under one lock so no change falls in between
		let (initial_rows, mut rx) = {
			let mut state = self.state.write().await;
			let query_opts = QueryOptions { filter: opts.filter.clone(), ..QueryOptions::default() };
			let rows = state
				.tables
				.get(&opts.collection)
				.map(|table| storage::select_rows(table.values(), &query_opts))
				.unwrap_or_default();
			let (tx, rx) = mpsc::unbounded_channel();
			state.subscribers.push(Subscriber { opts: opts.clone(), tx });
			(rows, rx)
		};
		debug!("subscribed to {} ({} initial rows)", opts.key(), initial_rows.len());

		let collection = opts.collection;
		let stream = async_stream::stream! {
			for row in initial_rows {
				if let Some(id) = row.get("id").and_then(Value::as_str).map(String::from) {
					yield Ok(ChangeEvent::create(&collection, &id, row));
				}
			}

			yield Ok(ChangeEvent::ready(&collection));

			while let Some(item) = rx.recv().await {
				yield item;
			}
		};

		Ok(Box::pin(stream))
	}
}

// vim: ts=4
