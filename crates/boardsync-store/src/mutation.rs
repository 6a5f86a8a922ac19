//! Optimistic Mutation Engine
//!
//! `mutate` applies a proposed change to the cache before it returns, then sends the
//! request to the gateway from a spawned task. The returned handle resolves once the
//! change is either confirmed (server row merged) or rolled back.
//!
//! Rollback and confirmation are both conditional on the entry still carrying the
//! revision written by the optimistic apply. A newer local mutation or a change feed
//! event in between wins, and the settling mutation leaves the cache alone.
//!
//! A request that outlives the timeout is treated as a transient failure and rolled
//! back; its eventual response is dropped unread.

use boardsync_types::gateway_adapter::GatewayAdapter;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::boundary;
use crate::merge;
use crate::cache::{ConfirmOutcome, EntityCache};
use crate::prelude::*;

pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ProposedChange {
	/// Insert (or replace) the entity with these fields.
	Create(Map<String, Value>),
	/// Merge these fields into the existing entity.
	Patch(Map<String, Value>),
	Delete,
}

impl ProposedChange {
	pub fn create(fields: Value) -> SyncResult<Self> {
		Ok(ProposedChange::Create(into_object(fields)?))
	}

	pub fn patch(fields: Value) -> SyncResult<Self> {
		Ok(ProposedChange::Patch(into_object(fields)?))
	}

	pub fn name(&self) -> &'static str {
		match self {
			ProposedChange::Create(_) => "create",
			ProposedChange::Patch(_) => "patch",
			ProposedChange::Delete => "delete",
		}
	}
}

fn into_object(value: Value) -> SyncResult<Map<String, Value>> {
	match value {
		Value::Object(map) => Ok(map),
		other => Err(Error::RejectedChange(format!("expected an object, got {}", other))),
	}
}

/// Correlation token of one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationToken(u64);

impl std::fmt::Display for MutationToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "m{}", self.0)
	}
}

/// One in-flight optimistic change.
#[derive(Debug, Clone)]
pub struct PendingMutation {
	pub token: MutationToken,
	pub collection: Collection,
	pub id: EntityId,
	/// State before the optimistic apply (`None`: the entity was absent).
	pub snapshot: Option<Entity>,
	/// Change as sent to the gateway (patches reduced to the fields they change).
	pub proposed: ProposedChange,
	/// Revision the optimistic apply left on the entry.
	pub applied: Revision,
}

/// Handle to a mutation whose optimistic change is already visible in the cache.
#[derive(Debug)]
pub struct MutationHandle {
	token: MutationToken,
	collection: Collection,
	id: EntityId,
	task: JoinHandle<SyncResult<Option<Entity>>>,
}

impl MutationHandle {
	pub fn token(&self) -> MutationToken {
		self.token
	}

	pub fn collection(&self) -> &Collection {
		&self.collection
	}

	/// Id the optimistic change was applied under (possibly temporary).
	pub fn id(&self) -> &EntityId {
		&self.id
	}

	/// Wait for the outcome: the authoritative entity (`None` after a delete), or the
	/// classified error after the rollback decision has been made.
	pub async fn settle(self) -> SyncResult<Option<Entity>> {
		self.task.await.map_err(|err| Error::Internal(err.to_string()))?
	}
}

struct EngineInner {
	cache: Arc<EntityCache>,
	gateway: Arc<dyn GatewayAdapter>,
	timeout: Duration,
	pending: Mutex<HashMap<MutationToken, PendingMutation>>,
	next_token: AtomicU64,
}

#[derive(Clone)]
pub struct MutationEngine {
	inner: Arc<EngineInner>,
}

impl std::fmt::Debug for MutationEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MutationEngine")
			.field("timeout", &self.inner.timeout)
			.field("pending", &self.inner.pending.lock().len())
			.finish_non_exhaustive()
	}
}

impl MutationEngine {
	pub fn new(cache: Arc<EntityCache>, gateway: Arc<dyn GatewayAdapter>) -> Self {
		Self::with_timeout(cache, gateway, DEFAULT_MUTATION_TIMEOUT)
	}

	pub fn with_timeout(
		cache: Arc<EntityCache>,
		gateway: Arc<dyn GatewayAdapter>,
		timeout: Duration,
	) -> Self {
		Self {
			inner: Arc::new(EngineInner {
				cache,
				gateway,
				timeout,
				pending: Mutex::new(HashMap::new()),
				next_token: AtomicU64::new(1),
			}),
		}
	}

	pub fn cache(&self) -> &Arc<EntityCache> {
		&self.inner.cache
	}

	pub fn timeout(&self) -> Duration {
		self.inner.timeout
	}

	/// Apply `change` to the cache now and send it to the gateway in the background.
	///
	/// Must be called within a tokio runtime. Fails synchronously, with nothing
	/// applied, when a patch or delete targets an entity that is not cached or whose
	/// create has not been confirmed yet (`StaleEntity`).
	pub fn mutate(
		&self,
		collection: Collection,
		id: impl Into<EntityId>,
		change: ProposedChange,
	) -> SyncResult<MutationHandle> {
		self.mutate_with_timeout(collection, id, change, self.inner.timeout)
	}

	pub fn mutate_with_timeout(
		&self,
		collection: Collection,
		id: impl Into<EntityId>,
		change: ProposedChange,
		timeout: Duration,
	) -> SyncResult<MutationHandle> {
		let cache = &self.inner.cache;
		let id = cache.resolve(&collection, &id.into());

		if id.is_temporary() && !matches!(change, ProposedChange::Create(_)) {
			return Err(Error::StaleEntity { collection, id });
		}

		let snapshot = cache.get(&collection, &id);
		let (applied, change) = match change {
			ProposedChange::Create(fields) => {
				let revision = cache.put(&collection, Entity::new(id.clone(), fields.clone()));
				(revision, ProposedChange::Create(fields))
			}
			ProposedChange::Patch(fields) => {
				let Some(before) = &snapshot else {
					return Err(Error::StaleEntity { collection, id });
				};
				// Dot notation keys go out as whole top-level fields
				let request = merge::diff(before.fields(), merge::merged(before, &fields)?.fields());
				match cache.patch(&collection, &id, &fields) {
					Ok(revision) => (revision, ProposedChange::Patch(request)),
					Err(Error::NotFound) => return Err(Error::StaleEntity { collection, id }),
					Err(err) => return Err(err),
				}
			}
			ProposedChange::Delete => {
				if snapshot.is_none() {
					return Err(Error::StaleEntity { collection, id });
				}
				(cache.remove(&collection, &id).unwrap_or_default(), ProposedChange::Delete)
			}
		};

		let token = MutationToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
		let pending = PendingMutation {
			token,
			collection: collection.clone(),
			id: id.clone(),
			snapshot,
			proposed: change,
			applied,
		};
		debug!("{} {} {}/{} applied at {}", token, pending.proposed.name(), collection, id, applied);
		self.inner.pending.lock().insert(token, pending.clone());

		let inner = Arc::clone(&self.inner);
		let task = tokio::spawn(async move { inner.settle(pending, timeout).await });

		Ok(MutationHandle { token, collection, id, task })
	}

	/// Create an entity. Uses the `id` field of `fields` if present, otherwise a
	/// temporary id that is re-keyed once the server assigns one.
	pub fn create(&self, collection: Collection, fields: Value) -> SyncResult<MutationHandle> {
		let id = match fields.get("id").and_then(Value::as_str) {
			Some(id) => EntityId::from(id),
			None => EntityId::temporary(),
		};
		self.mutate(collection, id, ProposedChange::create(fields)?)
	}

	pub fn patch(
		&self,
		collection: Collection,
		id: impl Into<EntityId>,
		fields: Value,
	) -> SyncResult<MutationHandle> {
		self.mutate(collection, id, ProposedChange::patch(fields)?)
	}

	pub fn delete(&self, collection: Collection, id: impl Into<EntityId>) -> SyncResult<MutationHandle> {
		self.mutate(collection, id, ProposedChange::Delete)
	}

	pub fn pending_count(&self) -> usize {
		self.inner.pending.lock().len()
	}

	pub fn is_pending(&self, collection: &Collection, id: &EntityId) -> bool {
		self.inner
			.pending
			.lock()
			.values()
			.any(|pending| pending.collection == *collection && pending.id == *id)
	}

	/// In-flight mutations, oldest first.
	pub fn pending(&self) -> Vec<PendingMutation> {
		let mut pending: Vec<PendingMutation> =
			self.inner.pending.lock().values().cloned().collect();
		pending.sort_by_key(|pending| pending.token);
		pending
	}
}

impl EngineInner {
	async fn settle(
		self: Arc<Self>,
		pending: PendingMutation,
		timeout: Duration,
	) -> SyncResult<Option<Entity>> {
		let request = tokio::spawn(send_request(
			Arc::clone(&self.gateway),
			pending.collection.clone(),
			pending.id.clone(),
			pending.proposed.clone(),
		));

		// On timeout the request task is detached: whatever it returns later is dropped.
		let result = match tokio::time::timeout(timeout, request).await {
			Ok(Ok(result)) => result,
			Ok(Err(err)) => Err(Error::Internal(err.to_string())),
			Err(elapsed) => {
				warn!("{} timed out after {:?}", pending.token, timeout);
				Err(Error::from(elapsed))
			}
		};

		let outcome = match result.and_then(|row| self.parse_response(&pending, row)) {
			Ok(entity) => {
				self.confirm(&pending, entity.clone());
				Ok(entity)
			}
			Err(err) => {
				let err = classify(err);
				self.rollback(&pending, &err);
				Err(err)
			}
		};

		self.pending.lock().remove(&pending.token);
		outcome
	}

	fn parse_response(
		&self,
		pending: &PendingMutation,
		row: Option<Value>,
	) -> SyncResult<Option<Entity>> {
		match (&pending.proposed, row) {
			(ProposedChange::Delete, _) | (_, None) => Ok(None),
			(_, Some(row)) => boundary::parse_row(&pending.collection, row).map(Some),
		}
	}

	fn confirm(&self, pending: &PendingMutation, entity: Option<Entity>) {
		let Some(entity) = entity else {
			debug!("{} confirmed {}/{}", pending.token, pending.collection, pending.id);
			return;
		};
		match self.cache.confirm(&pending.collection, &pending.id, pending.applied, entity) {
			ConfirmOutcome::Applied => {
				debug!("{} confirmed {}/{}", pending.token, pending.collection, pending.id);
			}
			ConfirmOutcome::Rekeyed { from, to } => {
				info!("{} confirmed {}/{} as {}", pending.token, pending.collection, from, to);
			}
			ConfirmOutcome::Skipped => {
				debug!(
					"{} confirmed {}/{}, response not merged: entry changed since",
					pending.token, pending.collection, pending.id
				);
			}
		}
	}

	fn rollback(&self, pending: &PendingMutation, err: &Error) {
		let restored = self.cache.restore(
			&pending.collection,
			&pending.id,
			pending.applied,
			pending.snapshot.clone(),
		);
		if restored {
			info!("{} rolled back {}/{}: {}", pending.token, pending.collection, pending.id, err);
		} else {
			info!(
				"{} failed ({}), rollback of {}/{} skipped: entry changed since",
				pending.token, err, pending.collection, pending.id
			);
		}
	}
}

async fn send_request(
	gateway: Arc<dyn GatewayAdapter>,
	collection: Collection,
	id: EntityId,
	change: ProposedChange,
) -> SyncResult<Option<Value>> {
	match change {
		ProposedChange::Create(mut fields) => {
			if id.is_temporary() {
				fields.remove("id");
			} else {
				fields.insert("id".to_string(), Value::String(id.to_string()));
			}
			gateway.create(&collection, Value::Object(fields)).await.map(Some)
		}
		ProposedChange::Patch(fields) => {
			gateway.update(&collection, id.as_str(), Value::Object(fields)).await.map(Some)
		}
		ProposedChange::Delete => match gateway.delete(&collection, id.as_str()).await {
			Ok(()) | Err(Error::NotFound) => Ok(None),
			Err(err) => Err(err),
		},
	}
}

/// Map any failure onto the taxonomy callers act on.
fn classify(err: Error) -> Error {
	match err {
		Error::TransientFailure(_) | Error::RejectedChange(_) | Error::MalformedResponse(_) => err,
		Error::NotFound => Error::RejectedChange("row no longer exists".into()),
		Error::StaleEntity { collection, id } => {
			Error::RejectedChange(format!("{}/{} is stale", collection, id))
		}
		Error::ConfigError(msg) => Error::RejectedChange(msg),
		Error::SubscriptionClosed | Error::Internal(_) => Error::TransientFailure(err.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_proposed_change_requires_object() {
		assert!(ProposedChange::create(json!({"title": "A"})).is_ok());
		assert!(matches!(ProposedChange::patch(json!("A")), Err(Error::RejectedChange(_))));
	}

	#[test]
	fn test_classify() {
		assert!(classify(Error::TransientFailure("x".into())).is_retryable());
		assert!(matches!(classify(Error::NotFound), Error::RejectedChange(_)));
		assert!(matches!(classify(Error::Internal("join".into())), Error::TransientFailure(_)));
		assert!(matches!(
			classify(Error::MalformedResponse("x".into())),
			Error::MalformedResponse(_)
		));
	}
}

// vim: ts=4
