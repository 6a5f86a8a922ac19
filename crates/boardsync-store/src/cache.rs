//! Normalized Entity Cache
//!
//! Holds the best-known state of every entity, keyed by collection and id, and
//! notifies observers of every effective write.
//!
//! Every write (put, patch, remove, restore, confirm) takes a fresh value from one
//! cache-wide revision counter and tags the entry with it, even when it stores a value
//! identical to the current one; such a write only stays silent for observers. Removed entries
//! keep their revision as a tombstone, so "has this entry been written since
//! revision R" can be answered for deletes too. That question is what makes rollback
//! and confirmation conditional:
//!
//! - `restore` puts a snapshot back only if the entry still carries the revision the
//!   optimistic apply produced
//! - `confirm` merges a server response under the same condition, and re-keys
//!   temporary ids to server-assigned ones
//!
//! Nothing here suspends: all operations take a short synchronous lock.

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::index::{IndexDef, SecondaryIndex};
use crate::merge;
use crate::prelude::*;

/// Default capacity of the change broadcast channel.
pub const DEFAULT_CHANGE_BUFFER: usize = 256;

/// Longest alias chain followed when resolving an id.
const MAX_ALIAS_HOPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
	Put,
	Patch,
	Remove,
	/// The entity moved from `previous_id` to `id`.
	Rekey,
}

/// Notification of one effective cache write.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheChange {
	pub collection: Collection,
	pub id: EntityId,
	pub kind: ChangeKind,
	pub revision: Revision,
	pub previous_id: Option<EntityId>,
}

impl CacheChange {
	fn new(collection: &Collection, id: &EntityId, kind: ChangeKind, revision: Revision) -> Self {
		Self { collection: collection.clone(), id: id.clone(), kind, revision, previous_id: None }
	}
}

/// Result of merging a server response into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
	/// The response replaced the optimistic state.
	Applied,
	/// The temporary id was replaced by the server-assigned one.
	Rekeyed { from: EntityId, to: EntityId },
	/// The entry was written after the optimistic apply; the response was not merged.
	Skipped,
}

pub type Observer = Arc<dyn Fn(&CacheChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Key = (Collection, EntityId);

#[derive(Debug)]
struct Slot {
	entity: Entity,
	revision: Revision,
}

#[derive(Debug, Default)]
struct CacheState {
	collections: HashMap<Collection, BTreeMap<EntityId, Slot>>,
	tombstones: HashMap<Key, Revision>,
	aliases: HashMap<Key, EntityId>,
	indexes: Vec<SecondaryIndex>,
	revision: Revision,
}

impl CacheState {
	fn bump(&mut self) -> Revision {
		self.revision = self.revision.next();
		self.revision
	}

	fn slot(&self, collection: &Collection, id: &EntityId) -> Option<&Slot> {
		self.collections.get(collection).and_then(|entries| entries.get(id))
	}

	fn current_revision(&self, collection: &Collection, id: &EntityId) -> Option<Revision> {
		self.slot(collection, id)
			.map(|slot| slot.revision)
			.or_else(|| self.tombstones.get(&(collection.clone(), id.clone())).copied())
	}

	fn resolve(&self, collection: &Collection, id: &EntityId) -> EntityId {
		let mut current = id.clone();
		for _ in 0..MAX_ALIAS_HOPS {
			match self.aliases.get(&(collection.clone(), current.clone())) {
				Some(next) => current = next.clone(),
				None => break,
			}
		}
		current
	}

	/// Store an entity under a fresh revision. Returns the revision and whether the
	/// stored value changed.
	fn write(&mut self, collection: &Collection, entity: Entity) -> (Revision, bool) {
		let revision = self.bump();
		if let Some(slot) =
			self.collections.get_mut(collection).and_then(|entries| entries.get_mut(entity.id()))
		{
			if slot.entity == entity {
				slot.revision = revision;
				return (revision, false);
			}
		}
		for index in self.indexes.iter_mut().filter(|index| index.def.collection == *collection) {
			index.insert(&entity);
		}
		self.tombstones.remove(&(collection.clone(), entity.id().clone()));
		self.collections
			.entry(collection.clone())
			.or_default()
			.insert(entity.id().clone(), Slot { entity, revision });
		(revision, true)
	}

	/// Remove an entity, leaving a tombstone. Returns `None` if it was absent.
	fn erase(&mut self, collection: &Collection, id: &EntityId) -> Option<Revision> {
		self.collections.get_mut(collection).and_then(|entries| entries.remove(id))?;
		let revision = self.bump();
		for index in self.indexes.iter_mut().filter(|index| index.def.collection == *collection) {
			index.remove(id);
		}
		self.tombstones.insert((collection.clone(), id.clone()), revision);
		Some(revision)
	}
}

pub struct EntityCache {
	state: RwLock<CacheState>,
	change_tx: broadcast::Sender<CacheChange>,
	observers: Mutex<Vec<(ObserverId, Observer)>>,
	next_observer: AtomicU64,
}

impl std::fmt::Debug for EntityCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EntityCache")
			.field("revision", &self.state.read().revision)
			.field("observers", &self.observers.lock().len())
			.finish_non_exhaustive()
	}
}

impl Default for EntityCache {
	fn default() -> Self {
		Self::new(DEFAULT_CHANGE_BUFFER)
	}
}

impl EntityCache {
	pub fn new(change_buffer: usize) -> Self {
		let (change_tx, _) = broadcast::channel(change_buffer.max(1));
		Self {
			state: RwLock::new(CacheState::default()),
			change_tx,
			observers: Mutex::new(Vec::new()),
			next_observer: AtomicU64::new(1),
		}
	}

	/// Register a secondary index. Existing entities of the collection are indexed
	/// immediately. Defining the same index twice is a no-op.
	pub fn define_index(&self, def: IndexDef) -> SyncResult<()> {
		let mut state = self.state.write();
		if let Some(existing) = state.indexes.iter().find(|index| index.def.name == def.name) {
			if existing.def == def {
				return Ok(());
			}
			return Err(Error::ConfigError(format!(
				"index '{}' already defined with a different field",
				def.name
			)));
		}

		let mut index = SecondaryIndex::new(def);
		if let Some(entries) = state.collections.get(&index.def.collection) {
			for slot in entries.values() {
				index.insert(&slot.entity);
			}
		}
		debug!("defined index {} on {}.{}", index.def.name, index.def.collection, index.def.field);
		state.indexes.push(index);
		Ok(())
	}

	pub fn get(&self, collection: &Collection, id: &EntityId) -> Option<Entity> {
		let state = self.state.read();
		let id = state.resolve(collection, id);
		state.slot(collection, &id).map(|slot| slot.entity.clone())
	}

	pub fn contains(&self, collection: &Collection, id: &EntityId) -> bool {
		self.get(collection, id).is_some()
	}

	/// Entity and its revision, if present.
	pub fn entry(&self, collection: &Collection, id: &EntityId) -> Option<(Entity, Revision)> {
		let state = self.state.read();
		let id = state.resolve(collection, id);
		state.slot(collection, &id).map(|slot| (slot.entity.clone(), slot.revision))
	}

	/// Revision of the last write to this entry, including removals.
	pub fn revision(&self, collection: &Collection, id: &EntityId) -> Option<Revision> {
		let state = self.state.read();
		let id = state.resolve(collection, id);
		state.current_revision(collection, &id)
	}

	/// Follow re-key aliases from a temporary id to the current one.
	pub fn resolve(&self, collection: &Collection, id: &EntityId) -> EntityId {
		self.state.read().resolve(collection, id)
	}

	/// Insert or replace an entity. Putting an identical entity notifies nobody, but
	/// still advances the entry's revision. Returns the new revision.
	pub fn put(&self, collection: &Collection, entity: Entity) -> Revision {
		let (revision, change) = {
			let mut state = self.state.write();
			let id = entity.id().clone();
			let (revision, changed) = state.write(collection, entity);
			(revision, changed.then(|| CacheChange::new(collection, &id, ChangeKind::Put, revision)))
		};
		self.emit(change);
		revision
	}

	/// Merge fields into an existing entity. Fails with `NotFound` if it is absent.
	pub fn patch(
		&self,
		collection: &Collection,
		id: &EntityId,
		partial: &Map<String, Value>,
	) -> SyncResult<Revision> {
		let (revision, change) = {
			let mut state = self.state.write();
			let id = state.resolve(collection, id);
			let slot = state.slot(collection, &id).ok_or(Error::NotFound)?;
			let updated = merge::merged(&slot.entity, partial)?;
			let (revision, changed) = state.write(collection, updated);
			(revision, changed.then(|| CacheChange::new(collection, &id, ChangeKind::Patch, revision)))
		};
		self.emit(change);
		Ok(revision)
	}

	/// Remove an entity. Removing an absent id is a no-op and returns `None`.
	pub fn remove(&self, collection: &Collection, id: &EntityId) -> Option<Revision> {
		let (revision, change) = {
			let mut state = self.state.write();
			let id = state.resolve(collection, id);
			let revision = state.erase(collection, &id);
			(revision, revision.map(|rev| CacheChange::new(collection, &id, ChangeKind::Remove, rev)))
		};
		self.emit(change);
		revision
	}

	/// Compare-and-restore: put `snapshot` back (or remove the entry if the snapshot is
	/// absence) only if the entry still carries `expected`. Returns whether it restored.
	pub fn restore(
		&self,
		collection: &Collection,
		id: &EntityId,
		expected: Revision,
		snapshot: Option<Entity>,
	) -> bool {
		let change = {
			let mut state = self.state.write();
			if state.current_revision(collection, id) != Some(expected) {
				return false;
			}
			match snapshot {
				Some(entity) => {
					let (rev, changed) = state.write(collection, entity.with_id(id.clone()));
					changed.then(|| CacheChange::new(collection, id, ChangeKind::Put, rev))
				}
				None => state
					.erase(collection, id)
					.map(|rev| CacheChange::new(collection, id, ChangeKind::Remove, rev)),
			}
		};
		self.emit(change);
		true
	}

	/// Merge an authoritative server row for an entry optimistically written at
	/// `expected`, re-keying `local_id` if the server assigned a different id.
	pub fn confirm(
		&self,
		collection: &Collection,
		local_id: &EntityId,
		expected: Revision,
		authoritative: Entity,
	) -> ConfirmOutcome {
		let target = authoritative.id().clone();
		let (outcome, changes) = {
			let mut state = self.state.write();
			if target == *local_id {
				if state.current_revision(collection, local_id) != Some(expected) {
					return ConfirmOutcome::Skipped;
				}
				let (rev, changed) = state.write(collection, authoritative);
				let changes: Vec<CacheChange> = changed
					.then(|| CacheChange::new(collection, &target, ChangeKind::Put, rev))
					.into_iter()
					.collect();
				(ConfirmOutcome::Applied, changes)
			} else {
				let Some(slot) = state.slot(collection, local_id) else {
					return ConfirmOutcome::Skipped;
				};
				let unchanged = slot.revision == expected;
				let local = slot.entity.clone();
				state.aliases.insert((collection.clone(), local_id.clone()), target.clone());

				let mut changes = Vec::new();
				let already_delivered = state.slot(collection, &target).is_some();
				if let Some(rev) = state.erase(collection, local_id) {
					if already_delivered {
						changes.push(CacheChange::new(collection, local_id, ChangeKind::Remove, rev));
					}
				}
				if !already_delivered {
					let entity = if unchanged { authoritative } else { with_assigned(&local, &authoritative) };
					let (rev, _) = state.write(collection, entity);
					let mut change = CacheChange::new(collection, &target, ChangeKind::Rekey, rev);
					change.previous_id = Some(local_id.clone());
					changes.push(change);
				}
				(ConfirmOutcome::Rekeyed { from: local_id.clone(), to: target }, changes)
			}
		};
		for change in changes {
			self.emit(Some(change));
		}
		outcome
	}

	/// All entities of a collection, ordered by id.
	pub fn snapshot(&self, collection: &Collection) -> Vec<Entity> {
		self.state
			.read()
			.collections
			.get(collection)
			.map(|entries| entries.values().map(|slot| slot.entity.clone()).collect())
			.unwrap_or_default()
	}

	pub fn len(&self, collection: &Collection) -> usize {
		self.state.read().collections.get(collection).map_or(0, BTreeMap::len)
	}

	pub fn is_empty(&self, collection: &Collection) -> bool {
		self.len(collection) == 0
	}

	/// Ids listed under `key` in the named index. Unknown indexes list nothing.
	pub fn index_members(&self, index: &str, key: &str) -> Vec<EntityId> {
		self.state
			.read()
			.indexes
			.iter()
			.find(|idx| &*idx.def.name == index)
			.map(|idx| idx.members(key))
			.unwrap_or_default()
	}

	/// Verify that every indexed id is present in its collection.
	pub fn check_indexes(&self) -> SyncResult<()> {
		let state = self.state.read();
		for index in &state.indexes {
			for id in index.ids() {
				if state.slot(&index.def.collection, id).is_none() {
					return Err(Error::Internal(format!(
						"index {} lists missing entity {}/{}",
						index.def.name, index.def.collection, id
					)));
				}
			}
		}
		Ok(())
	}

	/// Receive every subsequent change. Slow receivers may observe `Lagged`.
	pub fn watch(&self) -> broadcast::Receiver<CacheChange> {
		self.change_tx.subscribe()
	}

	/// Register a synchronous callback, invoked after each change with no lock held.
	pub fn observe(&self, observer: impl Fn(&CacheChange) + Send + Sync + 'static) -> ObserverId {
		let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
		self.observers.lock().push((id, Arc::new(observer)));
		id
	}

	pub fn unobserve(&self, id: ObserverId) {
		self.observers.lock().retain(|(observer_id, _)| *observer_id != id);
	}

	fn emit(&self, change: Option<CacheChange>) {
		let Some(change) = change else {
			return;
		};
		let observers: Vec<Observer> =
			self.observers.lock().iter().map(|(_, observer)| Arc::clone(observer)).collect();
		for observer in observers {
			observer(&change);
		}
		let _ = self.change_tx.send(change);
	}
}

/// Local copy of a re-keyed entity, completed with the fields only the server set.
fn with_assigned(local: &Entity, authoritative: &Entity) -> Entity {
	let mut data = local.fields().clone();
	for (key, value) in authoritative.fields() {
		data.entry(key.clone()).or_insert_with(|| value.clone());
	}
	Entity::new(authoritative.id().clone(), data)
}


// vim: ts=4
