//! Secondary indexes over cached entities ("task ids in column X").
//!
//! An index groups the ids of one collection by the value of one field. Index
//! membership is maintained by the cache on every write, so an id is listed only
//! while its entity is present.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::prelude::*;

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
	pub name: Box<str>,
	pub collection: Collection,
	pub field: Box<str>,
}

impl IndexDef {
	pub fn new(name: impl Into<Box<str>>, collection: Collection, field: impl Into<Box<str>>) -> Self {
		Self { name: name.into(), collection, field: field.into() }
	}
}

/// Convert a field value to an index key. Objects and arrays are not indexable.
pub fn index_key(value: &Value) -> Option<String> {
	match value {
		Value::String(s) => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		Value::Bool(b) => Some(b.to_string()),
		Value::Null | Value::Array(_) | Value::Object(_) => None,
	}
}

#[derive(Debug)]
pub(crate) struct SecondaryIndex {
	pub(crate) def: IndexDef,
	members: BTreeMap<String, BTreeSet<EntityId>>,
	keys: HashMap<EntityId, String>,
}

impl SecondaryIndex {
	pub(crate) fn new(def: IndexDef) -> Self {
		Self { def, members: BTreeMap::new(), keys: HashMap::new() }
	}

	/// Index (or re-index) an entity under its current field value.
	pub(crate) fn insert(&mut self, entity: &Entity) {
		let key = entity.get(&self.def.field).and_then(index_key);
		if self.keys.get(entity.id()) == key.as_ref() {
			return;
		}
		self.remove(entity.id());
		if let Some(key) = key {
			self.members.entry(key.clone()).or_default().insert(entity.id().clone());
			self.keys.insert(entity.id().clone(), key);
		}
	}

	pub(crate) fn remove(&mut self, id: &EntityId) {
		if let Some(key) = self.keys.remove(id) {
			if let Some(ids) = self.members.get_mut(&key) {
				ids.remove(id);
				if ids.is_empty() {
					self.members.remove(&key);
				}
			}
		}
	}

	pub(crate) fn members(&self, key: &str) -> Vec<EntityId> {
		self.members.get(key).map(|ids| ids.iter().cloned().collect()).unwrap_or_default()
	}

	pub(crate) fn ids(&self) -> impl Iterator<Item = &EntityId> {
		self.keys.keys()
	}
}


// vim: ts=4
