//! Common types used throughout Boardsync.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::model::{Column, Message, Presence, Task};
use crate::prelude::*;
use crate::utils::random_id;

/// Prefix marking ids generated locally before the server assigned one.
pub const TEMP_ID_PREFIX: &str = "tmp-";

// Collection //
//************//
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
	Tasks,
	Columns,
	Messages,
	Presence,
	Custom(Box<str>),
}

impl Collection {
	pub fn as_str(&self) -> &str {
		match self {
			Collection::Tasks => "tasks",
			Collection::Columns => "columns",
			Collection::Messages => "messages",
			Collection::Presence => "presence",
			Collection::Custom(name) => name,
		}
	}

	pub fn from_name(name: &str) -> Self {
		match name {
			"tasks" => Collection::Tasks,
			"columns" => Collection::Columns,
			"messages" => Collection::Messages,
			"presence" => Collection::Presence,
			other => Collection::Custom(other.into()),
		}
	}

	/// Check that a raw row has the shape of this collection's record type.
	pub fn validate(&self, row: &Value) -> SyncResult<()> {
		fn check<T: DeserializeOwned>(row: &Value) -> SyncResult<()> {
			T::deserialize(row).map(|_| ()).map_err(Error::from)
		}

		match self {
			Collection::Tasks => check::<Task>(row),
			Collection::Columns => check::<Column>(row),
			Collection::Messages => check::<Message>(row),
			Collection::Presence => check::<Presence>(row),
			Collection::Custom(_) => Ok(()),
		}
	}
}

impl fmt::Display for Collection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl Serialize for Collection {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Collection {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let name = String::deserialize(deserializer)?;
		Ok(Collection::from_name(&name))
	}
}

// EntityId //
//**********//
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Box<str>);

impl EntityId {
	pub fn new(id: impl Into<Box<str>>) -> Self {
		EntityId(id.into())
	}

	/// Generate a local placeholder id, to be re-keyed once the server assigns the real one.
	pub fn temporary() -> Self {
		EntityId(format!("{}{}", TEMP_ID_PREFIX, random_id()).into())
	}

	pub fn is_temporary(&self) -> bool {
		self.0.starts_with(TEMP_ID_PREFIX)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EntityId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<&str> for EntityId {
	fn from(id: &str) -> Self {
		EntityId(id.into())
	}
}

impl From<String> for EntityId {
	fn from(id: String) -> Self {
		EntityId(id.into())
	}
}

impl AsRef<str> for EntityId {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

// Revision //
//**********//
/// Cache-wide write counter. Every effective write gets a fresh, larger value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(pub u64);

impl Revision {
	pub fn next(self) -> Self {
		Revision(self.0.saturating_add(1))
	}
}

impl fmt::Display for Revision {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "r{}", self.0)
	}
}

// Entity //
//********//
/// A domain record: a JSON object that always carries a string `id` field.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
	id: EntityId,
	data: Map<String, Value>,
}

impl Entity {
	/// Build an entity from an id and a field map. The `id` field is forced to match.
	pub fn new(id: impl Into<EntityId>, mut data: Map<String, Value>) -> Self {
		let id = id.into();
		data.insert("id".to_string(), Value::String(id.to_string()));
		Self { id, data }
	}

	/// Parse an untyped row. Fails unless it is an object with a non-empty string `id`.
	pub fn from_value(value: Value) -> SyncResult<Self> {
		let Value::Object(data) = value else {
			return Err(Error::MalformedResponse("row is not a JSON object".into()));
		};
		let id = match data.get("id") {
			Some(Value::String(id)) if !id.is_empty() => EntityId::from(id.as_str()),
			Some(_) => return Err(Error::MalformedResponse("row id is not a string".into())),
			None => return Err(Error::MalformedResponse("row has no id".into())),
		};
		Ok(Self { id, data })
	}

	pub fn id(&self) -> &EntityId {
		&self.id
	}

	pub fn get(&self, field: &str) -> Option<&Value> {
		self.data.get(field)
	}

	pub fn get_str(&self, field: &str) -> Option<&str> {
		self.data.get(field).and_then(Value::as_str)
	}

	pub fn fields(&self) -> &Map<String, Value> {
		&self.data
	}

	/// Replace the id, keeping every other field.
	pub fn with_id(mut self, id: impl Into<EntityId>) -> Self {
		self.id = id.into();
		self.data.insert("id".to_string(), Value::String(self.id.to_string()));
		self
	}

	pub fn to_value(&self) -> Value {
		Value::Object(self.data.clone())
	}

	pub fn into_value(self) -> Value {
		Value::Object(self.data)
	}

	/// Decode into one of the typed records.
	pub fn decode<T: DeserializeOwned>(&self) -> SyncResult<T> {
		Ok(T::deserialize(&Value::Object(self.data.clone()))?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_entity_requires_string_id() {
		assert!(Entity::from_value(json!({"id": "t1", "title": "A"})).is_ok());
		assert!(matches!(
			Entity::from_value(json!({"title": "A"})),
			Err(Error::MalformedResponse(_))
		));
		assert!(matches!(Entity::from_value(json!({"id": 7})), Err(Error::MalformedResponse(_))));
		assert!(matches!(Entity::from_value(json!([1, 2])), Err(Error::MalformedResponse(_))));
		assert!(matches!(Entity::from_value(json!({"id": ""})), Err(Error::MalformedResponse(_))));
	}

	#[test]
	fn test_with_id_rewrites_field() {
		let entity = Entity::from_value(json!({"id": "tmp-1", "title": "A"}))
			.unwrap()
			.with_id("t9");
		assert_eq!(entity.id().as_str(), "t9");
		assert_eq!(entity.to_value(), json!({"id": "t9", "title": "A"}));
	}

	#[test]
	fn test_temporary_ids() {
		let id = EntityId::temporary();
		assert!(id.is_temporary());
		assert!(!EntityId::from("t1").is_temporary());
	}

	#[test]
	fn test_collection_names_round_trip() {
		for name in ["tasks", "columns", "messages", "presence", "boards"] {
			assert_eq!(Collection::from_name(name).as_str(), name);
		}
		assert_eq!(Collection::from_name("boards"), Collection::Custom("boards".into()));
	}

	#[test]
	fn test_collection_validate() {
		assert!(Collection::Tasks.validate(&json!({"id": "t1", "title": "Buy milk"})).is_ok());
		assert!(Collection::Tasks.validate(&json!({"id": "t1"})).is_err());
		assert!(
			Collection::Messages
				.validate(&json!({"id": "m1", "channelId": "c1", "userId": "u1", "content": "hi"}))
				.is_ok()
		);
		assert!(Collection::Custom("boards".into()).validate(&json!({"id": "b1"})).is_ok());
	}
}

// vim: ts=4
