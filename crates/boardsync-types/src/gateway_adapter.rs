//! Remote Data Gateway Adapter
//!
//! Trait and types for pluggable backends that hold the authoritative rows of each
//! collection and push change notifications for them.
//!
//! Rows cross this boundary untyped (`serde_json::Value`); the store validates them
//! into `Entity` values before anything reaches the cache. Authentication is the
//! adapter's own business: an adapter handed to the store is already signed in.

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::pin::Pin;

use crate::prelude::*;

/// Query filter for selecting rows.
///
/// A row matches if ALL specified conditions are satisfied (AND logic).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
	/// Field equality constraints: field_name -> expected_value
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub equals: BTreeMap<String, Value>,

	/// Field not-equal constraints: field_name -> expected_value
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty", rename = "notEquals")]
	pub not_equals: BTreeMap<String, Value>,

	/// Field in-array constraints: field_name -> array of allowed values
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty", rename = "inArray")]
	pub in_array: BTreeMap<String, Vec<Value>>,
}

impl QueryFilter {
	/// Create a new empty filter (matches all rows).
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a filter with a single equality constraint.
	pub fn equals_one(field: impl Into<String>, value: Value) -> Self {
		Self::default().with_equals(field, value)
	}

	/// Add an equality constraint to this filter (builder pattern).
	pub fn with_equals(mut self, field: impl Into<String>, value: Value) -> Self {
		self.equals.insert(field.into(), value);
		self
	}

	/// Add a not-equal constraint to this filter (builder pattern).
	pub fn with_not_equals(mut self, field: impl Into<String>, value: Value) -> Self {
		self.not_equals.insert(field.into(), value);
		self
	}

	/// Add an in-array constraint to this filter (builder pattern).
	pub fn with_in_array(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
		self.in_array.insert(field.into(), values);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.equals.is_empty() && self.not_equals.is_empty() && self.in_array.is_empty()
	}

	/// Check if a row matches this filter. Missing fields never equal anything.
	pub fn matches(&self, row: &Value) -> bool {
		for (field, expected) in &self.equals {
			match row.get(field) {
				Some(actual) if actual == expected => continue,
				_ => return false,
			}
		}

		for (field, expected) in &self.not_equals {
			match row.get(field) {
				Some(actual) if actual == expected => return false,
				_ => continue,
			}
		}

		for (field, allowed_values) in &self.in_array {
			match row.get(field) {
				Some(actual) if allowed_values.contains(actual) => continue,
				_ => return false,
			}
		}

		true
	}
}

/// Sort order for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
	pub field: String,
	pub ascending: bool,
}

impl SortField {
	pub fn asc(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: true }
	}

	pub fn desc(field: impl Into<String>) -> Self {
		Self { field: field.into(), ascending: false }
	}
}

/// Options for querying rows (filter, sort, limit).
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
	pub filter: Option<QueryFilter>,
	pub sort: Option<Vec<SortField>>,
	pub limit: Option<u32>,
}

impl QueryOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_filter(mut self, filter: QueryFilter) -> Self {
		self.filter = Some(filter);
		self
	}

	pub fn with_sort(mut self, sort: Vec<SortField>) -> Self {
		self.sort = Some(sort);
		self
	}

	pub fn with_limit(mut self, limit: u32) -> Self {
		self.limit = Some(limit);
		self
	}
}

/// Options for subscribing to changes of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
	pub collection: Collection,

	/// Optional filter (only matching rows are sent)
	pub filter: Option<QueryFilter>,
}

impl SubscriptionOptions {
	/// Subscribe to all changes of a collection.
	pub fn all(collection: Collection) -> Self {
		Self { collection, filter: None }
	}

	pub fn filtered(collection: Collection, filter: QueryFilter) -> Self {
		Self { collection, filter: Some(filter) }
	}

	/// Stable identity of the (collection, filter) pair.
	pub fn key(&self) -> SubscriptionKey {
		let filter = match &self.filter {
			Some(filter) if !filter.is_empty() => {
				serde_json::to_string(filter).unwrap_or_default()
			}
			_ => String::new(),
		};
		SubscriptionKey(format!("{}?{}", self.collection, filter).into())
	}
}

/// Identity of a subscription; two options with equal keys would deliver the same events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey(Box<str>);

impl std::fmt::Display for SubscriptionKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Change notification emitted when a row is created, updated, or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ChangeEvent {
	/// A new row was created
	Create {
		/// Path of the row: `<collection>/<id>`
		path: Box<str>,
		/// Full row data
		data: Value,
	},

	/// An existing row was updated
	Update {
		path: Box<str>,
		/// Row data after the update
		data: Value,
	},

	/// A row was deleted
	Delete { path: Box<str> },

	/// Signals that all initial rows have been yielded for a subscription
	Ready {
		/// Collection name
		path: Box<str>,
	},
}

impl ChangeEvent {
	pub fn create(collection: &Collection, id: &str, data: Value) -> Self {
		ChangeEvent::Create { path: format!("{}/{}", collection, id).into(), data }
	}

	pub fn update(collection: &Collection, id: &str, data: Value) -> Self {
		ChangeEvent::Update { path: format!("{}/{}", collection, id).into(), data }
	}

	pub fn delete(collection: &Collection, id: &str) -> Self {
		ChangeEvent::Delete { path: format!("{}/{}", collection, id).into() }
	}

	pub fn ready(collection: &Collection) -> Self {
		ChangeEvent::Ready { path: collection.as_str().into() }
	}

	pub fn path(&self) -> &str {
		match self {
			ChangeEvent::Create { path, .. }
			| ChangeEvent::Update { path, .. }
			| ChangeEvent::Delete { path }
			| ChangeEvent::Ready { path } => path,
		}
	}

	/// Collection the event belongs to (first path segment).
	pub fn collection(&self) -> Collection {
		let path = self.path();
		Collection::from_name(path.split_once('/').map_or(path, |(collection, _)| collection))
	}

	/// Row id (second path segment). `None` for `Ready` and malformed paths.
	pub fn id(&self) -> Option<&str> {
		match self {
			ChangeEvent::Ready { .. } => None,
			_ => self.path().split_once('/').map(|(_, id)| id).filter(|id| !id.is_empty()),
		}
	}

	pub fn data(&self) -> Option<&Value> {
		match self {
			ChangeEvent::Create { data, .. } | ChangeEvent::Update { data, .. } => Some(data),
			ChangeEvent::Delete { .. } | ChangeEvent::Ready { .. } => None,
		}
	}
}

/// Stream of change events. An `Err` item is a single undeliverable event; the end
/// of the stream means the transport disconnected.
pub type ChangeStream = Pin<Box<dyn Stream<Item = SyncResult<ChangeEvent>> + Send>>;

/// Remote Data Gateway Adapter trait.
///
/// Request/response CRUD per collection plus a change feed per (collection, filter).
/// Failures must be classified: network problems as `TransientFailure`,
/// validation or authorization refusals as `RejectedChange`.
#[async_trait]
pub trait GatewayAdapter: Debug + Send + Sync {
	/// Insert a row. The returned row is authoritative and may carry server-assigned
	/// fields, including a different id.
	async fn create(&self, collection: &Collection, data: Value) -> SyncResult<Value>;

	/// Get a row by id. Returns None if not found.
	async fn get(&self, collection: &Collection, id: &str) -> SyncResult<Option<Value>>;

	/// Merge `patch` into an existing row and return the full row.
	async fn update(&self, collection: &Collection, id: &str, patch: Value) -> SyncResult<Value>;

	/// Delete a row by id.
	async fn delete(&self, collection: &Collection, id: &str) -> SyncResult<()>;

	/// Query rows with optional filtering, sorting, and limit.
	async fn query(&self, collection: &Collection, opts: QueryOptions) -> SyncResult<Vec<Value>>;

	/// Subscribe to changes. Current matching rows are yielded first as `Create`
	/// events, followed by one `Ready`, then live changes.
	async fn subscribe(&self, opts: SubscriptionOptions) -> SyncResult<ChangeStream>;
}


// vim: ts=4
