//! Validation of untyped gateway rows before they reach the cache.

use serde_json::Value;

use crate::prelude::*;

/// Parse a raw row into an `Entity`, checking it against the collection's record type.
pub fn parse_row(collection: &Collection, row: Value) -> SyncResult<Entity> {
	collection
		.validate(&row)
		.map_err(|err| Error::MalformedResponse(format!("{} row: {}", collection, err)))?;
	Entity::from_value(row)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_parse_row() {
		let entity = parse_row(&Collection::Tasks, json!({"id": "t1", "title": "A"})).unwrap();
		assert_eq!(entity.id().as_str(), "t1");

		assert!(matches!(
			parse_row(&Collection::Tasks, json!({"id": "t1", "title": 5})),
			Err(Error::MalformedResponse(_))
		));
		assert!(matches!(
			parse_row(&Collection::Custom("notes".into()), json!({"title": "no id"})),
			Err(Error::MalformedResponse(_))
		));
	}
}

// vim: ts=4
