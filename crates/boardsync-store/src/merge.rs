//! Field merge utilities used when patching cached entities.
//!
//! Shallow merge semantics:
//! - Top-level fields from the patch overwrite the target
//! - Nested objects are replaced entirely, not merged
//! - Dot notation keys (e.g., "meta.color") update nested fields
//! - `null` values delete the field
//! - The `id` field is never touched by a patch

use serde_json::{Map, Value};

use crate::prelude::*;

/// Merge `patch` into `target` in place.
///
/// Fails with `RejectedChange` if a dot notation key tries to traverse a non-object field;
/// in that case `target` may be partially updated, so callers merge into a copy.
pub fn merge_fields(target: &mut Map<String, Value>, patch: &Map<String, Value>) -> SyncResult<()> {
	for (key, patch_value) in patch {
		if key == "id" {
			continue;
		}
		if key.contains('.') {
			apply_dot_notation(target, key, patch_value)?;
		} else if patch_value.is_null() {
			target.remove(key);
		} else {
			target.insert(key.clone(), patch_value.clone());
		}
	}
	Ok(())
}

/// Return the merged copy of `entity`, leaving the original untouched.
pub fn merged(entity: &Entity, patch: &Map<String, Value>) -> SyncResult<Entity> {
	let mut data = entity.fields().clone();
	merge_fields(&mut data, patch)?;
	Ok(Entity::new(entity.id().clone(), data))
}

/// Fields whose values differ between `before` and `after`, as a patch.
///
/// Removed fields appear as `null`, so `merge_fields(before, diff(before, after))`
/// yields `after`.
pub fn diff(before: &Map<String, Value>, after: &Map<String, Value>) -> Map<String, Value> {
	let mut patch = Map::new();
	for (key, value) in after {
		if before.get(key) != Some(value) {
			patch.insert(key.clone(), value.clone());
		}
	}
	for key in before.keys() {
		if !after.contains_key(key) {
			patch.insert(key.clone(), Value::Null);
		}
	}
	patch.remove("id");
	patch
}

fn apply_dot_notation(
	target: &mut Map<String, Value>,
	dot_key: &str,
	value: &Value,
) -> SyncResult<()> {
	let Some((parents, final_key)) = dot_key.rsplit_once('.') else {
		return Ok(());
	};

	let mut current = target;
	for part in parents.split('.') {
		let entry = current.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
		match entry.as_object_mut() {
			Some(obj) => current = obj,
			None => {
				return Err(Error::RejectedChange(format!(
					"cannot apply '{}': field '{}' is not an object",
					dot_key, part
				)));
			}
		}
	}

	if value.is_null() {
		current.remove(final_key);
	} else {
		current.insert(final_key.to_string(), value.clone());
	}
	Ok(())
}


// vim: ts=4
