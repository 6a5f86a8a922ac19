use boardsync::gateway_adapter::{QueryOptions, SortField};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Server timestamp in the RFC 3339 form the backend emits.
pub fn server_timestamp() -> String {
	Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Apply an update patch to a stored row: top-level overwrite, `null` deletes,
/// the `id` column is immutable.
pub fn apply_patch(row: &mut Map<String, Value>, patch: &Map<String, Value>) {
	for (key, value) in patch {
		if key == "id" {
			continue;
		}
		if value.is_null() {
			row.remove(key);
		} else {
			row.insert(key.clone(), value.clone());
		}
	}
}

/// Filter, sort and limit rows according to query options.
pub fn select_rows<'a>(rows: impl Iterator<Item = &'a Value>, opts: &QueryOptions) -> Vec<Value> {
	let mut selected: Vec<Value> = rows
		.filter(|row| opts.filter.as_ref().is_none_or(|filter| filter.matches(row)))
		.cloned()
		.collect();

	if let Some(sort) = &opts.sort {
		selected.sort_by(|a, b| compare_rows(a, b, sort));
	}

	if let Some(limit) = opts.limit {
		selected.truncate(limit as usize);
	}

	selected
}

fn compare_rows(a: &Value, b: &Value, sort: &[SortField]) -> Ordering {
	for field in sort {
		let ord = compare_values(a.get(&field.field), b.get(&field.field));
		let ord = if field.ascending { ord } else { ord.reverse() };
		if ord != Ordering::Equal {
			return ord;
		}
	}
	Ordering::Equal
}

/// Compare two JSON values for sorting. Missing values sort first.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
	match (a, b) {
		(None, None) => Ordering::Equal,
		(None, Some(_)) => Ordering::Less,
		(Some(_), None) => Ordering::Greater,
		(Some(Value::Number(a)), Some(Value::Number(b))) => {
			a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
		}
		(Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
		(Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
		(Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
	}
}


// vim: ts=4
