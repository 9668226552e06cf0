//! Top-level key comparison.

use super::{into_object, Change, Diff, DiffEntry};
use serde_json::{Map, Value};

/// Emits `updated` for every key of `new` whose value differs from `old`
/// (falsy values included), then `removed` for every key only `old` has.
/// Non-object inputs are treated as empty objects.
pub fn diff(old: &Value, new: &Value) -> Diff {
    let empty = Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut difference = Vec::new();

    for (key, value) in new {
        if old.get(key) != Some(value) {
            difference.push(DiffEntry::updated(key.as_str(), value.clone()));
        }
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            difference.push(DiffEntry::removed(key.as_str()));
        }
    }

    difference
}

/// Applies `updated` and `removed` entries in order on a copy of `base`.
/// Nested change kinds are ignored.
pub fn patch(base: Value, difference: &Diff) -> Value {
    if difference.is_empty() {
        return base;
    }

    let mut object = into_object(base);

    for entry in difference {
        match &entry.change {
            Change::Updated { value } => {
                object.insert(entry.key.clone(), value.clone());
            }
            Change::Removed => {
                object.shift_remove(&entry.key);
            }
            Change::KeysUpdated { .. } | Change::ArrayUpdated { .. } => {
                tracing::trace!(key = %entry.key, "Shallow patch ignores nested change");
            }
        }
    }

    Value::Object(object)
}
