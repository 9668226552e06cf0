//! Recursive comparison of nested objects and arrays.

use super::{array, into_object, Change, Diff, DiffEntry, EditScript};
use serde_json::{Map, Value};

/// Decides, for a pair of values of the same container type, whether to
/// recurse into them or ship the new value whole. Receives the old value,
/// the new value and the key path leading to them.
pub type ShouldContinue = dyn Fn(&Value, &Value, &[String]) -> bool + Send + Sync;

/// Deep diff that always recurses.
pub fn diff(old: &Value, new: &Value) -> Diff {
    diff_with(old, new, &|_, _, _| true)
}

/// Binds `should_continue` into a diff function usable as a strategy.
pub fn make_diff<F>(should_continue: F) -> impl Fn(&Value, &Value) -> Diff + Send + Sync
where
    F: Fn(&Value, &Value, &[String]) -> bool + Send + Sync + 'static,
{
    move |old: &Value, new: &Value| diff_with(old, new, &should_continue)
}

/// Deep diff that consults `should_continue` before every recursion.
/// Non-object roots are treated as empty objects.
pub fn diff_with(old: &Value, new: &Value, should_continue: &ShouldContinue) -> Diff {
    let empty = Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut path = Vec::new();
    diff_objects(old, new, should_continue, &mut path)
}

fn diff_objects(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    should_continue: &ShouldContinue,
    path: &mut Vec<String>,
) -> Diff {
    let mut difference = Vec::new();

    for (key, value) in new {
        let previous = old.get(key);
        if previous == Some(value) {
            continue;
        }

        path.push(key.clone());
        let change = diff_values(previous, value, should_continue, path);
        path.pop();

        difference.push(DiffEntry {
            key: key.clone(),
            change,
        });
    }

    for key in old.keys() {
        if !new.contains_key(key) {
            difference.push(DiffEntry::removed(key.as_str()));
        }
    }

    difference
}

fn diff_values(
    old: Option<&Value>,
    new: &Value,
    should_continue: &ShouldContinue,
    path: &mut Vec<String>,
) -> Change {
    match (old, new) {
        (Some(old @ Value::Array(before)), Value::Array(after)) if should_continue(old, new, path) => {
            Change::ArrayUpdated {
                value: array::get_patch(before, after),
            }
        }
        (Some(old @ Value::Object(before)), Value::Object(after)) if should_continue(old, new, path) => {
            Change::KeysUpdated {
                value: diff_objects(before, after, should_continue, path),
            }
        }
        _ => Change::Updated { value: new.clone() },
    }
}

/// Applies a deep diff. Nested `updated_keys` entries patch the nested
/// value recursively and `updated_array` entries replay their edit script.
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
            Change::KeysUpdated { value } => {
                let slot = object.entry(entry.key.clone()).or_insert(Value::Null);
                *slot = patch(slot.take(), value);
            }
            Change::ArrayUpdated { value } => {
                let slot = object.entry(entry.key.clone()).or_insert(Value::Null);
                *slot = patch_array(slot.take(), value);
            }
        }
    }

    Value::Object(object)
}

fn patch_array(base: Value, script: &EditScript) -> Value {
    let items = match base {
        Value::Array(items) => items,
        _ => Vec::new(),
    };
    Value::Array(array::apply_patch(&items, script))
}
