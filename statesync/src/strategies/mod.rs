//! Diff and patch strategies
//!
//! A strategy is a pair of pure functions satisfying, for every pair of
//! snapshots `a` and `b`, `patch(a, diff(a, b)) == b`. The authority uses the
//! diff half to turn a state change into a `PATCH_STATE` payload, the proxies
//! use the patch half to replay it.
//!
//! * [`shallow`]: compares top-level keys only. The default.
//! * [`deep`]: recurses into nested objects and uses [`array`] edit scripts
//!   for arrays, with an optional cut-off predicate.
//! * [`array`]: LCS based edit scripts over ordered sequences.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod array;
pub mod deep;
pub mod shallow;

pub use array::EditOp;

/// Ordered change list. Entry order matters when patching.
pub type Diff = Vec<DiffEntry>;

/// Ordered array edit script.
pub type EditScript<T = Value> = Vec<EditOp<T>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub key: String,
    #[serde(flatten)]
    pub change: Change,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change")]
pub enum Change {
    /// The key now holds `value`, whether it existed before or not.
    #[serde(rename = "updated")]
    Updated { value: Value },
    #[serde(rename = "removed")]
    Removed,
    /// The nested object changed according to its own diff.
    #[serde(rename = "updated_keys")]
    KeysUpdated { value: Diff },
    /// The nested array changed according to an edit script.
    #[serde(rename = "updated_array")]
    ArrayUpdated { value: EditScript },
}

impl DiffEntry {
    pub fn updated(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            change: Change::Updated { value },
        }
    }

    pub fn removed(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            change: Change::Removed,
        }
    }

    pub fn keys_updated(key: impl Into<String>, value: Diff) -> Self {
        Self {
            key: key.into(),
            change: Change::KeysUpdated { value },
        }
    }

    pub fn array_updated(key: impl Into<String>, value: EditScript) -> Self {
        Self {
            key: key.into(),
            change: Change::ArrayUpdated { value },
        }
    }
}

pub trait DiffStrategy: Send + Sync {
    /// Describes how to get from `old` to `new`. Neither input is modified.
    fn diff(&self, old: &Value, new: &Value) -> Diff;
}

pub trait PatchStrategy: Send + Sync {
    /// Applies `diff` to `base`. An empty diff hands `base` back untouched.
    fn patch(&self, base: Value, diff: &Diff) -> Value;
}

impl<F> DiffStrategy for F
where
    F: Fn(&Value, &Value) -> Diff + Send + Sync,
{
    fn diff(&self, old: &Value, new: &Value) -> Diff {
        self(old, new)
    }
}

impl<F> PatchStrategy for F
where
    F: Fn(Value, &Diff) -> Value + Send + Sync,
{
    fn patch(&self, base: Value, diff: &Diff) -> Value {
        self(base, diff)
    }
}

/// A named diff/patch pair.
#[derive(Clone)]
pub struct Strategy {
    name: String,
    diff: Arc<dyn DiffStrategy>,
    patch: Arc<dyn PatchStrategy>,
}

impl Strategy {
    pub fn shallow() -> Self {
        Self::custom("shallow", shallow::diff, shallow::patch)
    }

    pub fn deep() -> Self {
        Self::custom("deep", deep::diff, deep::patch)
    }

    /// Deep strategy that stops recursing wherever `should_continue` says so.
    pub fn deep_with<F>(should_continue: F) -> Self
    where
        F: Fn(&Value, &Value, &[String]) -> bool + Send + Sync + 'static,
    {
        Self::custom("deep", deep::make_diff(should_continue), deep::patch)
    }

    pub fn custom(
        name: impl Into<String>,
        diff: impl DiffStrategy + 'static,
        patch: impl PatchStrategy + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            diff: Arc::new(diff),
            patch: Arc::new(patch),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn diff_strategy(&self) -> Arc<dyn DiffStrategy> {
        self.diff.clone()
    }

    pub fn patch_strategy(&self) -> Arc<dyn PatchStrategy> {
        self.patch.clone()
    }

    pub fn diff(&self, old: &Value, new: &Value) -> Diff {
        self.diff.diff(old, new)
    }

    pub fn patch(&self, base: Value, diff: &Diff) -> Value {
        self.patch.patch(base, diff)
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::shallow()
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name).finish()
    }
}

/// Strategy selector used by configuration files and the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Shallow,
    Deep,
}

impl From<StrategyKind> for Strategy {
    fn from(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Shallow => Strategy::shallow(),
            StrategyKind::Deep => Strategy::deep(),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Shallow => f.write_str("shallow"),
            StrategyKind::Deep => f.write_str("deep"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shallow" => Ok(StrategyKind::Shallow),
            "deep" => Ok(StrategyKind::Deep),
            other => Err(crate::Error::invalid_config(format!(
                "unknown strategy {other:?}, expected \"shallow\" or \"deep\""
            ))),
        }
    }
}

/// Takes the object out of `base`; anything else patches as an empty object.
pub(crate) fn into_object(base: Value) -> Map<String, Value> {
    match base {
        Value::Object(object) => object,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_entry_wire_shape() {
        let diff = vec![
            DiffEntry::updated("a", json!(null)),
            DiffEntry::removed("b"),
            DiffEntry::keys_updated("c", vec![DiffEntry::updated("d", json!(1))]),
            DiffEntry::array_updated("e", vec![EditOp::add(0, 0, vec![json!("x")])]),
        ];

        let wire = serde_json::to_value(&diff).unwrap();
        assert_eq!(
            wire,
            json!([
                { "key": "a", "change": "updated", "value": null },
                { "key": "b", "change": "removed" },
                { "key": "c", "change": "updated_keys", "value": [
                    { "key": "d", "change": "updated", "value": 1 }
                ] },
                { "key": "e", "change": "updated_array", "value": [
                    { "type": "add", "oldPos": 0, "newPos": 0, "items": ["x"] }
                ] }
            ])
        );

        let parsed: Diff = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, diff);
    }

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!("deep".parse::<StrategyKind>().unwrap(), StrategyKind::Deep);
        assert_eq!(StrategyKind::default(), StrategyKind::Shallow);
        assert!("fancy".parse::<StrategyKind>().is_err());
        assert_eq!(Strategy::from(StrategyKind::Deep).name(), "deep");
    }

    #[test]
    fn test_custom_strategy_from_closures() {
        let strategy = Strategy::custom(
            "replace",
            |_: &Value, new: &Value| vec![DiffEntry::updated("all", new.clone())],
            |_: Value, diff: &Diff| match diff.first().map(|entry| &entry.change) {
                Some(Change::Updated { value }) => value.clone(),
                _ => Value::Null,
            },
        );

        let old = json!({ "a": 1 });
        let new = json!({ "b": 2 });
        assert_eq!(strategy.patch(old.clone(), &strategy.diff(&old, &new)), new);
    }
}
