//! Payload transforms applied on the way out of and into an endpoint.

use serde_json::Value;
use std::sync::Arc;

/// Rewrites a message payload. Both ends default to [`noop`].
pub type Transformer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

pub fn noop() -> Transformer {
    Arc::new(|payload| payload)
}

/// Serializes payloads into JSON strings.
pub fn json_serializer() -> Transformer {
    Arc::new(|payload: Value| Value::String(payload.to_string()))
}

/// Inverse of [`json_serializer`]. Payloads that are not JSON strings pass
/// through untouched.
pub fn json_deserializer() -> Transformer {
    Arc::new(|payload: Value| match payload {
        Value::String(text) => match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => Value::String(text),
        },
        other => other,
    })
}

/// Runs `transformer` over the `payload` field of `message`. Messages without
/// a payload, or with a `null` one, are returned as they are.
pub fn transform_payload(mut message: Value, transformer: &Transformer) -> Value {
    if let Some(slot) = message.get_mut("payload") {
        if !slot.is_null() {
            let payload = slot.take();
            *slot = transformer(payload);
        }
    }
    message
}
