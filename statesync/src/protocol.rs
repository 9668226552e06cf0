//! Wire protocol shared by the authority and its proxies
//!
//! Every message is a JSON object `{ type, channelName, payload? }`. The
//! channel name scopes one authority/proxy pair, so several pairs can share a
//! single transport. Envelopes carry no message id; nothing is deduplicated.

use crate::transport::TransportError;
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Channel used when the configuration does not name one.
pub const DEFAULT_CHANNEL_NAME: &str = "webext.channel";

/// Prepended to every error surfaced by [`crate::Proxy::mutate`].
pub const AUTHORITY_ERR_PREFIX: &str = "\nLooks like there is an error in the authority context. \
You might want to inspect the authority for more details.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Proxy asks for a full snapshot; the authority replies with the same type.
    FetchState,
    /// Full snapshot broadcast.
    State,
    /// Diff broadcast.
    PatchState,
    /// Mutation request.
    Dispatch,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::FetchState => "FETCH_STATE",
            MessageType::State => "STATE",
            MessageType::PatchState => "PATCH_STATE",
            MessageType::Dispatch => "DISPATCH",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message envelope for all statesync communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(rename = "channelName")]
    pub channel_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn new(kind: MessageType, channel_name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind,
            channel_name: channel_name.into(),
            payload,
        }
    }

    /// Parses a raw transport message. Foreign or malformed messages yield
    /// `None`; they are expected on a shared transport and are not errors.
    pub fn from_message(message: Value) -> Option<Self> {
        serde_json::from_value(message).ok()
    }

    pub fn into_message(self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::from(self.kind.as_str()));
        object.insert("channelName".to_string(), Value::from(self.channel_name));
        if let Some(payload) = self.payload {
            object.insert("payload".to_string(), payload);
        }
        Value::Object(object)
    }

    pub fn is_for(&self, kind: MessageType, channel_name: &str) -> bool {
        self.kind == kind && self.channel_name == channel_name
    }
}

/// Direct reply to a `FETCH_STATE` request. It carries no channel name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchStateReply {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
}

impl FetchStateReply {
    pub fn new(state: Value) -> Self {
        Self {
            kind: MessageType::FetchState,
            payload: state,
        }
    }

    pub fn from_message(message: Value) -> Option<Self> {
        serde_json::from_value::<Self>(message)
            .ok()
            .filter(|reply| reply.kind == MessageType::FetchState)
    }

    pub fn into_message(self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::from(self.kind.as_str()));
        object.insert("payload".to_string(), self.payload);
        Value::Object(object)
    }
}

/// Reply to a `DISPATCH` request: `{ error: string | null, value: any | null }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReply {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl DispatchReply {
    pub fn success(value: Value) -> Self {
        Self {
            error: None,
            value: Some(value),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            value: None,
        }
    }

    pub fn from_message(message: Value) -> Result<Self> {
        if !message.is_object() {
            return Err(TransportError::InvalidReply {
                reason: format!("expected an object, got {message}"),
            }
            .into());
        }

        serde_json::from_value(message).map_err(|e| {
            TransportError::InvalidReply {
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn into_message(self) -> Value {
        let mut object = Map::new();
        object.insert(
            "error".to_string(),
            self.error.map(Value::from).unwrap_or(Value::Null),
        );
        object.insert("value".to_string(), self.value.unwrap_or(Value::Null));
        Value::Object(object)
    }

    /// Resolves the reply. An error wins over a value when both are present;
    /// an empty error string counts as no error.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(message) if !message.is_empty() => Err(Error::Authority { message }),
            _ => Ok(self
                .value
                .and_then(|mut value| value.get_mut("payload").map(Value::take))
                .unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let message =
            Envelope::new(MessageType::PatchState, "ch", Some(json!([1]))).into_message();
        assert_eq!(
            message,
            json!({ "type": "PATCH_STATE", "channelName": "ch", "payload": [1] })
        );

        let fetch = Envelope::new(MessageType::FetchState, "ch", None).into_message();
        assert_eq!(fetch, json!({ "type": "FETCH_STATE", "channelName": "ch" }));
    }

    #[test]
    fn test_foreign_messages_are_not_envelopes() {
        assert!(Envelope::from_message(json!("hello")).is_none());
        assert!(Envelope::from_message(json!({ "type": "STATE" })).is_none());
        assert!(Envelope::from_message(json!({ "type": "OTHER", "channelName": "ch" })).is_none());
        assert!(Envelope::from_message(json!(null)).is_none());

        let envelope = Envelope::from_message(json!({ "type": "DISPATCH", "channelName": "ch" }))
            .expect("valid envelope");
        assert!(envelope.is_for(MessageType::Dispatch, "ch"));
        assert!(!envelope.is_for(MessageType::Dispatch, "other"));
    }

    #[test]
    fn test_fetch_state_reply_requires_type() {
        let reply = FetchStateReply::new(json!({ "a": 1 })).into_message();
        assert_eq!(reply, json!({ "type": "FETCH_STATE", "payload": { "a": 1 } }));
        assert!(FetchStateReply::from_message(reply).is_some());
        assert!(FetchStateReply::from_message(json!({ "type": "STATE", "payload": {} })).is_none());
    }

    #[test]
    fn test_dispatch_reply_error_wins_over_value() {
        let reply = DispatchReply::from_message(json!({
            "error": "nope",
            "value": { "payload": 3 }
        }))
        .unwrap();

        let error = reply.into_result().unwrap_err();
        assert!(error.to_string().contains("nope"));
    }

    #[test]
    fn test_dispatch_reply_resolves_with_payload() {
        let reply = DispatchReply::success(json!({ "type": "X", "payload": 42 }));
        let message = reply.into_message();
        assert_eq!(message["error"], Value::Null);

        let value = DispatchReply::from_message(message).unwrap().into_result().unwrap();
        assert_eq!(value, json!(42));
    }

    #[test]
    fn test_dispatch_reply_rejects_non_objects() {
        let error = DispatchReply::from_message(json!("oops")).unwrap_err();
        assert!(matches!(
            error,
            Error::Transport(TransportError::InvalidReply { .. })
        ));
    }
}
