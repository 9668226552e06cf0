//! Authority-side components for statesync
//!
//! The authority owns the canonical store. It answers `FETCH_STATE` requests
//! with the full snapshot, applies `DISPATCH` requests to the store and
//! broadcasts a `PATCH_STATE` message after every state change that yields a
//! non-empty diff.
//!
//! Setup happens in two steps. [`StoreWrapper::listen`] must run as soon as
//! the transport exists, before anything is awaited, so requests that arrive
//! while the authority is still starting up are queued. [`StoreWrapper::wrap`]
//! attaches the store later and replays the queue.

use crate::listener::DeferredListener;
use crate::metrics::{MetricsSnapshot, ReplicationMetrics};
use crate::protocol::{Envelope, FetchStateReply, MessageType, DEFAULT_CHANNEL_NAME};
use crate::serialization::{self, transform_payload, Transformer};
use crate::store::{Dispatched, Store};
use crate::strategies::{into_object, shallow, DiffStrategy, Strategy};
use crate::transport::{
    Destination, Handler, MessageSender, ReplyCallback, Responder, Transport, TransportError,
};
use crate::types::{Error, Result, Subscription};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};

pub mod responder;

pub use responder::{promise_responder, DispatchResponder};

/// Configuration for an authority
#[derive(Clone)]
pub struct AuthorityConfig {
    /// Channel shared with the proxies of this store
    pub channel_name: String,
    /// Applied to outgoing payloads
    pub serializer: Transformer,
    /// Applied to incoming `DISPATCH` payloads
    pub deserializer: Transformer,
    pub diff_strategy: Arc<dyn DiffStrategy>,
    pub dispatch_responder: DispatchResponder,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            serializer: serialization::noop(),
            deserializer: serialization::noop(),
            diff_strategy: Arc::new(shallow::diff),
            dispatch_responder: promise_responder(),
        }
    }
}

impl AuthorityConfig {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            ..Self::default()
        }
    }

    pub fn with_serializer(mut self, serializer: Transformer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_deserializer(mut self, deserializer: Transformer) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn with_diff_strategy(mut self, diff_strategy: impl DiffStrategy + 'static) -> Self {
        self.diff_strategy = Arc::new(diff_strategy);
        self
    }

    /// Uses the diff half of `strategy`.
    pub fn with_strategy(mut self, strategy: &Strategy) -> Self {
        self.diff_strategy = strategy.diff_strategy();
        self
    }

    pub fn with_dispatch_responder(mut self, dispatch_responder: DispatchResponder) -> Self {
        self.dispatch_responder = dispatch_responder;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(Error::invalid_config("channel_name is required"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuthorityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityConfig")
            .field("channel_name", &self.channel_name)
            .finish_non_exhaustive()
    }
}

/// Request listeners registered ahead of the store.
pub struct StoreWrapper {
    transport: Arc<dyn Transport>,
    state_provider: DeferredListener,
    action_listener: DeferredListener,
}

impl StoreWrapper {
    /// Registers the `FETCH_STATE` and `DISPATCH` listeners with `transport`
    /// right away. Requests received before [`StoreWrapper::wrap`] are queued.
    pub fn listen(transport: Arc<dyn Transport>) -> Self {
        let state_provider = DeferredListener::new();
        let action_listener = DeferredListener::new();

        transport.add_listener(state_provider.listener());
        transport.add_listener(action_listener.listener());

        tracing::debug!("Registered deferred authority listeners");

        Self {
            transport,
            state_provider,
            action_listener,
        }
    }

    /// Attaches `store`: subscribes to its changes, broadcasts its initial
    /// state and starts answering queued and future requests. Must be called
    /// within a tokio runtime, and only once.
    pub fn wrap(&self, store: Arc<dyn Store>, config: AuthorityConfig) -> Result<Authority> {
        config.validate()?;
        if self.state_provider.is_set() || self.action_listener.is_set() {
            return Err(Error::ListenerAlreadySet);
        }

        let AuthorityConfig {
            channel_name,
            serializer,
            deserializer,
            diff_strategy,
            dispatch_responder,
        } = config;

        tracing::info!(%channel_name, "Wrapping store");

        let shared = Arc::new(Shared {
            last_broadcast: Mutex::new(store.state()),
            store,
            transport: self.transport.clone(),
            channel_name,
            serializer,
            deserializer,
            diff_strategy,
            dispatch_responder,
            metrics: Arc::new(ReplicationMetrics::new()),
        });

        let weak = Arc::downgrade(&shared);
        let subscription = shared.store.subscribe(Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.patch_state();
            }
        }));

        shared.send_initial_state();

        self.state_provider
            .set_listener(fetch_state_handler(Arc::downgrade(&shared)))?;
        self.action_listener
            .set_listener(dispatch_handler(Arc::downgrade(&shared)))?;

        Ok(Authority {
            shared,
            subscription,
        })
    }
}

/// A wrapped store being replicated. Dropping it stops replication.
pub struct Authority {
    shared: Arc<Shared>,
    subscription: Subscription,
}

impl Authority {
    pub fn state(&self) -> Value {
        self.shared.store.state()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.shared.store
    }

    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Get the underlying metrics collector
    pub fn metrics_collector(&self) -> &Arc<ReplicationMetrics> {
        &self.shared.metrics
    }
}

impl Drop for Authority {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        tracing::debug!(channel_name = %self.shared.channel_name, "Stopped replicating store");
    }
}

struct Shared {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    channel_name: String,
    serializer: Transformer,
    deserializer: Transformer,
    diff_strategy: Arc<dyn DiffStrategy>,
    dispatch_responder: DispatchResponder,
    /// Snapshot the proxies were last brought up to date with
    last_broadcast: Mutex<Value>,
    metrics: Arc<ReplicationMetrics>,
}

impl Shared {
    fn send_initial_state(&self) {
        let state = self.last_broadcast.lock().clone();
        self.broadcast(Envelope::new(MessageType::State, self.channel_name.clone(), Some(state)));
        self.metrics.record_state_sent();
    }

    /// Diffs the store against the last broadcast snapshot and sends the
    /// difference. The lock is held while sending so broadcasts leave in
    /// the order the snapshots were taken.
    fn patch_state(&self) {
        let mut last_broadcast = self.last_broadcast.lock();
        let current = self.store.state();

        if !last_broadcast.is_object() || !current.is_object() {
            if *last_broadcast == current {
                self.metrics.record_empty_diff();
                return;
            }

            tracing::debug!(channel_name = %self.channel_name, "Snapshot root is not an object, sending full state");
            self.broadcast(Envelope::new(
                MessageType::State,
                self.channel_name.clone(),
                Some(current.clone()),
            ));
            self.metrics.record_state_sent();
            *last_broadcast = current;
            return;
        }

        let difference = self.diff_strategy.diff(&last_broadcast, &current);
        if difference.is_empty() {
            tracing::trace!(channel_name = %self.channel_name, "State change produced an empty diff");
            self.metrics.record_empty_diff();
            return;
        }

        let payload = match serde_json::to_value(&difference) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(%error, "Failed to encode state diff");
                return;
            }
        };

        tracing::debug!(
            channel_name = %self.channel_name,
            entries = difference.len(),
            "Broadcasting state patch"
        );
        self.broadcast(Envelope::new(
            MessageType::PatchState,
            self.channel_name.clone(),
            Some(payload),
        ));
        self.metrics.record_patch_sent(difference.len());
        *last_broadcast = current;
    }

    /// Sends to the runtime contexts and then to every known destination.
    /// Each send is independent; failures are expected when a destination
    /// hosts no listener and are only logged.
    fn broadcast(&self, envelope: Envelope) {
        let message = transform_payload(envelope.into_message(), &self.serializer);

        self.transport
            .send(message.clone(), None, Some(ignore_failure(None)));

        for destination in self.transport.destinations() {
            let on_reply = ignore_failure(Some(destination.clone()));
            self.transport
                .send(message.clone(), Some(&destination), Some(on_reply));
        }
    }

    fn handle_fetch_state(&self, message: Value, responder: Responder) -> bool {
        match Envelope::from_message(message) {
            Some(envelope) if envelope.is_for(MessageType::FetchState, &self.channel_name) => {
                tracing::debug!(channel_name = %self.channel_name, "Answering state request");

                // Answered under the broadcast lock so every later patch
                // applies on top of the snapshot sent here.
                let last_broadcast = self.last_broadcast.lock();
                let reply = FetchStateReply::new(last_broadcast.clone()).into_message();
                responder.send(transform_payload(reply, &self.serializer));
                true
            }
            _ => false,
        }
    }

    fn handle_dispatch(&self, message: Value, sender: MessageSender, responder: Responder) -> bool {
        let envelope = match Envelope::from_message(message) {
            Some(envelope) if envelope.is_for(MessageType::Dispatch, &self.channel_name) => envelope,
            _ => return false,
        };
        let Some(payload) = envelope.payload else {
            tracing::trace!(channel_name = %self.channel_name, "Ignoring dispatch without payload");
            return false;
        };

        let mut action = into_object((self.deserializer)(payload));
        action.insert("_sender".to_string(), sender.to_value());

        tracing::debug!(
            channel_name = %self.channel_name,
            action_type = ?action.get("type"),
            "Dispatching action"
        );
        self.metrics.record_dispatch();

        let outcome = self.count_failures(self.store.dispatch(Value::Object(action)));
        (self.dispatch_responder)(outcome, responder);

        true
    }

    fn count_failures(&self, outcome: anyhow::Result<Dispatched>) -> anyhow::Result<Dispatched> {
        match outcome {
            Ok(Dispatched::Pending(pending)) => {
                let metrics = self.metrics.clone();
                Ok(Dispatched::pending(async move {
                    let settled = pending.await;
                    if settled.is_err() {
                        metrics.record_dispatch_failure();
                    }
                    settled
                }))
            }
            Ok(ready) => Ok(ready),
            Err(error) => {
                self.metrics.record_dispatch_failure();
                Err(error)
            }
        }
    }
}

fn fetch_state_handler(shared: Weak<Shared>) -> Handler {
    Arc::new(move |message, _sender, responder| match shared.upgrade() {
        Some(shared) => shared.handle_fetch_state(message, responder),
        None => false,
    })
}

fn dispatch_handler(shared: Weak<Shared>) -> Handler {
    Arc::new(move |message, sender, responder| match shared.upgrade() {
        Some(shared) => shared.handle_dispatch(message, sender, responder),
        None => false,
    })
}

fn ignore_failure(destination: Option<Destination>) -> ReplyCallback {
    Box::new(move |reply: std::result::Result<Value, TransportError>| {
        if let Err(error) = reply {
            tracing::trace!(?destination, %error, "Broadcast was not received");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReducerStore;
    use crate::transport::memory::Hub;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn counter_store() -> Arc<ReducerStore> {
        Arc::new(ReducerStore::new(json!({ "count": 0 }), |state, action| {
            let count = state["count"].as_i64().unwrap_or(0);
            match action["type"].as_str() {
                Some("INCREMENT") => Ok(json!({ "count": count + 1 })),
                Some("NOOP") => Ok(state.clone()),
                Some("FAIL") => anyhow::bail!("boom"),
                _ => Ok(state.clone()),
            }
        }))
    }

    fn recorder(endpoint: &impl Transport) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.add_listener(Arc::new(move |message, _, _| {
            let _ = tx.send(message);
            false
        }));
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn request(endpoint: &impl Transport, message: Value) -> Value {
        let (tx, rx) = tokio::sync::oneshot::channel();
        endpoint.send(
            message,
            None,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        );
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(AuthorityConfig::default().validate().is_ok());

        let error = AuthorityConfig::new("").validate().unwrap_err();
        assert!(matches!(error, Error::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_wrap_rejects_invalid_config_and_second_wrap() {
        let hub = Hub::new();
        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));

        assert!(matches!(
            wrapper.wrap(counter_store(), AuthorityConfig::new("")),
            Err(Error::InvalidConfig { .. })
        ));

        let _authority = wrapper.wrap(counter_store(), AuthorityConfig::default()).unwrap();
        assert!(matches!(
            wrapper.wrap(counter_store(), AuthorityConfig::default()),
            Err(Error::ListenerAlreadySet)
        ));
    }

    #[tokio::test]
    async fn test_broadcasts_initial_state_then_patches() {
        let hub = Hub::new();
        let observer = hub.endpoint();
        let mut messages = recorder(&observer);

        let store = counter_store();
        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));
        let authority = wrapper.wrap(store.clone(), AuthorityConfig::new("c")).unwrap();

        assert_eq!(
            next(&mut messages).await,
            json!({ "type": "STATE", "channelName": "c", "payload": { "count": 0 } })
        );

        store.dispatch(json!({ "type": "INCREMENT" })).unwrap();
        assert_eq!(
            next(&mut messages).await,
            json!({
                "type": "PATCH_STATE",
                "channelName": "c",
                "payload": [{ "key": "count", "change": "updated", "value": 1 }]
            })
        );

        store.dispatch(json!({ "type": "NOOP" })).unwrap();
        store.dispatch(json!({ "type": "INCREMENT" })).unwrap();
        assert_eq!(
            next(&mut messages).await["payload"],
            json!([{ "key": "count", "change": "updated", "value": 2 }])
        );

        let metrics = authority.metrics();
        assert_eq!(metrics.states_sent, 1);
        assert_eq!(metrics.patches_sent, 2);
        assert_eq!(metrics.empty_diffs_suppressed, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_tabs() {
        let hub = Hub::new();
        let tab = hub.tab_endpoint(7);
        let mut messages = recorder(&tab);

        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));
        let _authority = wrapper.wrap(counter_store(), AuthorityConfig::new("c")).unwrap();

        assert_eq!(next(&mut messages).await["type"], json!("STATE"));
    }

    #[tokio::test]
    async fn test_answers_state_requests_on_its_channel_only() {
        let hub = Hub::new();
        let client = hub.endpoint();

        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));
        let _authority = wrapper
            .wrap(
                counter_store(),
                AuthorityConfig::new("c").with_serializer(serialization::json_serializer()),
            )
            .unwrap();

        let reply = request(&client, json!({ "type": "FETCH_STATE", "channelName": "c" })).await;
        assert_eq!(reply, json!({ "type": "FETCH_STATE", "payload": "{\"count\":0}" }));

        let (tx, rx) = tokio::sync::oneshot::channel();
        client.send(
            json!({ "type": "FETCH_STATE", "channelName": "other" }),
            None,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        );
        let unanswered = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(unanswered, Err(TransportError::NoResponse));
    }

    #[tokio::test]
    async fn test_dispatch_attaches_sender_and_replies() {
        let hub = Hub::new();
        let client = hub.tab_endpoint(3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let store = Arc::new(ReducerStore::new(json!({}), move |state, action| {
            record.lock().push(action.clone());
            Ok(state.clone())
        }));

        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));
        let authority = wrapper.wrap(store, AuthorityConfig::new("c")).unwrap();

        let reply = request(
            &client,
            json!({ "type": "DISPATCH", "channelName": "c", "payload": { "type": "PING", "payload": 5 } }),
        )
        .await;

        assert_eq!(reply["error"], Value::Null);
        assert_eq!(reply["value"]["payload"], json!(5));

        let action = seen.lock()[0].clone();
        assert_eq!(action["type"], json!("PING"));
        assert_eq!(action["_sender"]["tab"], json!(3));
        assert_eq!(authority.metrics().dispatches, 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_replied() {
        let hub = Hub::new();
        let client = hub.endpoint();

        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));
        let authority = wrapper.wrap(counter_store(), AuthorityConfig::new("c")).unwrap();

        let reply = request(
            &client,
            json!({ "type": "DISPATCH", "channelName": "c", "payload": { "type": "FAIL" } }),
        )
        .await;

        assert_eq!(reply, json!({ "error": "boom", "value": null }));
        assert_eq!(authority.metrics().dispatch_failures, 1);
        assert_eq!(authority.state(), json!({ "count": 0 }));
    }

    #[tokio::test]
    async fn test_requests_before_wrap_are_answered_after() {
        let hub = Hub::new();
        let client = hub.endpoint();
        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));

        let (tx, rx) = tokio::sync::oneshot::channel();
        client.send(
            json!({ "type": "DISPATCH", "channelName": "c", "payload": { "type": "INCREMENT" } }),
            None,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let authority = wrapper.wrap(counter_store(), AuthorityConfig::new("c")).unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply["error"], Value::Null);
        assert_eq!(authority.state(), json!({ "count": 1 }));
    }

    #[tokio::test]
    async fn test_non_object_state_is_sent_whole() {
        let hub = Hub::new();
        let observer = hub.endpoint();
        let mut messages = recorder(&observer);

        let store = Arc::new(ReducerStore::new(json!(0), |state, _| {
            Ok(json!(state.as_i64().unwrap_or(0) + 1))
        }));
        let wrapper = StoreWrapper::listen(Arc::new(hub.endpoint()));
        let _authority = wrapper.wrap(store.clone(), AuthorityConfig::new("c")).unwrap();

        assert_eq!(next(&mut messages).await["payload"], json!(0));

        store.dispatch(json!({ "type": "ANY" })).unwrap();
        let message = next(&mut messages).await;
        assert_eq!(message["type"], json!("STATE"));
        assert_eq!(message["payload"], json!(1));
    }
}
