//! Proxy-side components for statesync
//!
//! A [`Proxy`] keeps a local replica of the authority's state. It asks for a
//! full snapshot when it connects, replaces its replica on `STATE` messages,
//! patches it on `PATCH_STATE` messages and forwards mutations to the
//! authority as `DISPATCH` requests.

use crate::protocol::{DispatchReply, Envelope, FetchStateReply, MessageType, DEFAULT_CHANNEL_NAME};
use crate::serialization::{self, transform_payload, Transformer};
use crate::strategies::{shallow, Diff, PatchStrategy, Strategy};
use crate::transport::{Handler, Transport, TransportError};
use crate::types::{Error, Observers, Result, Subscription};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};

/// Configuration for a proxy
#[derive(Clone)]
pub struct ProxyConfig {
    /// Channel of the authority to replicate
    pub channel_name: String,
    /// Replica contents until the first snapshot arrives
    pub state: Value,
    /// Applied to outgoing `DISPATCH` payloads
    pub serializer: Transformer,
    /// Applied to incoming payloads
    pub deserializer: Transformer,
    pub patch_strategy: Arc<dyn PatchStrategy>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            state: json!({}),
            serializer: serialization::noop(),
            deserializer: serialization::noop(),
            patch_strategy: Arc::new(shallow::patch),
        }
    }
}

impl ProxyConfig {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_serializer(mut self, serializer: Transformer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_deserializer(mut self, deserializer: Transformer) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn with_patch_strategy(mut self, patch_strategy: impl PatchStrategy + 'static) -> Self {
        self.patch_strategy = Arc::new(patch_strategy);
        self
    }

    /// Uses the patch half of `strategy`.
    pub fn with_strategy(mut self, strategy: &Strategy) -> Self {
        self.patch_strategy = strategy.patch_strategy();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(Error::invalid_config("channel_name is required"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("channel_name", &self.channel_name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Local replica of an authority's state. Clones share the same replica.
#[derive(Clone)]
pub struct Proxy {
    shared: Arc<Shared>,
}

/// Non-owning handle created by [`Proxy::downgrade`].
#[derive(Clone)]
pub struct WeakProxy {
    shared: Weak<Shared>,
}

impl WeakProxy {
    /// Returns `None` once every [`Proxy`] clone has been dropped.
    pub fn upgrade(&self) -> Option<Proxy> {
        self.shared.upgrade().map(|shared| Proxy { shared })
    }
}

struct Shared {
    channel_name: String,
    state: Mutex<Value>,
    observers: Observers,
    ready: watch::Sender<bool>,
    serializer: Transformer,
    deserializer: Transformer,
    patch_strategy: Arc<dyn PatchStrategy>,
    transport: Arc<dyn Transport>,
}

impl Proxy {
    /// Registers the broadcast listener and requests the current state from
    /// the authority. Must be called within a tokio runtime.
    pub fn connect(transport: Arc<dyn Transport>, config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let ProxyConfig {
            channel_name,
            state,
            serializer,
            deserializer,
            patch_strategy,
        } = config;

        let (ready, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            channel_name,
            state: Mutex::new(state),
            observers: Observers::default(),
            ready,
            serializer,
            deserializer,
            patch_strategy,
            transport,
        });

        shared
            .transport
            .add_listener(message_handler(Arc::downgrade(&shared)));

        let weak = Arc::downgrade(&shared);
        let request = Envelope::new(MessageType::FetchState, shared.channel_name.clone(), None);
        shared.transport.send(
            request.into_message(),
            None,
            Some(Box::new(move |reply: std::result::Result<Value, TransportError>| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match reply {
                    Ok(message) => shared.initialize(message),
                    Err(error) => tracing::debug!(
                        channel_name = %shared.channel_name,
                        %error,
                        "State request went unanswered, waiting for a broadcast"
                    ),
                }
            })),
        );

        tracing::debug!(channel_name = %shared.channel_name, "Proxy connected");

        Ok(Self { shared })
    }

    /// Current replica.
    pub fn read(&self) -> Value {
        self.shared.state.lock().clone()
    }

    /// Runs `f` against the replica without cloning it.
    pub fn read_with<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.shared.state.lock())
    }

    /// Calls `callback` after every replacement or patch of the replica.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.observers.add(Arc::new(callback))
    }

    /// Resolves once the first full snapshot has been received.
    pub async fn ready(&self) {
        let mut ready = self.shared.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub async fn ready_then<F, T>(&self, then: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.ready().await;
        then()
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    /// Sends `payload` to the authority as an action and resolves with the
    /// `payload` of the dispatch result.
    ///
    /// Fails with [`Error::Authority`] if the authority reports an error and
    /// with [`Error::Transport`] if no reply arrives.
    pub async fn mutate(&self, payload: Value) -> Result<Value> {
        let shared = &self.shared;
        let request = Envelope::new(MessageType::Dispatch, shared.channel_name.clone(), Some(payload));
        let message = transform_payload(request.into_message(), &shared.serializer);

        let (reply_tx, reply_rx) = oneshot::channel();
        shared.transport.send(
            message,
            None,
            Some(Box::new(move |reply| {
                let _ = reply_tx.send(reply);
            })),
        );

        let reply = reply_rx.await.map_err(|_| TransportError::NoResponse)??;
        let result = DispatchReply::from_message(reply)?.into_result();

        if let Err(error) = &result {
            tracing::debug!(channel_name = %shared.channel_name, %error, "Mutation failed");
        }

        result
    }

    /// Handle that does not keep the replica alive, for use inside the
    /// proxy's own observers.
    pub fn downgrade(&self) -> WeakProxy {
        WeakProxy {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// No-op; proxies have no reducer.
    pub fn replace_reducer<R>(&self, _reducer: R) {}

    pub fn channel_name(&self) -> &str {
        &self.shared.channel_name
    }
}

impl Shared {
    fn on_message(&self, message: Value) {
        let Some(envelope) = Envelope::from_message(message) else {
            return;
        };
        if envelope.channel_name != self.channel_name {
            tracing::trace!(
                channel_name = %self.channel_name,
                foreign = %envelope.channel_name,
                "Ignoring message for another channel"
            );
            return;
        }

        let payload = envelope.payload.map(|payload| (self.deserializer)(payload));

        match envelope.kind {
            MessageType::State => {
                tracing::debug!(channel_name = %self.channel_name, "Received full state");
                self.replace_state(payload.unwrap_or(Value::Null));
            }
            MessageType::PatchState => {
                let Some(payload) = payload else {
                    return;
                };
                match serde_json::from_value::<Diff>(payload) {
                    Ok(difference) => self.patch_state(&difference),
                    Err(error) => {
                        tracing::warn!(channel_name = %self.channel_name, %error, "Ignoring malformed patch")
                    }
                }
            }
            MessageType::FetchState | MessageType::Dispatch => {}
        }
    }

    /// Handles the direct reply to the state request sent on connect.
    fn initialize(&self, message: Value) {
        let message = transform_payload(message, &self.deserializer);
        match FetchStateReply::from_message(message) {
            Some(reply) => {
                tracing::debug!(channel_name = %self.channel_name, "Received initial state");
                self.replace_state(reply.payload);
            }
            None => tracing::trace!(channel_name = %self.channel_name, "Ignoring unexpected state reply"),
        }
    }

    fn replace_state(&self, state: Value) {
        *self.state.lock() = state;
        self.observers.notify();

        let resolved = self.ready.send_if_modified(|ready| {
            let first = !*ready;
            *ready = true;
            first
        });
        if resolved {
            tracing::debug!(channel_name = %self.channel_name, "Proxy is ready");
        }
    }

    fn patch_state(&self, difference: &Diff) {
        {
            // The replica is only replaced once the patch has been applied.
            let mut state = self.state.lock();
            let patched = self.patch_strategy.patch(state.clone(), difference);
            *state = patched;
        }
        self.observers.notify();
    }
}

fn message_handler(shared: Weak<Shared>) -> Handler {
    Arc::new(move |message, _sender, _responder| {
        if let Some(shared) = shared.upgrade() {
            shared.on_message(message);
        }
        false
    })
}
