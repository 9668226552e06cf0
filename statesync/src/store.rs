//! Application stores the authority can replicate.

use crate::types::{Callback, Observers, Subscription};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Change notification callback.
pub type StoreListener = Callback;

/// Reducer turning `(state, action)` into the next state.
pub type Reducer = Arc<dyn Fn(&Value, &Value) -> anyhow::Result<Value> + Send + Sync>;

/// Rewrites an action before it reaches the wrapped store.
pub type Alias = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Outcome of a dispatch that did not fail synchronously.
pub enum Dispatched {
    Ready(Value),
    Pending(BoxFuture<'static, anyhow::Result<Value>>),
}

impl Dispatched {
    pub fn pending<F>(future: F) -> Self
    where
        F: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Dispatched::Pending(Box::pin(future))
    }

    /// Waits for the outcome.
    pub async fn resolve(self) -> anyhow::Result<Value> {
        match self {
            Dispatched::Ready(value) => Ok(value),
            Dispatched::Pending(future) => future.await,
        }
    }
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatched::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Dispatched::Pending(_) => f.write_str("Pending"),
        }
    }
}

pub trait Store: Send + Sync + 'static {
    /// Current snapshot.
    fn state(&self) -> Value;

    /// Applies `action`. An `Err` is a synchronous failure; asynchronous
    /// failures surface through [`Dispatched::Pending`].
    fn dispatch(&self, action: Value) -> anyhow::Result<Dispatched>;

    /// Registers a callback invoked after every state change.
    fn subscribe(&self, listener: StoreListener) -> Subscription;
}

/// Store driven by a single reducer function.
pub struct ReducerStore {
    state: Mutex<Value>,
    reducer: Reducer,
    observers: Observers,
}

impl ReducerStore {
    pub fn new<F>(initial: Value, reducer: F) -> Self
    where
        F: Fn(&Value, &Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(initial),
            reducer: Arc::new(reducer),
            observers: Observers::default(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }
}

impl Store for ReducerStore {
    fn state(&self) -> Value {
        self.state.lock().clone()
    }

    /// Reduces under the state lock, then notifies subscribers once the lock
    /// is released. Resolves with the action itself.
    fn dispatch(&self, action: Value) -> anyhow::Result<Dispatched> {
        {
            let mut state = self.state.lock();
            let next = (self.reducer)(&state, &action)?;
            *state = next;
        }

        self.observers.notify();

        Ok(Dispatched::Ready(action))
    }

    fn subscribe(&self, listener: StoreListener) -> Subscription {
        self.observers.add(listener)
    }
}

/// Wraps a store and rewrites actions whose `type` has a registered alias.
pub struct Aliased<S> {
    inner: S,
    aliases: HashMap<String, Alias>,
}

impl<S: Store> Aliased<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            aliases: HashMap::new(),
        }
    }

    pub fn alias<F>(mut self, action_type: impl Into<String>, alias: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.aliases.insert(action_type.into(), Arc::new(alias));
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Store> Store for Aliased<S> {
    fn state(&self) -> Value {
        self.inner.state()
    }

    fn dispatch(&self, action: Value) -> anyhow::Result<Dispatched> {
        let alias = action
            .get("type")
            .and_then(Value::as_str)
            .and_then(|action_type| self.aliases.get(action_type))
            .cloned();

        let action = match alias {
            Some(alias) => {
                tracing::trace!(action_type = ?action.get("type"), "Rewriting aliased action");
                alias(action)
            }
            None => action,
        };

        self.inner.dispatch(action)
    }

    fn subscribe(&self, listener: StoreListener) -> Subscription {
        self.inner.subscribe(listener)
    }
}
