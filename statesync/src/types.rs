//! Common types and error definitions for statesync

use crate::protocol::AUTHORITY_ERR_PREFIX;
use crate::transport::TransportError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Result type alias for statesync operations
pub type Result<T> = std::result::Result<T, Error>;

/// A state-change callback. Observers take no arguments and read the latest
/// snapshot themselves.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Error types for statesync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Deferred listener has already been set")]
    ListenerAlreadySet,

    #[error("{prefix}{message}", prefix = AUTHORITY_ERR_PREFIX)]
    Authority { message: String },

    #[error("{prefix}{0}", prefix = AUTHORITY_ERR_PREFIX)]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }
}

/// Handle returned by every `subscribe`/`observe` call.
///
/// Calling [`Subscription::unsubscribe`] removes exactly the callback it was
/// created for. Calling it again is a no-op. Dropping the handle does not
/// unsubscribe.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.lock().is_some()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

/// Ordered list of change callbacks shared by stores and proxies.
#[derive(Clone, Default)]
pub(crate) struct Observers {
    inner: Arc<Mutex<ObserverList>>,
}

impl Observers {
    pub(crate) fn add(&self, callback: Callback) -> Subscription {
        let id = {
            let mut list = self.inner.lock();
            let id = list.next_id;
            list.next_id += 1;
            list.entries.push((id, callback));
            id
        };

        let list = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(list) = list.upgrade() {
                list.lock().entries.retain(|(entry, _)| *entry != id);
            }
        })
    }

    /// Invokes every callback in registration order. The list is copied first
    /// so callbacks may subscribe or unsubscribe while being notified.
    pub(crate) fn notify(&self) {
        let callbacks: Vec<Callback> = self
            .inner
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in callbacks {
            callback();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_authority_error_carries_prefix() {
        let error = Error::Authority {
            message: "boom".to_string(),
        };

        let rendered = error.to_string();
        assert!(rendered.starts_with(AUTHORITY_ERR_PREFIX));
        assert!(rendered.ends_with("boom"));
    }

    #[test]
    fn test_observers_notified_in_order() {
        let observers = Observers::default();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            observers.add(Arc::new(move || calls.lock().push(name)));
        }
        observers.notify();

        assert_eq!(*calls.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_removes_only_its_callback_and_is_idempotent() {
        let observers = Observers::default();
        let count = Arc::new(AtomicUsize::new(0));

        let a = {
            let count = count.clone();
            observers.add(Arc::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let _b = {
            let count = count.clone();
            observers.add(Arc::new(move || {
                count.fetch_add(10, Ordering::SeqCst);
            }))
        };

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(observers.len(), 1);

        observers.notify();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
