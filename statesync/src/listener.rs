//! Listener that can be registered before its real handler exists.
//!
//! The transport-facing half is registered synchronously while the process is
//! starting up; every invocation is queued and later replayed, in arrival
//! order, to the handler installed with [`DeferredListener::set_listener`].

use crate::transport::{Handler, MessageSender, Responder};
use crate::types::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Invocation {
    message: Value,
    sender: MessageSender,
    responder: Responder,
}

pub struct DeferredListener {
    queue: mpsc::UnboundedSender<Invocation>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Invocation>>>,
}

impl DeferredListener {
    pub fn new() -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            queue,
            pending: Mutex::new(Some(pending)),
        }
    }

    /// The handler to register with the transport. It always reports an
    /// asynchronous reply so the requester's reply channel stays open while
    /// the invocation waits in the queue.
    pub fn listener(&self) -> Handler {
        let queue = self.queue.clone();
        Arc::new(move |message, sender, responder| {
            let invocation = Invocation {
                message,
                sender,
                responder,
            };
            if queue.send(invocation).is_err() {
                tracing::warn!("Deferred listener is gone, dropping message");
            }
            true
        })
    }

    /// Installs the real handler and starts replaying queued invocations on a
    /// task of the current tokio runtime. Can only succeed once.
    pub fn set_listener(&self, handler: Handler) -> Result<()> {
        let mut pending = self.pending.lock().take().ok_or(Error::ListenerAlreadySet)?;

        tokio::spawn(async move {
            while let Some(invocation) = pending.recv().await {
                handler(invocation.message, invocation.sender, invocation.responder);
            }
        });

        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.pending.lock().is_none()
    }
}

impl Default for DeferredListener {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn call(handler: &Handler, message: Value) -> bool {
        handler(message, MessageSender::default(), Responder::detached())
    }

    #[tokio::test]
    async fn test_invocations_before_and_after_set_are_delivered_in_order() {
        let deferred = DeferredListener::new();
        let listener = deferred.listener();

        assert!(call(&listener, json!(1)));
        assert!(call(&listener, json!(2)));

        let (tx, mut rx) = mpsc::unbounded_channel();
        deferred
            .set_listener(Arc::new(move |message, _, _| {
                let _ = tx.send(message);
                false
            }))
            .unwrap();

        assert!(call(&listener, json!(3)));
        assert!(call(&listener, json!(4)));

        let mut received = Vec::new();
        for _ in 0..4 {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(message);
        }

        assert_eq!(received, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_setting_twice_is_rejected() {
        let deferred = DeferredListener::new();
        assert!(!deferred.is_set());

        deferred.set_listener(Arc::new(|_, _, _| false)).unwrap();
        assert!(deferred.is_set());

        let error = deferred.set_listener(Arc::new(|_, _, _| false)).unwrap_err();
        assert!(matches!(error, Error::ListenerAlreadySet));
    }

    #[tokio::test]
    async fn test_queued_responder_stays_usable() {
        let deferred = DeferredListener::new();
        let listener = deferred.listener();

        let (responder, receiver) = Responder::channel();
        listener(json!("ping"), MessageSender::default(), responder);

        deferred
            .set_listener(Arc::new(|message, _, responder: Responder| {
                responder.send(json!({ "pong": message }));
                true
            }))
            .unwrap();

        assert_eq!(receiver.await.unwrap(), json!({ "pong": "ping" }));
    }
}
