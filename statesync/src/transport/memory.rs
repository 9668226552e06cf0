//! In-process transport connecting any number of contexts.
//!
//! Contexts are either runtime pages (the authority's own process, popups) or
//! live inside a tab. `send` without a destination reaches every runtime page
//! except the sender; `send` to [`Destination::Tab`] reaches the contexts of
//! that tab. Each endpoint drains its inbox on a single task, so messages are
//! handed to its listeners in arrival order. Replies to an endpoint's own
//! requests go through the same inbox: a reply is handled before any message
//! that was sent after it.

use super::{
    Destination, Handler, MessageSender, ReplyCallback, Responder, Transport, TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

enum Inbound {
    Message {
        message: Value,
        sender: MessageSender,
        responder: Responder,
    },
    Reply {
        reply: Result<Value, TransportError>,
        on_reply: ReplyCallback,
    },
}

type Inbox = mpsc::UnboundedSender<Inbound>;

struct Registration {
    id: Uuid,
    tab: Option<u32>,
    inbox: Inbox,
}

/// Shared message bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct Hub {
    registrations: Arc<Mutex<Vec<Registration>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runtime-page context. Must be called within a tokio runtime.
    pub fn endpoint(&self) -> Endpoint {
        self.register(None)
    }

    /// Creates a context living in tab `tab`. Must be called within a tokio
    /// runtime.
    pub fn tab_endpoint(&self, tab: u32) -> Endpoint {
        self.register(Some(tab))
    }

    pub fn endpoint_count(&self) -> usize {
        self.registrations.lock().len()
    }

    fn register(&self, tab: Option<u32>) -> Endpoint {
        let id = Uuid::new_v4();
        let (inbox, mut inbound) = mpsc::unbounded_channel::<Inbound>();
        let listeners: Arc<Mutex<Vec<Handler>>> = Arc::default();

        self.registrations.lock().push(Registration {
            id,
            tab,
            inbox: inbox.clone(),
        });

        let pump_listeners = listeners.clone();
        tokio::spawn(async move {
            while let Some(next) = inbound.recv().await {
                match next {
                    Inbound::Message {
                        message,
                        sender,
                        responder,
                    } => {
                        let handlers = pump_listeners.lock().clone();
                        let mut keeps_open = false;

                        for handler in handlers {
                            keeps_open |= handler(message.clone(), sender.clone(), responder.clone());
                        }

                        tracing::trace!(endpoint = %id, keeps_open, "Delivered message");
                    }
                    Inbound::Reply { reply, on_reply } => on_reply(reply),
                }
            }
        });

        tracing::debug!(endpoint = %id, ?tab, "Registered endpoint");

        Endpoint {
            id,
            tab,
            hub: self.clone(),
            inbox,
            listeners,
        }
    }

    fn targets(&self, from: Uuid, destination: Option<&Destination>) -> Vec<Inbox> {
        self.registrations
            .lock()
            .iter()
            .filter(|registration| match destination {
                None => registration.tab.is_none() && registration.id != from,
                Some(Destination::Tab(tab)) => registration.tab == Some(*tab),
            })
            .map(|registration| registration.inbox.clone())
            .collect()
    }

    fn unregister(&self, id: Uuid) {
        self.registrations
            .lock()
            .retain(|registration| registration.id != id);
    }
}

/// One context attached to a [`Hub`]. Dropping it detaches the context.
pub struct Endpoint {
    id: Uuid,
    tab: Option<u32>,
    hub: Hub,
    inbox: Inbox,
    listeners: Arc<Mutex<Vec<Handler>>>,
}

impl Endpoint {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tab(&self) -> Option<u32> {
        self.tab
    }
}

impl Transport for Endpoint {
    fn send(
        &self,
        message: Value,
        destination: Option<&Destination>,
        on_reply: Option<ReplyCallback>,
    ) {
        let targets = self.hub.targets(self.id, destination);

        if targets.is_empty() {
            tracing::trace!(endpoint = %self.id, ?destination, "No receiving end");
            if let Some(on_reply) = on_reply {
                deliver_reply(&self.inbox, Err(TransportError::NoReceiver), on_reply);
            }
            return;
        }

        let sender = MessageSender {
            id: Some(self.id.to_string()),
            tab: self.tab,
        };
        let responder = match on_reply {
            Some(on_reply) => {
                let inbox = self.inbox.clone();
                Responder::new(move |reply| deliver_reply(&inbox, reply, on_reply))
            }
            None => Responder::detached(),
        };

        for inbox in targets {
            let delivery = Inbound::Message {
                message: message.clone(),
                sender: sender.clone(),
                responder: responder.clone(),
            };
            if inbox.send(delivery).is_err() {
                tracing::trace!(endpoint = %self.id, "Receiving endpoint went away");
            }
        }
    }

    fn add_listener(&self, handler: Handler) {
        self.listeners.lock().push(handler);
    }

    fn destinations(&self) -> Vec<Destination> {
        let mut tabs: Vec<u32> = self
            .hub
            .registrations
            .lock()
            .iter()
            .filter_map(|registration| registration.tab)
            .collect();
        tabs.sort_unstable();
        tabs.dedup();
        tabs.into_iter().map(Destination::Tab).collect()
    }
}

/// Queues `reply` behind everything already in the requester's inbox.
fn deliver_reply(inbox: &Inbox, reply: Result<Value, TransportError>, on_reply: ReplyCallback) -> bool {
    let delivered = inbox.send(Inbound::Reply { reply, on_reply }).is_ok();
    if !delivered {
        tracing::trace!("Requesting endpoint went away before its reply");
    }
    delivered
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn recording_listener(endpoint: &Endpoint) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.add_listener(Arc::new(move |message, _, _| {
            let _ = tx.send(message);
            false
        }));
        rx
    }

    #[tokio::test]
    async fn test_runtime_send_skips_sender_and_tabs() {
        let hub = Hub::new();
        let background = hub.endpoint();
        let popup = hub.endpoint();
        let tab = hub.tab_endpoint(7);

        let mut own = recording_listener(&background);
        let mut popup_rx = recording_listener(&popup);
        let mut tab_rx = recording_listener(&tab);

        background.send(json!("hello"), None, None);
        background.send(json!("tab only"), Some(&Destination::Tab(7)), None);

        assert_eq!(popup_rx.recv().await.unwrap(), json!("hello"));
        assert_eq!(tab_rx.recv().await.unwrap(), json!("tab only"));

        tokio::task::yield_now().await;
        assert!(own.try_recv().is_err());
        assert!(popup_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let hub = Hub::new();
        let sender = hub.endpoint();
        let receiver = hub.endpoint();
        let mut rx = recording_listener(&receiver);

        for i in 0..20 {
            sender.send(json!(i), None, None);
        }
        for i in 0..20 {
            assert_eq!(rx.recv().await.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_reply_reaches_sender() {
        let hub = Hub::new();
        let asker = hub.endpoint();
        let answerer = hub.endpoint();
        answerer.add_listener(Arc::new(|message, _, responder: Responder| {
            responder.send(json!({ "echo": message }));
            false
        }));

        let (tx, rx) = oneshot::channel();
        asker.send(
            json!(5),
            None,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        );

        assert_eq!(rx.await.unwrap(), Ok(json!({ "echo": 5 })));
    }

    #[tokio::test]
    async fn test_reply_is_handled_before_later_messages() {
        let hub = Hub::new();
        let asker = hub.endpoint();
        let answerer = hub.endpoint();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let held = Arc::new(Mutex::new(None));
        let slot = held.clone();
        answerer.add_listener(Arc::new(move |_, _, responder: Responder| {
            *slot.lock() = Some(responder);
            true
        }));
        let broadcasts = tx.clone();
        asker.add_listener(Arc::new(move |message, _, _| {
            let _ = broadcasts.send(message);
            false
        }));

        asker.send(
            json!("request"),
            None,
            Some(Box::new(move |reply: Result<Value, TransportError>| {
                let _ = tx.send(json!({ "reply": reply.ok() }));
            })),
        );
        let responder = loop {
            if let Some(responder) = held.lock().take() {
                break responder;
            }
            tokio::task::yield_now().await;
        };

        answerer.send(json!("before"), None, None);
        assert!(responder.send(json!("answer")));
        answerer.send(json!("after"), None, None);

        assert_eq!(rx.recv().await.unwrap(), json!("before"));
        assert_eq!(rx.recv().await.unwrap(), json!({ "reply": "answer" }));
        assert_eq!(rx.recv().await.unwrap(), json!("after"));
    }

    #[tokio::test]
    async fn test_no_receiver_and_no_response() {
        let hub = Hub::new();
        let lonely = hub.endpoint();

        let (tx, rx) = oneshot::channel();
        lonely.send(
            json!(1),
            None,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        );
        assert_eq!(rx.await.unwrap(), Err(TransportError::NoReceiver));

        let silent = hub.endpoint();
        silent.add_listener(Arc::new(|_, _, _| false));

        let (tx, rx) = oneshot::channel();
        lonely.send(
            json!(2),
            None,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        );
        assert_eq!(rx.await.unwrap(), Err(TransportError::NoResponse));
    }

    #[tokio::test]
    async fn test_dropped_endpoint_is_unregistered() {
        let hub = Hub::new();
        let first = hub.tab_endpoint(1);
        let second = hub.tab_endpoint(2);
        assert_eq!(first.destinations(), vec![Destination::Tab(1), Destination::Tab(2)]);

        drop(second);
        assert_eq!(hub.endpoint_count(), 1);
        assert_eq!(first.destinations(), vec![Destination::Tab(1)]);
    }
}
