//! Message transport seam
//!
//! The authority and every proxy receive their transport by injection. A
//! transport is fire-and-forget: it makes no delivery or cross-channel ordering
//! promises. The in-process [`memory::Hub`] implementation is used by the
//! tests and the demo binary.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::oneshot;

pub mod memory;

/// Receives every message delivered to a context.
///
/// Returning `true` tells the transport the reply will be sent asynchronously
/// through the [`Responder`].
pub type Handler = Arc<dyn Fn(Value, MessageSender, Responder) -> bool + Send + Sync>;

/// Invoked at most once with the reply to a sent message.
pub type ReplyCallback = Box<dyn FnOnce(Result<Value, TransportError>) + Send>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,

    #[error("The message port closed before a response was received.")]
    NoResponse,

    #[error("Received a malformed reply: {reason}")]
    InvalidReply { reason: String },
}

/// An additional broadcast target beyond the runtime-wide channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Tab(u32),
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Tab(id) => write!(f, "tab {id}"),
        }
    }
}

/// Describes the context a message came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    pub id: Option<String>,
    pub tab: Option<u32>,
}

impl MessageSender {
    pub fn to_value(&self) -> Value {
        json!({ "id": self.id, "tab": self.tab })
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Sends `message` to every listener in the runtime, or only to the
    /// listeners living in `destination` when one is given.
    fn send(
        &self,
        message: Value,
        destination: Option<&Destination>,
        on_reply: Option<ReplyCallback>,
    );

    fn add_listener(&self, handler: Handler);

    /// Extra destinations a broadcast must reach individually.
    fn destinations(&self) -> Vec<Destination>;
}

/// Hands a reply, or the reason there is none, back to the requester.
/// Returns `false` if the requester is no longer waiting.
type Deliver = Box<dyn FnOnce(Result<Value, TransportError>) -> bool + Send>;

struct ReplySlot {
    deliver: Mutex<Option<Deliver>>,
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.get_mut().take() {
            deliver(Err(TransportError::NoResponse));
        }
    }
}

/// One-shot reply channel handed to listeners.
///
/// Clones share the same channel: the first [`Responder::send`] wins, and the
/// requester sees [`TransportError::NoResponse`] once every clone has been
/// dropped without replying.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<ReplySlot>,
}

impl Responder {
    /// Responder whose reply is handed to `deliver`, at most once. `deliver`
    /// receives [`TransportError::NoResponse`] when every clone is dropped
    /// without replying.
    pub fn new<F>(deliver: F) -> Self
    where
        F: FnOnce(Result<Value, TransportError>) -> bool + Send + 'static,
    {
        Self {
            slot: Arc::new(ReplySlot {
                deliver: Mutex::new(Some(Box::new(deliver))),
            }),
        }
    }

    /// Responder paired with a receiver. The receiver fails once every clone
    /// is dropped without replying.
    pub fn channel() -> (Self, oneshot::Receiver<Value>) {
        let (sender, receiver) = oneshot::channel();
        let responder = Self::new(move |reply| match reply {
            Ok(reply) => sender.send(reply).is_ok(),
            Err(_) => false,
        });
        (responder, receiver)
    }

    /// A responder nobody listens to.
    pub fn detached() -> Self {
        Self {
            slot: Arc::new(ReplySlot {
                deliver: Mutex::new(None),
            }),
        }
    }

    /// Returns `false` if a reply was already sent or the requester is gone.
    pub fn send(&self, reply: Value) -> bool {
        let deliver = self.slot.deliver.lock().take();
        match deliver {
            Some(deliver) => deliver(Ok(reply)),
            None => false,
        }
    }

    /// Whether a reply can still be sent.
    pub fn is_open(&self) -> bool {
        self.slot.deliver.lock().is_some()
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("open", &self.is_open())
            .finish()
    }
}
