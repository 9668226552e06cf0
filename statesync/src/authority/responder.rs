//! Turning dispatch outcomes into replies.

use crate::protocol::DispatchReply;
use crate::store::Dispatched;
use crate::transport::Responder;
use std::sync::Arc;

/// Receives the outcome of `Store::dispatch` together with the requester's
/// reply handle and is responsible for answering it.
pub type DispatchResponder = Arc<dyn Fn(anyhow::Result<Dispatched>, Responder) + Send + Sync>;

/// Default responder. Waits for the outcome on a spawned task and replies
/// `{ "error": null, "value": <result> }` or `{ "error": <message>, "value": null }`.
pub fn promise_responder() -> DispatchResponder {
    Arc::new(|outcome, responder| {
        tokio::spawn(respond(outcome, responder));
    })
}

async fn respond(outcome: anyhow::Result<Dispatched>, responder: Responder) {
    let settled = match outcome {
        Ok(dispatched) => dispatched.resolve().await,
        Err(error) => Err(error),
    };

    let reply = match settled {
        Ok(value) => DispatchReply::success(value),
        Err(error) => {
            tracing::error!("error dispatching result: {:#}", error);
            DispatchReply::failure(format!("{:#}", error))
        }
    };

    if !responder.send(reply.into_message()) {
        tracing::debug!("Dispatch requester is no longer waiting for a reply");
    }
}
