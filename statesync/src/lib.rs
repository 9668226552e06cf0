//! Statesync: replicating one state tree across message-passing contexts
//!
//! This crate keeps a single canonical state tree, owned by an authority,
//! mirrored in any number of proxies that can only reach the authority
//! through an asynchronous, best-effort message channel. Proxies read a
//! local replica, observe its changes and forward mutations to the
//! authority, which applies them and broadcasts the resulting diff.
//!
//! # Features
//!
//! - **Diff based replication**: only the difference between consecutive
//!   snapshots travels after the initial full state
//! - **Pluggable strategies**: shallow, deep and LCS based array diffs, or
//!   any custom diff/patch pair
//! - **Early listeners**: requests arriving before the store is attached
//!   are queued and replayed in order
//! - **Injected transport**: any [`transport::Transport`] implementation;
//!   an in-process hub is included
//!
//! # Architecture
//!
//! The system consists of:
//! - **Authority**: wraps the application store, answers state requests,
//!   applies dispatches and broadcasts patches
//! - **Proxy**: holds the replica, applies broadcasts and sends dispatches
//! - **Protocol**: `FETCH_STATE`, `STATE`, `PATCH_STATE` and `DISPATCH`
//!   envelopes scoped by channel name

pub mod authority;
pub mod config;
pub mod listener;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod serialization;
pub mod store;
pub mod strategies;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tracing_ext;

// Re-export commonly used types
pub use authority::{promise_responder, Authority, AuthorityConfig, DispatchResponder, StoreWrapper};
pub use config::ReplicationSettings;
pub use listener::DeferredListener;
pub use protocol::{Envelope, MessageType, AUTHORITY_ERR_PREFIX, DEFAULT_CHANNEL_NAME};
pub use proxy::{Proxy, ProxyConfig, WeakProxy};
pub use store::{Aliased, Dispatched, ReducerStore, Store};
pub use strategies::{Diff, DiffEntry, EditOp, Strategy, StrategyKind};
pub use transport::{Destination, Transport, TransportError};
pub use types::{Error, Result, Subscription};

