//! Contracts between the invocation engine and the transport layer.
//!
//! The engine never performs I/O itself: it hands an [`OutgoingCall`] to a
//! [`Connection`] obtained from a [`ConnectionEstablisher`], and the
//! connection reports back through the call's `sent`, `response` and
//! `exception` notifications.

use std::sync::Arc;

use async_trait::async_trait;

use ripc_adapter::ObjectAdapter;
use ripc_protocol::{Endpoint, Error, Reply, Request, Result};

/// What happened when a call was handed to a request handler or connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The request was written out. `invoke_sent_callback` is set when the
    /// call asked to be told about it and has not been told yet.
    Sent { invoke_sent_callback: bool },
    /// The request is waiting in a queue and will be sent, failed or
    /// canceled later.
    Queued,
    /// The handler or connection died after it was established: resolve a
    /// fresh handler and try again without counting a retry.
    RetryNeeded(Error),
    /// Local failure, subject to the retry rules.
    Failed(Error),
}

/// A call as seen by a connection.
pub trait OutgoingCall: Send + Sync {
    fn id(&self) -> u64;

    /// The requests to write; more than one for a batch flush.
    fn requests(&self) -> &[Request];

    /// Marks the call as written. Returns whether the sent callback must be
    /// invoked, which the connection does with [`OutgoingCall::invoke_sent_async`]
    /// when the write completed off the calling task.
    fn sent(&self) -> bool;

    fn invoke_sent_async(&self);

    fn response(&self, reply: Reply);

    /// Reports a failure. The call decides by itself whether to retry.
    fn exception(&self, err: Error);
}

pub trait Connection: Send + Sync {
    fn send_request(&self, call: Arc<dyn OutgoingCall>, compress: bool, response: bool)
        -> SendOutcome;

    /// Stops tracking `call`; if the connection still knew about it, the
    /// call is completed with `reason`.
    fn request_canceled(&self, call: &Arc<dyn OutgoingCall>, reason: Error);

    fn close(&self);

    fn endpoint(&self) -> Endpoint;

    fn is_active(&self) -> bool;

    /// Associates an adapter for requests flowing back on this connection.
    fn set_adapter(&self, _adapter: Option<Arc<ObjectAdapter>>) {}
}

/// Creates (or reuses) outgoing connections.
#[async_trait]
pub trait ConnectionEstablisher: Send + Sync {
    /// Connects to one of `endpoints`, already filtered and ordered.
    /// `has_more` tells whether the caller will try other endpoints if this
    /// attempt fails.
    async fn connect(&self, endpoints: &[Endpoint], has_more: bool) -> Result<Arc<dyn Connection>>;
}

/// Compares connections by identity.
pub fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
