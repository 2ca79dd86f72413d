//! Request handlers: what a reference resolves to, and what actually sends a
//! call.

mod bound;
mod collocated;
mod connect;

pub use bound::ConnectionRequestHandler;
pub use collocated::CollocatedRequestHandler;
pub use connect::ConnectRequestHandler;

use std::fmt;
use std::sync::Arc;

use ripc_protocol::Error;

use crate::{Connection, Invocation, OutgoingCall, Reference, RetryQueue, SendOutcome};

#[derive(Clone)]
pub enum RequestHandler {
    /// Queues calls until the connection is established.
    Connecting(Arc<ConnectRequestHandler>),
    /// Sends straight on an established connection.
    Bound(Arc<ConnectionRequestHandler>),
    /// Dispatches to an object adapter of this process.
    Collocated(Arc<CollocatedRequestHandler>),
}

impl RequestHandler {
    pub fn send(&self, call: &Arc<Invocation>) -> SendOutcome {
        match self {
            RequestHandler::Connecting(h) => h.send(call),
            RequestHandler::Bound(h) => h.send(call),
            RequestHandler::Collocated(h) => h.send(call),
        }
    }

    pub fn request_canceled(&self, call: &Arc<Invocation>, reason: Error) {
        match self {
            RequestHandler::Connecting(h) => h.request_canceled(call, reason),
            RequestHandler::Bound(h) => h.request_canceled(call, reason),
            RequestHandler::Collocated(h) => h.request_canceled(call, reason),
        }
    }

    /// The connection requests are sent on, once known.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        match self {
            RequestHandler::Connecting(h) => h.connection(),
            RequestHandler::Bound(h) => Some(h.connection().clone()),
            RequestHandler::Collocated(_) => None,
        }
    }

    pub fn reference(&self) -> &Reference {
        match self {
            RequestHandler::Connecting(h) => h.reference(),
            RequestHandler::Bound(h) => h.reference(),
            RequestHandler::Collocated(h) => h.reference(),
        }
    }

    pub fn ptr_eq(&self, other: &RequestHandler) -> bool {
        match (self, other) {
            (RequestHandler::Connecting(a), RequestHandler::Connecting(b)) => Arc::ptr_eq(a, b),
            (RequestHandler::Bound(a), RequestHandler::Bound(b)) => Arc::ptr_eq(a, b),
            (RequestHandler::Collocated(a), RequestHandler::Collocated(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The bound handler a connecting handler turned into after flushing its
    /// queue without error.
    pub fn upgrade(&self) -> Option<RequestHandler> {
        match self {
            RequestHandler::Connecting(h) => h.upgrade().map(RequestHandler::Bound),
            _ => None,
        }
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self {
            RequestHandler::Connecting(_) => "Connecting",
            RequestHandler::Bound(_) => "Bound",
            RequestHandler::Collocated(_) => "Collocated",
        };
        write!(f, "{}({})", variant, self.reference())
    }
}

/// Whoever currently holds a call and must be told when it is canceled.
#[derive(Clone)]
pub(crate) enum CancellationTarget {
    Connecting(Arc<ConnectRequestHandler>),
    Connection(Arc<dyn Connection>),
    Collocated(Arc<CollocatedRequestHandler>),
    Retry(Arc<RetryQueue>),
}

impl CancellationTarget {
    pub(crate) fn request_canceled(&self, call: &Arc<Invocation>, reason: Error) {
        match self {
            CancellationTarget::Connecting(h) => h.request_canceled(call, reason),
            CancellationTarget::Connection(c) => {
                let call: Arc<dyn OutgoingCall> = call.clone();
                c.request_canceled(&call, reason)
            }
            CancellationTarget::Collocated(h) => h.request_canceled(call, reason),
            CancellationTarget::Retry(q) => q.request_canceled(call, reason),
        }
    }
}
