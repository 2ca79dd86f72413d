use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use ripc_protocol::{Error, ErrorKind, Result};

use super::{CancellationTarget, ConnectionRequestHandler};
use crate::{lock, Connection, Invocation, OutgoingCall, Reference, SendOutcome};

#[derive(Default)]
struct ConnectState {
    connection: Option<Arc<dyn Connection>>,
    compress: bool,
    exception: Option<Error>,
    initialized: bool,
    flushing: bool,
    requests: VecDeque<Arc<Invocation>>,
    bound: Option<Arc<ConnectionRequestHandler>>,
}

impl ConnectState {
    /// `Ok(true)` when calls can go straight to the connection, `Ok(false)`
    /// when they must be queued.
    fn ready(&self) -> Result<bool> {
        if self.initialized {
            return Ok(true);
        }
        if self.flushing {
            return Ok(false);
        }
        match &self.exception {
            // the connection died after it was established: let the call
            // find out from the connection and ask for a fresh handler
            Some(_) if self.connection.is_some() => Ok(true),
            Some(err) => Err(err.clone()),
            None => Ok(false),
        }
    }

    fn settled(&self) -> Option<Result<Arc<dyn Connection>>> {
        if self.flushing {
            return None;
        }
        if let Some(err) = &self.exception {
            return Some(Err(err.clone()));
        }
        if self.initialized {
            return self.connection.clone().map(Ok);
        }
        None
    }
}

/// Holds calls made while the connection of a reference is being resolved
/// and established, then sends them in order.
pub struct ConnectRequestHandler {
    me: Weak<ConnectRequestHandler>,
    reference: Reference,
    state: Mutex<ConnectState>,
    settled_tx: watch::Sender<bool>,
    settled_rx: watch::Receiver<bool>,
}

enum Cancel {
    Done,
    Dequeued(Arc<Invocation>),
    Forward(Arc<dyn Connection>),
}

impl ConnectRequestHandler {
    pub fn new(reference: Reference) -> Arc<Self> {
        let (settled_tx, settled_rx) = watch::channel(false);
        Arc::new_cyclic(|me| ConnectRequestHandler {
            me: me.clone(),
            reference,
            state: Mutex::new(ConnectState::default()),
            settled_tx,
            settled_rx,
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn send(&self, call: &Arc<Invocation>) -> SendOutcome {
        let (connection, compress) = {
            let mut state = lock(&self.state);
            if !state.initialized {
                if let Some(me) = self.me.upgrade() {
                    if let Err(err) = call.cancelable(CancellationTarget::Connecting(me)) {
                        return SendOutcome::Failed(err);
                    }
                }
            }
            match state.ready() {
                Ok(true) => {}
                Ok(false) => {
                    state.requests.push_back(call.clone());
                    return SendOutcome::Queued;
                }
                Err(err) => return SendOutcome::Failed(err),
            }
            match &state.connection {
                Some(connection) => (connection.clone(), state.compress),
                None => {
                    return SendOutcome::Failed(Error::new(
                        ErrorKind::ConnectionLost,
                        self.reference.to_string(),
                    ))
                }
            }
        };
        call.invoke_remote(&connection, compress, self.reference.is_twoway())
    }

    pub fn request_canceled(&self, call: &Arc<Invocation>, reason: Error) {
        let action = {
            let mut state = lock(&self.state);
            if state.exception.is_some() {
                Cancel::Done
            } else {
                let queued = if state.initialized {
                    None
                } else {
                    state
                        .requests
                        .iter()
                        .position(|c| Arc::ptr_eq(c, call))
                        .and_then(|pos| state.requests.remove(pos))
                };
                match (queued, &state.connection) {
                    (Some(call), _) => Cancel::Dequeued(call),
                    (None, Some(connection)) => Cancel::Forward(connection.clone()),
                    (None, None) => Cancel::Done,
                }
            }
        };
        match action {
            Cancel::Done => {}
            Cancel::Dequeued(call) => call.exception(reason),
            Cancel::Forward(connection) => {
                let call: Arc<dyn OutgoingCall> = call.clone();
                connection.request_canceled(&call, reason);
            }
        }
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        lock(&self.state).connection.clone()
    }

    /// The bound handler to use instead of this one, once every queued call
    /// was flushed without error.
    pub fn upgrade(&self) -> Option<Arc<ConnectionRequestHandler>> {
        lock(&self.state).bound.clone()
    }

    /// Waits until the connection is established and every queued call was
    /// flushed, or until establishing it failed.
    pub async fn wait_for_connection(&self) -> Result<Arc<dyn Connection>> {
        let mut settled = self.settled_rx.clone();
        loop {
            if let Some(result) = lock(&self.state).settled() {
                return result;
            }
            if settled.changed().await.is_err() {
                return Err(Error::new(
                    ErrorKind::CommunicatorDestroyed,
                    "connection establishment abandoned",
                ));
            }
        }
    }

    /// Called once the connection is established. Routed references are
    /// registered with the router before the queued calls are sent.
    pub async fn set_connection(&self, connection: Arc<dyn Connection>, compress: bool) {
        {
            let mut state = lock(&self.state);
            if state.exception.is_some() {
                return;
            }
            state.connection = Some(connection);
            state.compress = compress;
        }

        if let Some(router) = self.reference.router_info() {
            if let Err(err) = router.add_proxy(&self.reference).await {
                self.set_exception(err);
                return;
            }
        }
        self.flush_requests();
    }

    /// Called when the connection could not be established. Every queued
    /// call gets the error and decides by itself whether to retry.
    pub fn set_exception(&self, err: Error) {
        let requests = {
            let mut state = lock(&self.state);
            if state.initialized || state.exception.is_some() {
                return;
            }
            state.connection = None;
            state.exception = Some(err.clone());
            std::mem::take(&mut state.requests)
        };
        if self.reference.instance().trace().network >= 2 {
            tracing::debug!(
                "failed to establish connection for `{}': {}",
                self.reference,
                err
            );
        }
        for call in requests {
            call.exception(err.clone());
        }
        let _ = self.settled_tx.send(true);
    }

    fn flush_requests(&self) {
        let (connection, compress) = {
            let mut state = lock(&self.state);
            let connection = match &state.connection {
                Some(connection) => connection.clone(),
                None => return,
            };
            state.flushing = true;
            (connection, state.compress)
        };

        let response = self.reference.is_twoway();
        let mut exception: Option<Error> = None;
        let mut flushed = 0usize;
        loop {
            let call = {
                let mut state = lock(&self.state);
                match state.requests.pop_front() {
                    Some(call) => call,
                    None => {
                        if exception.is_none() && self.reference.cache_connection() {
                            state.bound = Some(Arc::new(ConnectionRequestHandler::new(
                                self.reference.clone(),
                                connection.clone(),
                                compress,
                            )));
                        }
                        state.initialized = exception.is_none();
                        state.exception = exception.take();
                        state.flushing = false;
                        break;
                    }
                }
            };
            flushed += 1;
            match call.invoke_remote(&connection, compress, response) {
                SendOutcome::Sent {
                    invoke_sent_callback: true,
                } => call.invoke_sent_async(),
                SendOutcome::Sent { .. } | SendOutcome::Queued => {}
                SendOutcome::RetryNeeded(err) => {
                    exception.get_or_insert(err);
                    call.retry_exception();
                }
                SendOutcome::Failed(err) => {
                    // a call canceled under our feet says nothing about the connection
                    if !err.is_cancellation() {
                        exception.get_or_insert_with(|| err.clone());
                    }
                    call.exception(err);
                }
            }
        }
        tracing::trace!("flushed {} queued requests for `{}'", flushed, self.reference);
        let _ = self.settled_tx.send(true);
    }
}
