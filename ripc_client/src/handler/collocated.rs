use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use ripc_adapter::ObjectAdapter;
use ripc_protocol::{Error, ErrorKind, Reply, Result};

use super::CancellationTarget;
use crate::{lock, Invocation, OutgoingCall, Reference, SendOutcome};

/// Dispatches calls to an object adapter of this process, on a task of the
/// client runtime.
pub struct CollocatedRequestHandler {
    me: Weak<CollocatedRequestHandler>,
    reference: Reference,
    adapter: Arc<ObjectAdapter>,
    pending: Mutex<HashMap<u64, Arc<Invocation>>>,
}

impl CollocatedRequestHandler {
    pub fn new(reference: Reference, adapter: Arc<ObjectAdapter>) -> Arc<Self> {
        Arc::new_cyclic(|me| CollocatedRequestHandler {
            me: me.clone(),
            reference,
            adapter,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn adapter(&self) -> &Arc<ObjectAdapter> {
        &self.adapter
    }

    pub fn send(&self, call: &Arc<Invocation>) -> SendOutcome {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return SendOutcome::Failed(ErrorKind::ObjectAdapterDeactivated.into()),
        };
        if let Err(err) = call.cancelable(CancellationTarget::Collocated(me.clone())) {
            return SendOutcome::Failed(err);
        }
        lock(&self.pending).insert(call.id(), call.clone());

        let call = call.clone();
        self.reference
            .instance()
            .handle()
            .spawn(async move { me.dispatch(call) });
        SendOutcome::Queued
    }

    fn dispatch(&self, call: Arc<Invocation>) {
        if !lock(&self.pending).contains_key(&call.id()) {
            return;
        }
        if call.sent() {
            call.invoke_sent_async();
        }
        let twoway = self.reference.is_twoway();
        if !twoway {
            lock(&self.pending).remove(&call.id());
        }

        let mut result: Result<Reply> = Ok(Reply::ok(Bytes::new()));
        for request in call.requests() {
            result = self.adapter.dispatch(request);
            if let Err(err) = &result {
                if !twoway {
                    tracing::debug!(
                        "collocated dispatch of `{}' failed: {}",
                        request.operation,
                        err
                    );
                }
                break;
            }
        }

        if twoway && lock(&self.pending).remove(&call.id()).is_some() {
            match result {
                Ok(reply) => call.response(reply),
                Err(err) => call.exception(err),
            }
        }
    }

    pub fn request_canceled(&self, call: &Arc<Invocation>, reason: Error) {
        if lock(&self.pending).remove(&call.id()).is_some() {
            call.exception(reason);
        }
    }
}
