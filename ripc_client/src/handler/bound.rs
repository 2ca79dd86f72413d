use std::sync::Arc;

use ripc_protocol::Error;

use crate::{Connection, Invocation, OutgoingCall, Reference, SendOutcome};

/// Sends every call on one established connection.
pub struct ConnectionRequestHandler {
    reference: Reference,
    connection: Arc<dyn Connection>,
    compress: bool,
}

impl ConnectionRequestHandler {
    pub fn new(reference: Reference, connection: Arc<dyn Connection>, compress: bool) -> Self {
        ConnectionRequestHandler {
            reference,
            connection,
            compress,
        }
    }

    pub fn send(&self, call: &Arc<Invocation>) -> SendOutcome {
        call.invoke_remote(&self.connection, self.compress, self.reference.is_twoway())
    }

    pub fn request_canceled(&self, call: &Arc<Invocation>, reason: Error) {
        let call: Arc<dyn OutgoingCall> = call.clone();
        self.connection.request_canceled(&call, reason);
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn compress(&self) -> bool {
        self.compress
    }
}
