use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use ripc_protocol::{Error, ErrorKind, Result};

use crate::handler::CancellationTarget;
use crate::{lock, Invocation};

#[derive(Default)]
struct RetryState {
    destroyed: bool,
    pending: HashMap<u64, (Arc<Invocation>, JoinHandle<()>)>,
}

/// Runs the retries that must wait, each on its own timer task.
pub struct RetryQueue {
    handle: Handle,
    trace: u8,
    state: Mutex<RetryState>,
}

impl RetryQueue {
    pub fn new(handle: Handle, trace: u8) -> Self {
        RetryQueue {
            handle,
            trace,
            state: Mutex::new(RetryState::default()),
        }
    }

    /// Retries `call` after `delay`. The call stays cancelable while it
    /// waits.
    pub fn add(self: &Arc<Self>, call: &Arc<Invocation>, delay: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(Error::new(
                ErrorKind::CommunicatorDestroyed,
                "the retry queue is destroyed",
            ));
        }
        call.cancelable(CancellationTarget::Retry(self.clone()))?;

        let queue = self.clone();
        let id = call.id();
        let task = self.handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let call = lock(&queue.state).pending.remove(&id).map(|(call, _)| call);
            if let Some(call) = call {
                call.retry();
            }
        });
        state.pending.insert(id, (call.clone(), task));
        Ok(())
    }

    pub(crate) fn request_canceled(&self, call: &Arc<Invocation>, reason: Error) {
        let removed = lock(&self.state).pending.remove(&call.id());
        if let Some((call, task)) = removed {
            task.abort();
            if self.trace >= 1 {
                tracing::info!("operation retry canceled\n{}", reason);
            }
            call.fail(reason);
        }
    }

    /// Fails every waiting call with `CommunicatorDestroyed`. Later
    /// additions are refused.
    pub fn destroy(&self) {
        let pending: Vec<_> = {
            let mut state = lock(&self.state);
            state.destroyed = true;
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        for (call, task) in pending {
            task.abort();
            call.fail(Error::new(
                ErrorKind::CommunicatorDestroyed,
                "the client instance is destroyed",
            ));
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
