//! The state machine of one call: send it, wait for the reply, retry what
//! may be retried, and honor cancellation and the invocation timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use strum_macros::Display;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use ripc_protocol::{Error, ErrorKind, OperationMode, Reply, Request, Result};

use crate::handler::CancellationTarget;
use crate::retry_policy::{check_retry, RetryDecision, RetryFacts};
use crate::{
    lock, Connection, Instance, OutgoingCall, Reference, RequestHandler, RequestHandlerCache,
    SendOutcome,
};

/// Told once that the request was written; the argument says whether that
/// happened before the invoking call returned.
pub type SentCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Copy, Clone, Display, PartialEq, Eq)]
pub enum Phase {
    Created,
    Attempting,
    SentAwaitingReply,
    Completed,
    Canceled,
    TimedOut,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Canceled | Phase::TimedOut)
    }
}

struct CallState {
    phase: Phase,
    cnt: usize,
    handler: Option<RequestHandler>,
    connection: Option<Arc<dyn Connection>>,
    /// Written during the current attempt.
    sent: bool,
    /// Written during any attempt.
    sent_reported: bool,
    sent_synchronously: bool,
    target: Option<CancellationTarget>,
    cancellation: Option<Error>,
    timer: Option<JoinHandle<()>>,
    completion: Option<oneshot::Sender<Result<Reply>>>,
}

pub struct Invocation {
    me: Weak<Invocation>,
    id: u64,
    reference: Reference,
    cache: Arc<RequestHandlerCache>,
    requests: Vec<Request>,
    mode: OperationMode,
    response_expected: bool,
    sent_callback: Option<SentCallback>,
    state: Mutex<CallState>,
}

impl Invocation {
    /// Creates the call and makes the first attempt on the calling task.
    pub(crate) fn start(
        cache: Arc<RequestHandlerCache>,
        requests: Vec<Request>,
        mode: OperationMode,
        response_expected: bool,
        sent_callback: Option<SentCallback>,
    ) -> InvocationFuture {
        let (tx, rx) = oneshot::channel();
        let reference = cache.reference().clone();
        let id = reference.instance().next_call_id();
        let call = Arc::new_cyclic(|me| Invocation {
            me: me.clone(),
            id,
            reference,
            cache,
            requests,
            mode,
            response_expected,
            sent_callback,
            state: Mutex::new(CallState {
                phase: Phase::Created,
                cnt: 0,
                handler: None,
                connection: None,
                sent: false,
                sent_reported: false,
                sent_synchronously: false,
                target: None,
                cancellation: None,
                timer: None,
                completion: Some(tx),
            }),
        });
        call.invoke_impl(true);
        InvocationFuture {
            call: Some(call),
            rx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    /// Whether the request was written out, in any attempt.
    pub fn is_sent(&self) -> bool {
        lock(&self.state).sent_reported
    }

    pub fn sent_synchronously(&self) -> bool {
        lock(&self.state).sent_synchronously
    }

    /// Retries made so far.
    pub fn retry_count(&self) -> usize {
        lock(&self.state).cnt
    }

    /// The connection of the current attempt, if it got that far.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        lock(&self.state).connection.clone()
    }

    /// Cancels the call; it completes with `InvocationCanceled` unless it
    /// already completed.
    pub fn cancel(&self) {
        self.cancel_with(Error::new(ErrorKind::InvocationCanceled, "invocation canceled"));
    }

    fn instance(&self) -> &Arc<Instance> {
        self.reference.instance()
    }

    fn invoke_impl(self: &Arc<Self>, user_thread: bool) {
        if user_thread {
            let timeout = self.reference.invocation_timeout();
            if timeout > 0 {
                self.arm_timer(Duration::from_millis(timeout as u64));
            }
        }

        loop {
            {
                let mut state = lock(&self.state);
                if state.phase.is_terminal() {
                    return;
                }
                state.phase = Phase::Attempting;
                state.sent = false;
            }

            let outcome = match self.cache.get_handler() {
                Ok(handler) => {
                    lock(&self.state).handler = Some(handler.clone());
                    handler.send(self)
                }
                Err(err) => SendOutcome::Failed(err),
            };

            match outcome {
                SendOutcome::Sent {
                    invoke_sent_callback,
                } => {
                    if user_thread {
                        lock(&self.state).sent_synchronously = true;
                        if invoke_sent_callback {
                            if let Some(cb) = &self.sent_callback {
                                cb(true);
                            }
                        }
                    } else if invoke_sent_callback {
                        self.invoke_sent_async();
                    }
                    return;
                }
                SendOutcome::Queued => return,
                SendOutcome::RetryNeeded(err) => {
                    if self.instance().trace().retry >= 2 {
                        tracing::debug!("retrying operation call with a new connection\n{}", err);
                    }
                    self.clear_handler();
                }
                SendOutcome::Failed(err) => match self.handle_exception(err) {
                    Ok(delay) if delay.is_zero() && !user_thread => {}
                    Ok(delay) => {
                        if let Err(err) = self.instance().retry_queue().add(self, delay) {
                            self.finish(Err(err));
                        }
                        return;
                    }
                    Err(err) => {
                        self.finish(Err(err));
                        return;
                    }
                },
            }
        }
    }

    /// Entry point of the retry queue once the delay elapsed.
    pub(crate) fn retry(self: &Arc<Self>) {
        self.invoke_impl(false);
    }

    fn clear_handler(&self) {
        let handler = lock(&self.state).handler.take();
        if let Some(handler) = handler {
            self.cache.clear_if_matches(&handler);
        }
    }

    /// Decides whether the call is retried after `err`: the delay to wait,
    /// or the error to complete with.
    fn handle_exception(&self, err: Error) -> Result<Duration> {
        self.clear_handler();

        let (sent, cnt) = {
            let state = lock(&self.state);
            (state.sent, state.cnt)
        };
        let reference = &self.reference;
        let facts = RetryFacts {
            batch: reference.is_batch(),
            fixed: reference.is_fixed(),
            indirect: reference.is_indirect(),
            routed: reference.router_info().is_some(),
            sent,
            idempotent: self.mode.is_idempotent(),
        };
        let instance = self.instance();
        let trace = instance.trace().retry;

        match check_retry(&err, &facts, cnt, instance.retry_delays()) {
            RetryDecision::Fail => Err(err),
            RetryDecision::Exhausted => {
                if trace >= 1 {
                    tracing::info!(
                        "cannot retry operation call because retry limit has been exceeded\n{}",
                        err
                    );
                }
                Err(err)
            }
            RetryDecision::Retry {
                delay,
                count,
                clear_router,
                clear_locator,
            } => {
                if clear_router {
                    if let Some(router) = reference.router_info() {
                        router.clear_cache(reference);
                        if trace >= 1 {
                            tracing::info!("retrying operation call to add proxy to router\n{}", err);
                        }
                    }
                }
                if clear_locator {
                    if let Some(locator) = reference.locator_info() {
                        locator.clear_cache(reference);
                    }
                }
                lock(&self.state).cnt = count;
                if trace >= 1 && !clear_router {
                    if delay.is_zero() {
                        tracing::info!("retrying operation call because of exception\n{}", err);
                    } else {
                        tracing::info!(
                            "retrying operation call in {}ms because of exception\n{}",
                            delay.as_millis(),
                            err
                        );
                    }
                }
                Ok(delay)
            }
        }
    }

    /// Registers whoever holds the call now, unless the call was canceled
    /// meanwhile, in which case the cancellation reason is returned.
    pub(crate) fn cancelable(&self, target: CancellationTarget) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.cancellation.take() {
            return Err(reason);
        }
        state.target = Some(target);
        Ok(())
    }

    fn cancel_with(&self, reason: Error) {
        let target = {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            if state.cancellation.is_none() {
                state.cancellation = Some(reason.clone());
            }
            state.target.clone()
        };
        if let (Some(target), Some(me)) = (target, self.me.upgrade()) {
            target.request_canceled(&me, reason);
        }
    }

    fn arm_timer(self: &Arc<Self>, timeout: Duration) {
        let call = Arc::downgrade(self);
        let timer = self.instance().handle().spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(call) = call.upgrade() {
                call.timed_out();
            }
        });
        lock(&self.state).timer = Some(timer);
    }

    fn timed_out(&self) {
        lock(&self.state).timer.take();
        self.cancel_with(Error::new(ErrorKind::InvocationTimeout, "invocation timed out"));
    }

    /// Sends the call on `connection`.
    pub(crate) fn invoke_remote(
        self: &Arc<Self>,
        connection: &Arc<dyn Connection>,
        compress: bool,
        response: bool,
    ) -> SendOutcome {
        if let Err(err) = self.cancelable(CancellationTarget::Connection(connection.clone())) {
            return SendOutcome::Failed(err);
        }
        lock(&self.state).connection = Some(connection.clone());
        connection.send_request(self.clone(), compress, response)
    }

    /// The handler this call was queued on died after connecting: resolve a
    /// new one from the retry queue, without counting a retry.
    pub(crate) fn retry_exception(&self) {
        self.clear_handler();
        if let Some(me) = self.me.upgrade() {
            if let Err(err) = self.instance().retry_queue().add(&me, Duration::from_millis(0)) {
                self.finish(Err(err));
            }
        }
    }

    /// Completes the call with `err`, skipping the retry rules.
    pub(crate) fn fail(&self, err: Error) {
        self.finish(Err(err));
    }

    fn finish(&self, result: Result<Reply>) {
        let (completion, timer) = {
            let mut state = lock(&self.state);
            let completion = match state.completion.take() {
                Some(completion) => completion,
                None => return,
            };
            state.phase = match &result {
                Err(err) if err.kind() == ErrorKind::InvocationTimeout => Phase::TimedOut,
                Err(err) if err.kind() == ErrorKind::InvocationCanceled => Phase::Canceled,
                _ => Phase::Completed,
            };
            state.target = None;
            state.connection = None;
            state.handler = None;
            (completion, state.timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.instance().executor().execute(Box::new(move || {
            let _ = completion.send(result);
        }));
    }
}

impl OutgoingCall for Invocation {
    fn id(&self) -> u64 {
        self.id
    }

    fn requests(&self) -> &[Request] {
        &self.requests
    }

    fn sent(&self) -> bool {
        let first = {
            let mut state = lock(&self.state);
            state.sent = true;
            let first = !state.sent_reported;
            state.sent_reported = true;
            if state.phase == Phase::Attempting {
                state.phase = Phase::SentAwaitingReply;
            }
            first
        };
        if !self.response_expected {
            self.finish(Ok(Reply::ok(Bytes::new())));
        }
        first && self.sent_callback.is_some()
    }

    fn invoke_sent_async(&self) {
        if let Some(cb) = self.sent_callback.clone() {
            self.instance().executor().execute(Box::new(move || cb(false)));
        }
    }

    fn response(&self, reply: Reply) {
        {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            state.sent = true;
        }
        let result = match self.requests.first() {
            Some(request) => reply.into_result(request),
            None => Ok(reply),
        };
        match result {
            Ok(reply) => self.finish(Ok(reply)),
            Err(err) => self.exception(err),
        }
    }

    fn exception(&self, err: Error) {
        {
            let mut state = lock(&self.state);
            if state.phase.is_terminal() {
                return;
            }
            state.connection = None;
            state.target = None;
        }
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        match self.handle_exception(err) {
            Ok(delay) => {
                if let Err(err) = self.instance().retry_queue().add(&me, delay) {
                    self.finish(Err(err));
                }
            }
            Err(err) => self.finish(Err(err)),
        }
    }
}

/// Resolves to the reply of an invocation.
pub struct InvocationFuture {
    call: Option<Arc<Invocation>>,
    rx: oneshot::Receiver<Result<Reply>>,
}

impl InvocationFuture {
    /// A future that is already complete, for calls that never needed an
    /// invocation (batched requests, empty flushes).
    pub(crate) fn completed(result: Result<Reply>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        InvocationFuture { call: None, rx }
    }

    pub fn invocation(&self) -> Option<&Arc<Invocation>> {
        self.call.as_ref()
    }

    pub fn cancel(&self) {
        if let Some(call) = &self.call {
            call.cancel();
        }
    }

    pub fn is_sent(&self) -> bool {
        self.call.as_ref().map_or(true, |call| call.is_sent())
    }

    pub fn sent_synchronously(&self) -> bool {
        self.call.as_ref().map_or(true, |call| call.sent_synchronously())
    }
}

impl Future for InvocationFuture {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::new(
                ErrorKind::CommunicatorDestroyed,
                "invocation abandoned",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
