//! Whether a failed invocation may be attempted again, and after how long.

use std::time::Duration;

use ripc_protocol::{Error, ErrorCategory, ErrorKind};

/// What the policy needs to know about the failed invocation.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RetryFacts {
    pub batch: bool,
    pub fixed: bool,
    /// Addressed by adapter id or well-known identity, resolved through a
    /// locator.
    pub indirect: bool,
    pub routed: bool,
    /// The request reached the transport during the failed attempt.
    pub sent: bool,
    pub idempotent: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Surface the error.
    Fail,
    /// Surface the error: the retry budget is spent.
    Exhausted,
    Retry {
        delay: Duration,
        /// Retry counter to use from now on.
        count: usize,
        /// Forget the router registration of the target first.
        clear_router: bool,
        /// Forget the locator cache row of the target first.
        clear_locator: bool,
    },
}

/// Decides what to do after `err`, given the `count` retries already made
/// and the configured `intervals`.
///
/// A request that may have been processed is only retried when doing it
/// twice is harmless: the operation is idempotent, the peer closed the
/// connection gracefully, or the object was not found.
pub fn check_retry(err: &Error, facts: &RetryFacts, count: usize, intervals: &[Duration]) -> RetryDecision {
    let object_not_exist = err.kind() == ErrorKind::ObjectNotExist;
    if facts.sent && !facts.idempotent && !err.is_graceful_close() && !object_not_exist {
        return RetryDecision::Fail;
    }

    // batched requests may have been aborted along with the whole batch, and
    // a fixed reference would fail the same way on the same connection
    if facts.batch || facts.fixed {
        return RetryDecision::Fail;
    }

    let clear_locator = object_not_exist;
    if object_not_exist {
        if facts.routed && err.operation() == Some("ice_add_proxy") {
            return RetryDecision::Retry {
                delay: Duration::from_millis(0),
                count,
                clear_router: true,
                clear_locator: false,
            };
        }
        // the locator may know a newer location
        if !facts.indirect {
            return RetryDecision::Fail;
        }
    } else if err.is_request_failed() {
        return RetryDecision::Fail;
    }

    match err.category() {
        ErrorCategory::Protocol
        | ErrorCategory::Policy
        | ErrorCategory::Lifecycle
        | ErrorCategory::Cancellation => return RetryDecision::Fail,
        _ => {}
    }
    if err.kind() == ErrorKind::ConnectionManuallyClosed {
        return RetryDecision::Fail;
    }

    let count = count + 1;
    let delay = if count == intervals.len() + 1 && err.is_graceful_close() {
        Duration::from_millis(0)
    } else if count > intervals.len() {
        return RetryDecision::Exhausted;
    } else {
        intervals[count - 1]
    };
    RetryDecision::Retry {
        delay,
        count,
        clear_router: false,
        clear_locator,
    }
}
