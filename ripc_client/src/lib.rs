//! Client-side invocation engine: turns a call on a proxy into a request sent
//! on some connection, resolving indirect and routed addresses, reusing
//! connections and retrying failures without breaking at-most-once delivery.

pub mod batch;
pub mod config;
pub mod connection;
pub mod handler;
pub mod handler_cache;
pub mod instance;
pub mod invocation;
pub mod locator;
pub mod proxy;
pub mod reference;
pub mod retry_policy;
pub mod retry_queue;
pub mod router;
pub mod selector;

pub use batch::*;
pub use config::*;
pub use connection::*;
pub use handler::*;
pub use handler_cache::*;
pub use instance::*;
pub use invocation::*;
pub use locator::*;
pub use proxy::*;
pub use reference::*;
pub use retry_queue::*;
pub use router::*;

pub use ripc_protocol::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `m`, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
