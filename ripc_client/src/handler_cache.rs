use std::sync::Mutex;

use ripc_protocol::Result;

use crate::{lock, same_connection, Reference, RequestHandler};

/// Remembers the request handler of one proxy so that consecutive calls
/// reuse the same connection.
pub struct RequestHandlerCache {
    reference: Reference,
    cache_connection: bool,
    handler: Mutex<Option<RequestHandler>>,
}

impl RequestHandlerCache {
    pub fn new(reference: Reference) -> Self {
        RequestHandlerCache {
            cache_connection: reference.cache_connection(),
            reference,
            handler: Mutex::new(None),
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// The cached handler, resolving and caching a new one when there is
    /// none. A connecting handler that finished flushing is replaced by the
    /// bound handler of its connection.
    pub fn get_handler(&self) -> Result<RequestHandler> {
        if !self.cache_connection {
            return self.reference.get_request_handler();
        }

        {
            let mut cached = lock(&self.handler);
            if let Some(handler) = cached.as_ref() {
                match handler.upgrade() {
                    Some(bound) => {
                        *cached = Some(bound.clone());
                        return Ok(bound);
                    }
                    None => return Ok(handler.clone()),
                }
            }
        }

        let handler = self.reference.get_request_handler()?;
        let mut cached = lock(&self.handler);
        // the first handler installed wins; a caller that lost the race
        // still uses the one it resolved
        if cached.is_none() {
            *cached = Some(handler.clone());
        }
        Ok(handler)
    }

    /// Forgets `handler` unless it was already replaced. A handler sending
    /// on the same connection counts as `handler`, so the bound handler a
    /// connecting handler was upgraded to goes along with it.
    pub fn clear_if_matches(&self, handler: &RequestHandler) {
        let mut cached = lock(&self.handler);
        let matches = cached.as_ref().map_or(false, |h| {
            h.ptr_eq(handler)
                || match (h.connection(), handler.connection()) {
                    (Some(a), Some(b)) => same_connection(&a, &b),
                    _ => false,
                }
        });
        if matches {
            *cached = None;
        }
    }

    /// Replaces `previous` with `next` if `previous` is still cached.
    pub fn update(&self, previous: &RequestHandler, next: RequestHandler) {
        let mut cached = lock(&self.handler);
        if cached.as_ref().map_or(false, |h| h.ptr_eq(previous)) {
            *cached = Some(next);
        }
    }

    pub fn cached(&self) -> Option<RequestHandler> {
        lock(&self.handler).clone()
    }
}
