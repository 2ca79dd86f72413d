use std::mem;
use std::sync::Mutex;

use ripc_protocol::Request;

use crate::lock;

/// Requests accumulated by a batch-mode reference until they are flushed.
#[derive(Debug, Default)]
pub struct BatchRequestQueue {
    requests: Mutex<Vec<Request>>,
}

impl BatchRequestQueue {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn enqueue(&self, request: Request) {
        lock(&self.requests).push(request);
    }

    /// Takes every queued request, leaving the queue empty.
    pub fn swap(&self) -> Vec<Request> {
        mem::take(&mut *lock(&self.requests))
    }

    pub fn len(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripc_protocol::Identity;

    #[test]
    fn swap_drains_in_order() {
        let queue = BatchRequestQueue::new();
        queue.enqueue(Request::new(Identity::new("a", ""), "first"));
        queue.enqueue(Request::new(Identity::new("a", ""), "second"));
        assert_eq!(queue.len(), 2);

        let requests = queue.swap();
        assert!(queue.is_empty());
        let ops: Vec<&str> = requests.iter().map(|r| r.operation.as_str()).collect();
        assert_eq!(ops, vec!["first", "second"]);
    }
}
