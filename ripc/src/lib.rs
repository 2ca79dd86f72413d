//! ripc turns calls on proxies into requests on connections: it resolves
//! indirect and routed addresses, reuses connections, dispatches to local
//! adapters and retries failed calls without breaking at-most-once delivery.

pub use ripc_adapter::{ObjectAdapter, ObjectAdapterRegistry, Servant};
pub use ripc_client::*;
