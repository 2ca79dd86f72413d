//! In-process object adapters.
//!
//! An [`ObjectAdapter`] holds the servants this process serves. The client
//! engine consults the [`ObjectAdapterRegistry`] to find out whether a
//! reference designates a local object, in which case calls are dispatched
//! directly instead of going through a connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use ripc_protocol::*;

/// Something that can execute requests for one object (or facet).
pub trait Servant: Send + Sync {
    fn dispatch(&self, request: &Request) -> Result<Reply>;
}

impl<F> Servant for F
where
    F: Fn(&Request) -> Result<Reply> + Send + Sync,
{
    fn dispatch(&self, request: &Request) -> Result<Reply> {
        self(request)
    }
}

type ServantMap = HashMap<Identity, HashMap<String, Arc<dyn Servant>>>;

pub struct ObjectAdapter {
    name: String,
    adapter_id: String,
    replica_group_id: String,
    endpoints: Vec<Endpoint>,
    servants: RwLock<ServantMap>,
    deactivated: AtomicBool,
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.name)
            .field("adapter_id", &self.adapter_id)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl ObjectAdapter {
    pub fn new(name: &str) -> Self {
        ObjectAdapter {
            name: name.to_owned(),
            adapter_id: String::new(),
            replica_group_id: String::new(),
            endpoints: Vec::new(),
            servants: RwLock::new(HashMap::new()),
            deactivated: AtomicBool::new(false),
        }
    }

    pub fn with_adapter_id(mut self, adapter_id: &str) -> Self {
        self.adapter_id = adapter_id.to_owned();
        self
    }

    pub fn with_replica_group_id(mut self, replica_group_id: &str) -> Self {
        self.replica_group_id = replica_group_id.to_owned();
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn add(&self, identity: Identity, servant: Arc<dyn Servant>) -> Result<()> {
        self.add_facet(identity, "", servant)
    }

    pub fn add_facet(&self, identity: Identity, facet: &str, servant: Arc<dyn Servant>) -> Result<()> {
        self.check_active()?;
        let mut servants = self.servants.write()?;
        let facets = servants.entry(identity.clone()).or_default();
        if facets.contains_key(facet) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("servant `{}' facet `{}' is already registered", identity, facet),
            ));
        }
        facets.insert(facet.to_owned(), servant);
        Ok(())
    }

    pub fn remove(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        let mut servants = self.servants.write().ok()?;
        let mut facets = servants.remove(identity)?;
        facets.remove("")
    }

    pub fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let servants = self.servants.read().ok()?;
        servants.get(identity)?.get(facet).cloned()
    }

    pub fn has_servant(&self, identity: &Identity) -> bool {
        self.servants
            .read()
            .map(|servants| servants.contains_key(identity))
            .unwrap_or(false)
    }

    /// Whether a target addressed by `identity`, `adapter_id` and `endpoints`
    /// is served by this adapter.
    ///
    /// Well-known targets are local when a servant is registered for them,
    /// indirect targets when the adapter (or replica group) id matches and
    /// direct targets when one endpoint shares an address with a published
    /// endpoint.
    pub fn is_local(&self, identity: &Identity, adapter_id: &str, endpoints: &[Endpoint]) -> bool {
        if self.is_deactivated() {
            return false;
        }
        if endpoints.is_empty() && adapter_id.is_empty() {
            return self.has_servant(identity);
        }
        if !adapter_id.is_empty() {
            return adapter_id == self.adapter_id
                || (!self.replica_group_id.is_empty() && adapter_id == self.replica_group_id);
        }
        endpoints.iter().any(|ep| {
            self.endpoints
                .iter()
                .any(|own| own.transport() == ep.transport() && own.address() == ep.address())
        })
    }

    pub fn dispatch(&self, request: &Request) -> Result<Reply> {
        self.check_active()?;
        let servant = {
            let servants = self.servants.read()?;
            match servants.get(&request.identity) {
                None => return Ok(status_reply(ReplyStatus::ObjectNotExist)),
                Some(facets) => match facets.get(&request.facet) {
                    None => return Ok(status_reply(ReplyStatus::FacetNotExist)),
                    Some(servant) => servant.clone(),
                },
            }
        };
        servant.dispatch(request)
    }

    pub fn deactivate(&self) {
        if !self.deactivated.swap(true, Ordering::SeqCst) {
            tracing::debug!("object adapter `{}' deactivated", self.name);
        }
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }

    fn check_active(&self) -> Result<()> {
        if self.is_deactivated() {
            return Err(Error::new(
                ErrorKind::ObjectAdapterDeactivated,
                format!("object adapter `{}' is deactivated", self.name),
            ));
        }
        Ok(())
    }
}

fn status_reply(status: ReplyStatus) -> Reply {
    Reply {
        status,
        payload: bytes::Bytes::new(),
    }
}

/// The adapters of one process, searched for collocation.
#[derive(Default)]
pub struct ObjectAdapterRegistry {
    adapters: RwLock<Vec<Arc<ObjectAdapter>>>,
}

impl ObjectAdapterRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&self, adapter: Arc<ObjectAdapter>) -> Result<()> {
        let mut adapters = self.adapters.write()?;
        if adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("object adapter `{}' is already registered", adapter.name()),
            ));
        }
        adapters.push(adapter);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ObjectAdapter>> {
        let mut adapters = self.adapters.write().ok()?;
        let pos = adapters.iter().position(|a| a.name() == name)?;
        Some(adapters.remove(pos))
    }

    pub fn find_object_adapter(
        &self,
        identity: &Identity,
        adapter_id: &str,
        endpoints: &[Endpoint],
    ) -> Option<Arc<ObjectAdapter>> {
        let adapters = self.adapters.read().ok()?;
        adapters
            .iter()
            .find(|a| a.is_local(identity, adapter_id, endpoints))
            .cloned()
    }

    pub fn destroy(&self) {
        if let Ok(mut adapters) = self.adapters.write() {
            for adapter in adapters.drain(..) {
                adapter.deactivate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn echo(req: &Request) -> Result<Reply> {
        Ok(Reply::ok(req.payload.clone()))
    }

    #[test]
    fn dispatch_to_registered_servant() {
        let adapter = ObjectAdapter::new("Hello");
        adapter.add(Identity::new("hello", ""), Arc::new(echo)).unwrap();

        let mut req = Request::new(Identity::new("hello", ""), "echo");
        req.payload = Bytes::from_static(b"ping");
        let reply = adapter.dispatch(&req).unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"ping"));

        req.identity = Identity::new("missing", "");
        assert_eq!(adapter.dispatch(&req).unwrap().status, ReplyStatus::ObjectNotExist);

        req.identity = Identity::new("hello", "");
        req.facet = "admin".to_owned();
        assert_eq!(adapter.dispatch(&req).unwrap().status, ReplyStatus::FacetNotExist);
    }

    #[test]
    fn duplicate_servant_rejected() {
        let adapter = ObjectAdapter::new("Hello");
        adapter.add(Identity::new("hello", ""), Arc::new(echo)).unwrap();
        let err = adapter
            .add(Identity::new("hello", ""), Arc::new(echo))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn locality_rules() {
        let adapter = ObjectAdapter::new("Hello")
            .with_adapter_id("HelloAdapter")
            .with_replica_group_id("HelloGroup")
            .with_endpoints(vec![Endpoint::tcp("127.0.0.1", 10000)]);
        adapter.add(Identity::new("hello", ""), Arc::new(echo)).unwrap();

        let id = Identity::new("hello", "");
        assert!(adapter.is_local(&id, "", &[]));
        assert!(!adapter.is_local(&Identity::new("other", ""), "", &[]));
        assert!(adapter.is_local(&id, "HelloAdapter", &[]));
        assert!(adapter.is_local(&id, "HelloGroup", &[]));
        assert!(!adapter.is_local(&id, "Other", &[]));
        assert!(adapter.is_local(
            &id,
            "",
            &[Endpoint::tcp("127.0.0.1", 10000).with_timeout(100)]
        ));
        assert!(!adapter.is_local(&id, "", &[Endpoint::tcp("127.0.0.1", 10001)]));
    }

    #[test]
    fn deactivated_adapter_is_never_local() {
        let registry = ObjectAdapterRegistry::new();
        let adapter = Arc::new(ObjectAdapter::new("Hello").with_adapter_id("HelloAdapter"));
        registry.add(adapter.clone()).unwrap();
        assert!(registry
            .find_object_adapter(&Identity::new("x", ""), "HelloAdapter", &[])
            .is_some());

        registry.destroy();
        assert!(adapter.is_deactivated());
        assert!(registry
            .find_object_adapter(&Identity::new("x", ""), "HelloAdapter", &[])
            .is_none());
        let err = adapter
            .dispatch(&Request::new(Identity::new("x", ""), "op"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectAdapterDeactivated);
    }
}
