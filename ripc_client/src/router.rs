//! Routed references: requests go to a router's client endpoints, and the
//! router must know about each target before forwarding to it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ripc_adapter::ObjectAdapter;
use ripc_protocol::*;

use crate::{lock, Reference};

/// What the router answers when asked for its client-facing proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientProxy {
    /// `None` means "use the router's own endpoints".
    pub endpoints: Option<Vec<Endpoint>>,
    /// `None` when the router does not say; treated as `true`.
    pub has_routing_table: Option<bool>,
}

#[async_trait]
pub trait RouterService: Send + Sync {
    fn identity(&self) -> Identity;

    /// The endpoints of the router itself.
    fn endpoints(&self) -> Vec<Endpoint>;

    async fn get_client_proxy(&self) -> Result<ClientProxy>;

    async fn get_server_proxy(&self) -> Result<Option<Vec<Endpoint>>>;

    /// Registers `proxies`, returning the identities the router evicted to
    /// make room for them.
    async fn add_proxies(&self, proxies: Vec<Reference>) -> Result<Vec<Identity>>;
}

#[derive(Default)]
struct RouterState {
    client_endpoints: Vec<Endpoint>,
    has_routing_table: bool,
    adapter: Option<Arc<ObjectAdapter>>,
    identities: HashSet<Identity>,
    evicted: HashMap<Identity, usize>,
}

pub struct RouterInfo {
    router: Arc<dyn RouterService>,
    state: Mutex<RouterState>,
}

impl RouterInfo {
    pub fn new(router: Arc<dyn RouterService>) -> Self {
        RouterInfo {
            router,
            state: Mutex::new(RouterState::default()),
        }
    }

    pub fn router(&self) -> &Arc<dyn RouterService> {
        &self.router
    }

    pub fn router_identity(&self) -> Identity {
        self.router.identity()
    }

    /// The endpoints clients send routed requests to. Asked once and kept
    /// until [`RouterInfo::destroy`].
    pub async fn get_client_endpoints(&self) -> Result<Vec<Endpoint>> {
        {
            let state = lock(&self.state);
            if !state.client_endpoints.is_empty() {
                return Ok(state.client_endpoints.clone());
            }
        }
        let proxy = self.router.get_client_proxy().await?;
        Ok(self.set_client_endpoints(proxy))
    }

    fn set_client_endpoints(&self, proxy: ClientProxy) -> Vec<Endpoint> {
        let mut state = lock(&self.state);
        if state.client_endpoints.is_empty() {
            state.has_routing_table = proxy.has_routing_table.unwrap_or(true);
            state.client_endpoints = match proxy.endpoints {
                Some(endpoints) => endpoints,
                None => self.router.endpoints(),
            };
        }
        state.client_endpoints.clone()
    }

    /// The endpoints the router accepts server-side connections on, for
    /// adapters receiving callbacks through it.
    pub async fn get_server_endpoints(&self) -> Result<Vec<Endpoint>> {
        match self.router.get_server_proxy().await? {
            Some(endpoints) => Ok(endpoints),
            None => Err(Error::no_endpoints(format!(
                "router `{}' has no server proxy",
                self.router_identity()
            ))),
        }
    }

    /// Makes sure the router knows about `reference`.
    ///
    /// Returns `true` when nothing had to be registered: the router keeps no
    /// routing table or the identity is already registered.
    pub async fn add_proxy(&self, reference: &Reference) -> Result<bool> {
        {
            let state = lock(&self.state);
            if !state.has_routing_table || state.identities.contains(reference.identity()) {
                return Ok(true);
            }
        }
        let evicted = self.router.add_proxies(vec![reference.clone()]).await?;
        tracing::debug!(
            "registered `{}' with router `{}', {} evicted",
            reference.identity(),
            self.router_identity(),
            evicted.len()
        );
        self.add_and_evict_proxies(reference.identity(), &evicted);
        Ok(false)
    }

    fn add_and_evict_proxies(&self, identity: &Identity, evicted: &[Identity]) {
        let mut state = lock(&self.state);

        // a concurrent registration may already have reported this identity
        // as evicted
        let remaining = state.evicted.get_mut(identity).map(|count| {
            *count -= 1;
            *count
        });
        match remaining {
            Some(0) => {
                state.evicted.remove(identity);
            }
            Some(_) => {}
            None => {
                state.identities.insert(identity.clone());
            }
        }

        for id in evicted {
            if !state.identities.remove(id) {
                *state.evicted.entry(id.clone()).or_insert(0) += 1;
            }
        }
    }

    pub fn is_registered(&self, identity: &Identity) -> bool {
        lock(&self.state).identities.contains(identity)
    }

    pub fn set_adapter(&self, adapter: Option<Arc<ObjectAdapter>>) {
        lock(&self.state).adapter = adapter;
    }

    pub fn get_adapter(&self) -> Option<Arc<ObjectAdapter>> {
        lock(&self.state).adapter.clone()
    }

    /// Forgets that `reference` is registered so the next connection
    /// registers it again.
    pub fn clear_cache(&self, reference: &Reference) {
        lock(&self.state).identities.remove(reference.identity());
    }

    pub fn destroy(&self) {
        let mut state = lock(&self.state);
        state.client_endpoints.clear();
        state.adapter = None;
        state.identities.clear();
        state.evicted.clear();
    }
}

/// One [`RouterInfo`] per router identity.
#[derive(Default)]
pub struct RouterManager {
    table: Mutex<HashMap<Identity, Arc<RouterInfo>>>,
}

impl RouterManager {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, router: Arc<dyn RouterService>) -> Arc<RouterInfo> {
        lock(&self.table)
            .entry(router.identity())
            .or_insert_with(|| Arc::new(RouterInfo::new(router)))
            .clone()
    }

    pub fn erase(&self, identity: &Identity) -> Option<Arc<RouterInfo>> {
        lock(&self.table).remove(identity)
    }

    pub fn destroy(&self) {
        for (_, info) in lock(&self.table).drain() {
            info.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticRouter;

    #[async_trait]
    impl RouterService for StaticRouter {
        fn identity(&self) -> Identity {
            Identity::new("router", "demo")
        }
        fn endpoints(&self) -> Vec<Endpoint> {
            vec![Endpoint::tcp("router", 4063)]
        }
        async fn get_client_proxy(&self) -> Result<ClientProxy> {
            Ok(ClientProxy::default())
        }
        async fn get_server_proxy(&self) -> Result<Option<Vec<Endpoint>>> {
            Ok(None)
        }
        async fn add_proxies(&self, _: Vec<Reference>) -> Result<Vec<Identity>> {
            Ok(Vec::new())
        }
    }

    fn info() -> RouterInfo {
        RouterInfo::new(Arc::new(StaticRouter))
    }

    #[test]
    fn add_completes_before_eviction() {
        let info = info();
        let id = Identity::new("hello", "");
        info.add_and_evict_proxies(&id, &[]);
        assert!(info.is_registered(&id));

        info.add_and_evict_proxies(&Identity::new("other", ""), &[id.clone()]);
        assert!(!info.is_registered(&id));
        assert!(lock(&info.state).evicted.is_empty());
    }

    #[test]
    fn eviction_reported_before_add_completes() {
        let info = info();
        let id = Identity::new("hello", "");
        info.add_and_evict_proxies(&Identity::new("other", ""), &[id.clone()]);
        assert!(!info.is_registered(&id));

        info.add_and_evict_proxies(&id, &[]);
        assert!(!info.is_registered(&id));
        assert!(lock(&info.state).evicted.is_empty());

        // a later registration sticks
        info.add_and_evict_proxies(&id, &[]);
        assert!(info.is_registered(&id));
    }

    #[tokio::test]
    async fn client_endpoints_default_to_router_endpoints() {
        let info = info();
        let endpoints = info.get_client_endpoints().await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::tcp("router", 4063)]);
        assert!(lock(&info.state).has_routing_table);

        assert_eq!(
            info.get_server_endpoints().await.unwrap_err().kind(),
            ErrorKind::NoEndpoints
        );

        info.destroy();
        assert!(lock(&info.state).client_endpoints.is_empty());
    }
}
