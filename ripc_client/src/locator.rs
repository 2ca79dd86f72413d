//! Resolution of indirect references through a locator service.
//!
//! Results are cached per adapter id and per well-known identity, and
//! concurrent lookups for the same key share one remote call.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;

use ripc_protocol::*;

use crate::{lock, Reference};

/// Where the locator says a well-known object lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLocation {
    Direct(Vec<Endpoint>),
    /// Hosted by the adapter with this id, itself to be resolved.
    Indirect(String),
}

/// The remote locator. `Ok(None)` means the adapter or object is not
/// registered.
#[async_trait]
pub trait LocatorService: Send + Sync {
    fn identity(&self) -> Identity;

    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<Vec<Endpoint>>>;

    async fn find_object_by_id(&self, identity: &Identity) -> Result<Option<ObjectLocation>>;
}

struct CacheRow<T> {
    value: T,
    inserted: Instant,
}

impl<T: Clone> CacheRow<T> {
    fn new(value: T) -> Self {
        CacheRow {
            value,
            inserted: Instant::now(),
        }
    }

    /// The cached value and whether it is still fresh for `ttl` seconds.
    fn get(&self, ttl: i64) -> (T, bool) {
        let fresh = ttl < 0 || self.inserted.elapsed() < Duration::from_secs(ttl as u64);
        (self.value.clone(), fresh)
    }
}

struct PendingLookup<T> {
    waiters: Vec<oneshot::Sender<Result<T>>>,
    /// Well-known objects whose cached location led to this adapter lookup.
    well_known: Vec<Identity>,
}

impl<T> Default for PendingLookup<T> {
    fn default() -> Self {
        PendingLookup {
            waiters: Vec::new(),
            well_known: Vec::new(),
        }
    }
}

type AdapterLookup = Option<Vec<Endpoint>>;
type ObjectLookup = Option<ObjectLocation>;

#[derive(Default)]
struct LocatorState {
    adapters: HashMap<String, CacheRow<Vec<Endpoint>>>,
    objects: HashMap<Identity, CacheRow<ObjectLocation>>,
    adapter_requests: HashMap<String, PendingLookup<AdapterLookup>>,
    object_requests: HashMap<Identity, PendingLookup<ObjectLookup>>,
}

pub struct LocatorInfo {
    locator: Arc<dyn LocatorService>,
    background: bool,
    trace: u8,
    state: Mutex<LocatorState>,
}

impl LocatorInfo {
    pub fn new(locator: Arc<dyn LocatorService>, background: bool, trace: u8) -> Self {
        LocatorInfo {
            locator,
            background,
            trace,
            state: Mutex::new(LocatorState::default()),
        }
    }

    pub fn locator(&self) -> &Arc<dyn LocatorService> {
        &self.locator
    }

    pub fn locator_identity(&self) -> Identity {
        self.locator.identity()
    }

    /// Resolves the endpoints of `reference`, returning them along with
    /// whether they came from the cache.
    ///
    /// `ttl` is in seconds: negative caches forever and `0` always asks the
    /// locator, still sharing the lookup with concurrent callers.
    pub async fn get_endpoints(self: &Arc<Self>, reference: &Reference, ttl: i64) -> Result<(Vec<Endpoint>, bool)> {
        if !reference.is_indirect() {
            return Ok((reference.endpoints().to_vec(), false));
        }
        if !reference.is_well_known() {
            return self
                .adapter_endpoints(reference, reference.adapter_id(), ttl, None)
                .await;
        }

        let identity = reference.identity();
        let (location, cached) = match self.cached_object(identity, ttl) {
            Some((location, true)) => (location, true),
            Some((location, false)) if self.background => {
                self.start_object_lookup(identity, None);
                (location, true)
            }
            _ => match self.find_object(identity).await {
                Ok(Some(location)) => (location, false),
                Ok(None) => {
                    if self.trace >= 1 {
                        tracing::debug!("object not found: object = {}", identity);
                    }
                    return Err(Error::not_registered("object", &identity.to_string()));
                }
                Err(err) => {
                    if self.trace >= 1 {
                        tracing::debug!(
                            "couldn't contact the locator to retrieve endpoints: well-known proxy = {}: {}",
                            reference,
                            err
                        );
                    }
                    return Err(err);
                }
            },
        };

        match location {
            ObjectLocation::Direct(endpoints) if !endpoints.is_empty() => {
                self.trace_endpoints(reference, &endpoints, cached);
                Ok((endpoints, cached))
            }
            ObjectLocation::Indirect(adapter_id) if !adapter_id.is_empty() => {
                if self.trace >= 1 {
                    tracing::debug!(
                        "{} adapter for well-known object: well-known proxy = {}, adapter = {}",
                        if cached { "found" } else { "retrieved" },
                        reference,
                        adapter_id
                    );
                }
                self.adapter_endpoints(reference, &adapter_id, ttl, Some(identity))
                    .await
            }
            _ => {
                if self.trace >= 1 {
                    tracing::debug!(
                        "no endpoints configured for well-known object: well-known proxy = {}",
                        reference
                    );
                }
                Err(Error::no_endpoints(reference.to_string()))
            }
        }
    }

    async fn adapter_endpoints(
        self: &Arc<Self>,
        reference: &Reference,
        adapter_id: &str,
        ttl: i64,
        well_known: Option<&Identity>,
    ) -> Result<(Vec<Endpoint>, bool)> {
        match self.cached_adapter(adapter_id, ttl) {
            Some((endpoints, true)) => {
                self.trace_endpoints(reference, &endpoints, true);
                return Ok((endpoints, true));
            }
            Some((endpoints, false)) if self.background => {
                self.start_adapter_lookup(adapter_id, well_known, None);
                self.trace_endpoints(reference, &endpoints, true);
                return Ok((endpoints, true));
            }
            _ => {}
        }

        match self.find_adapter(adapter_id, well_known).await {
            Ok(Some(endpoints)) if !endpoints.is_empty() => {
                self.trace_endpoints(reference, &endpoints, false);
                Ok((endpoints, false))
            }
            Ok(Some(_)) => {
                if self.trace >= 1 {
                    tracing::debug!("no endpoints configured for adapter: adapter = {}", adapter_id);
                }
                Err(Error::no_endpoints(reference.to_string()))
            }
            Ok(None) => {
                if self.trace >= 1 {
                    tracing::debug!("adapter not found: adapter = {}", adapter_id);
                }
                Err(Error::not_registered("object adapter", adapter_id))
            }
            Err(err) => {
                if self.trace >= 1 {
                    tracing::debug!(
                        "couldn't contact the locator to retrieve endpoints: adapter = {}: {}",
                        adapter_id,
                        err
                    );
                }
                Err(err)
            }
        }
    }

    fn trace_endpoints(&self, reference: &Reference, endpoints: &[Endpoint], cached: bool) {
        if self.trace < 1 {
            return;
        }
        let what = if reference.is_well_known() {
            "well-known proxy"
        } else {
            "adapter"
        };
        let endpoints: Vec<String> = endpoints.iter().map(|ep| ep.to_string()).collect();
        if cached {
            tracing::debug!(
                "found endpoints for {} in locator cache: {} endpoints = {}",
                what,
                reference,
                endpoints.join(", ")
            );
        } else {
            tracing::debug!(
                "retrieved endpoints for {} from locator, adding to locator cache: {} endpoints = {}",
                what,
                reference,
                endpoints.join(", ")
            );
        }
    }

    fn cached_adapter(&self, adapter_id: &str, ttl: i64) -> Option<(Vec<Endpoint>, bool)> {
        if ttl == 0 {
            return None;
        }
        lock(&self.state).adapters.get(adapter_id).map(|row| row.get(ttl))
    }

    fn cached_object(&self, identity: &Identity, ttl: i64) -> Option<(ObjectLocation, bool)> {
        if ttl == 0 {
            return None;
        }
        lock(&self.state).objects.get(identity).map(|row| row.get(ttl))
    }

    async fn find_adapter(self: &Arc<Self>, adapter_id: &str, well_known: Option<&Identity>) -> Result<AdapterLookup> {
        let (tx, rx) = oneshot::channel();
        self.start_adapter_lookup(adapter_id, well_known, Some(tx));
        rx.await.map_err(|_| abandoned())?
    }

    async fn find_object(self: &Arc<Self>, identity: &Identity) -> Result<ObjectLookup> {
        let (tx, rx) = oneshot::channel();
        self.start_object_lookup(identity, Some(tx));
        rx.await.map_err(|_| abandoned())?
    }

    /// Joins the outstanding lookup for `adapter_id`, issuing it if there is
    /// none.
    fn start_adapter_lookup(
        self: &Arc<Self>,
        adapter_id: &str,
        well_known: Option<&Identity>,
        waiter: Option<oneshot::Sender<Result<AdapterLookup>>>,
    ) {
        let issue = {
            let mut state = lock(&self.state);
            let entry = state.adapter_requests.entry(adapter_id.to_owned());
            let issue = matches!(entry, Entry::Vacant(_));
            let pending = entry.or_default();
            pending.waiters.extend(waiter);
            pending.well_known.extend(well_known.cloned());
            issue
        };
        if !issue {
            return;
        }
        if self.trace >= 1 {
            tracing::debug!("searching for adapter by id: adapter = {}", adapter_id);
        }
        let this = self.clone();
        let adapter_id = adapter_id.to_owned();
        tokio::spawn(async move {
            let result = this.locator.find_adapter_by_id(&adapter_id).await;
            this.finish_adapter_lookup(&adapter_id, result);
        });
    }

    fn start_object_lookup(
        self: &Arc<Self>,
        identity: &Identity,
        waiter: Option<oneshot::Sender<Result<ObjectLookup>>>,
    ) {
        let issue = {
            let mut state = lock(&self.state);
            let entry = state.object_requests.entry(identity.clone());
            let issue = matches!(entry, Entry::Vacant(_));
            entry.or_default().waiters.extend(waiter);
            issue
        };
        if !issue {
            return;
        }
        if self.trace >= 1 {
            tracing::debug!("searching for well-known object: object = {}", identity);
        }
        let this = self.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let result = this.locator.find_object_by_id(&identity).await;
            this.finish_object_lookup(&identity, result);
        });
    }

    fn finish_adapter_lookup(&self, adapter_id: &str, result: Result<AdapterLookup>) {
        let pending = {
            let mut state = lock(&self.state);
            let pending = state.adapter_requests.remove(adapter_id).unwrap_or_default();
            match &result {
                Ok(Some(endpoints)) if !endpoints.is_empty() => {
                    state
                        .adapters
                        .insert(adapter_id.to_owned(), CacheRow::new(endpoints.clone()));
                }
                _ => {
                    // the well-known objects pointing at this adapter can't be
                    // resolved through it anymore
                    for identity in &pending.well_known {
                        state.objects.remove(identity);
                    }
                    if matches!(result, Ok(None)) {
                        state.adapters.remove(adapter_id);
                    }
                }
            }
            pending
        };
        notify(pending.waiters, result, || format!("adapter `{}'", adapter_id));
    }

    fn finish_object_lookup(&self, identity: &Identity, result: Result<ObjectLookup>) {
        let pending = {
            let mut state = lock(&self.state);
            let pending = state.object_requests.remove(identity).unwrap_or_default();
            match &result {
                Ok(Some(ObjectLocation::Direct(endpoints))) if !endpoints.is_empty() => {
                    state.objects.insert(
                        identity.clone(),
                        CacheRow::new(ObjectLocation::Direct(endpoints.clone())),
                    );
                }
                Ok(Some(ObjectLocation::Indirect(adapter_id))) if !adapter_id.is_empty() => {
                    state.objects.insert(
                        identity.clone(),
                        CacheRow::new(ObjectLocation::Indirect(adapter_id.clone())),
                    );
                }
                Ok(None) => {
                    state.objects.remove(identity);
                }
                _ => {}
            }
            pending
        };
        notify(pending.waiters, result, || format!("object `{}'", identity));
    }

    /// Forgets what is cached for `reference`; for a well-known object
    /// located through an adapter, the adapter's endpoints too.
    pub fn clear_cache(&self, reference: &Reference) {
        if !reference.is_indirect() {
            return;
        }
        let mut state = lock(&self.state);
        if !reference.is_well_known() {
            if state.adapters.remove(reference.adapter_id()).is_some() && self.trace >= 2 {
                tracing::debug!(
                    "removed endpoints for adapter from locator cache: adapter = {}",
                    reference.adapter_id()
                );
            }
            return;
        }
        match state.objects.remove(reference.identity()).map(|row| row.value) {
            Some(ObjectLocation::Indirect(adapter_id)) => {
                if self.trace >= 2 {
                    tracing::debug!(
                        "removed adapter for well-known object from locator cache: {} adapter = {}",
                        reference,
                        adapter_id
                    );
                }
                state.adapters.remove(&adapter_id);
            }
            Some(ObjectLocation::Direct(_)) => {
                if self.trace >= 2 {
                    tracing::debug!(
                        "removed endpoints for well-known object from locator cache: {}",
                        reference
                    );
                }
            }
            None => {}
        }
    }

    pub fn destroy(&self) {
        let mut state = lock(&self.state);
        state.adapters.clear();
        state.objects.clear();
    }
}

fn abandoned() -> Error {
    Error::new(ErrorKind::CommunicatorDestroyed, "locator lookup abandoned")
}

fn notify<T: Clone, F: Fn() -> String>(waiters: Vec<oneshot::Sender<Result<T>>>, result: Result<T>, what: F) {
    for waiter in waiters {
        if waiter.send(result.clone()).is_err() {
            tracing::warn!("dropped locator result for {}: caller went away", what());
        }
    }
}

/// One [`LocatorInfo`] per locator identity.
pub struct LocatorManager {
    background: bool,
    trace: u8,
    table: Mutex<HashMap<Identity, Arc<LocatorInfo>>>,
}

impl LocatorManager {
    pub fn new(background: bool, trace: u8) -> Self {
        LocatorManager {
            background,
            trace,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, locator: Arc<dyn LocatorService>) -> Arc<LocatorInfo> {
        let mut table = lock(&self.table);
        table
            .entry(locator.identity())
            .or_insert_with(|| Arc::new(LocatorInfo::new(locator, self.background, self.trace)))
            .clone()
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

    #[tokio::test]
    async fn cache_rows_expire_after_ttl() {
        tokio::time::pause();
        let row = CacheRow::new(vec![Endpoint::tcp("h", 1)]);
        assert!(row.get(1).1);
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(row.get(1).1);
        tokio::time::advance(Duration::from_millis(1)).await;
        let (endpoints, fresh) = row.get(1);
        assert!(!fresh);
        assert_eq!(endpoints, vec![Endpoint::tcp("h", 1)]);
        assert!(row.get(-1).1);
    }
}
