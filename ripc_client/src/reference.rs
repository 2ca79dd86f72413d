use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ripc_protocol::*;

use crate::selector::filter_endpoints;
use crate::{
    same_connection, BatchRequestQueue, CollocatedRequestHandler, ConnectRequestHandler, Connection,
    ConnectionRequestHandler, Instance, LocatorInfo, RequestHandler, RouterInfo,
};

/// Immutable description of a target object and of how to invoke it.
///
/// `change_*` methods return the same reference when the value does not
/// change and a modified copy otherwise.
#[derive(Clone)]
pub struct Reference {
    inner: Arc<ReferenceData>,
}

#[derive(Clone)]
struct ReferenceData {
    instance: Arc<Instance>,
    mode: InvocationMode,
    identity: Identity,
    facet: String,
    context: Context,
    secure: bool,
    protocol: ProtocolVersion,
    encoding: EncodingVersion,
    invocation_timeout: i64,
    compress: Option<bool>,
    addressing: Addressing,
    batch: Option<Arc<BatchRequestQueue>>,
}

#[derive(Clone)]
pub enum Addressing {
    /// Tied to one already established connection.
    Bound { connection: Arc<dyn Connection> },
    Routable(RoutableAddressing),
}

#[derive(Clone)]
pub struct RoutableAddressing {
    pub endpoints: Vec<Endpoint>,
    pub adapter_id: String,
    pub locator: Option<Arc<LocatorInfo>>,
    pub router: Option<Arc<RouterInfo>>,
    pub collocation_optimized: bool,
    pub cache_connection: bool,
    pub prefer_secure: bool,
    pub endpoint_selection: EndpointSelection,
    /// Seconds; `-1` caches forever and `0` disables the locator cache.
    pub locator_cache_timeout: i64,
    pub connection_id: String,
}

fn batch_queue_for(mode: InvocationMode) -> Option<Arc<BatchRequestQueue>> {
    if mode.is_batch() {
        Some(Arc::new(BatchRequestQueue::new()))
    } else {
        None
    }
}

fn fixed_proxy(op: &str) -> Error {
    Error::new(
        ErrorKind::UnsupportedOperation,
        format!("`{}' is not supported on a fixed proxy", op),
    )
}

impl Reference {
    fn new(instance: &Arc<Instance>, identity: Identity, addressing: Addressing) -> Reference {
        let mode = InvocationMode::Twoway;
        Reference {
            inner: Arc::new(ReferenceData {
                instance: instance.clone(),
                mode,
                identity,
                facet: String::new(),
                context: Context::new(),
                secure: false,
                protocol: PROTOCOL_1_0,
                encoding: ENCODING_1_1,
                invocation_timeout: instance.config().invocation_timeout_ms,
                compress: None,
                addressing,
                batch: batch_queue_for(mode),
            }),
        }
    }

    fn routable(
        instance: &Arc<Instance>,
        identity: Identity,
        endpoints: Vec<Endpoint>,
        adapter_id: &str,
    ) -> Reference {
        let config = instance.config();
        let routable = RoutableAddressing {
            endpoints,
            adapter_id: adapter_id.to_owned(),
            locator: instance.default_locator(),
            router: instance.default_router(),
            collocation_optimized: config.collocation_optimized,
            cache_connection: config.cache_connection,
            prefer_secure: config.prefer_secure,
            endpoint_selection: config.endpoint_selection,
            locator_cache_timeout: config.default_locator_cache_timeout,
            connection_id: String::new(),
        };
        Reference::new(instance, identity, Addressing::Routable(routable))
    }

    /// A reference to an object reachable at `endpoints`.
    pub fn direct(instance: &Arc<Instance>, identity: Identity, endpoints: Vec<Endpoint>) -> Reference {
        Reference::routable(instance, identity, endpoints, "")
    }

    /// A reference to an object hosted by the adapter `adapter_id`, resolved
    /// through the locator.
    pub fn indirect(instance: &Arc<Instance>, identity: Identity, adapter_id: &str) -> Reference {
        Reference::routable(instance, identity, Vec::new(), adapter_id)
    }

    /// A reference resolved by identity alone through the locator.
    pub fn well_known(instance: &Arc<Instance>, identity: Identity) -> Reference {
        Reference::routable(instance, identity, Vec::new(), "")
    }

    pub fn fixed(instance: &Arc<Instance>, identity: Identity, connection: Arc<dyn Connection>) -> Reference {
        Reference::new(instance, identity, Addressing::Bound { connection })
    }

    pub fn ptr_eq(&self, other: &Reference) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.inner.instance
    }

    pub fn mode(&self) -> InvocationMode {
        self.inner.mode
    }

    pub fn is_twoway(&self) -> bool {
        self.inner.mode.is_twoway()
    }

    pub fn is_batch(&self) -> bool {
        self.inner.mode.is_batch()
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn facet(&self) -> &str {
        &self.inner.facet
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn secure(&self) -> bool {
        self.inner.secure
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.inner.protocol
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.inner.encoding
    }

    /// Milliseconds; `-1` means no timeout.
    pub fn invocation_timeout(&self) -> i64 {
        self.inner.invocation_timeout
    }

    pub fn compress(&self) -> Option<bool> {
        self.inner.compress
    }

    pub fn addressing(&self) -> &Addressing {
        &self.inner.addressing
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.inner.addressing, Addressing::Bound { .. })
    }

    pub fn fixed_connection(&self) -> Option<&Arc<dyn Connection>> {
        match &self.inner.addressing {
            Addressing::Bound { connection } => Some(connection),
            Addressing::Routable(_) => None,
        }
    }

    pub(crate) fn routable_addressing(&self) -> Option<&RoutableAddressing> {
        match &self.inner.addressing {
            Addressing::Bound { .. } => None,
            Addressing::Routable(r) => Some(r),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.routable_addressing()
            .map(|r| r.endpoints.as_slice())
            .unwrap_or(&[])
    }

    pub fn adapter_id(&self) -> &str {
        self.routable_addressing()
            .map(|r| r.adapter_id.as_str())
            .unwrap_or("")
    }

    pub fn locator_info(&self) -> Option<&Arc<LocatorInfo>> {
        self.routable_addressing().and_then(|r| r.locator.as_ref())
    }

    pub fn router_info(&self) -> Option<&Arc<RouterInfo>> {
        self.routable_addressing().and_then(|r| r.router.as_ref())
    }

    pub fn collocation_optimized(&self) -> bool {
        self.routable_addressing()
            .map(|r| r.collocation_optimized)
            .unwrap_or(false)
    }

    pub fn cache_connection(&self) -> bool {
        self.routable_addressing()
            .map(|r| r.cache_connection)
            .unwrap_or(true)
    }

    pub fn prefer_secure(&self) -> bool {
        self.routable_addressing()
            .map(|r| r.prefer_secure)
            .unwrap_or(false)
    }

    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.routable_addressing()
            .map(|r| r.endpoint_selection)
            .unwrap_or_default()
    }

    pub fn locator_cache_timeout(&self) -> i64 {
        self.routable_addressing()
            .map(|r| r.locator_cache_timeout)
            .unwrap_or(-1)
    }

    pub fn connection_id(&self) -> &str {
        self.routable_addressing()
            .map(|r| r.connection_id.as_str())
            .unwrap_or("")
    }

    /// Whether endpoints must be obtained from a locator.
    pub fn is_indirect(&self) -> bool {
        match &self.inner.addressing {
            Addressing::Bound { .. } => false,
            Addressing::Routable(r) => r.endpoints.is_empty(),
        }
    }

    pub fn is_well_known(&self) -> bool {
        match &self.inner.addressing {
            Addressing::Bound { .. } => false,
            Addressing::Routable(r) => r.endpoints.is_empty() && r.adapter_id.is_empty(),
        }
    }

    pub fn batch_queue(&self) -> Option<&Arc<BatchRequestQueue>> {
        self.inner.batch.as_ref()
    }

    fn with<F: FnOnce(&mut ReferenceData)>(&self, f: F) -> Reference {
        let mut data = (*self.inner).clone();
        f(&mut data);
        Reference {
            inner: Arc::new(data),
        }
    }

    fn with_routable<F: FnOnce(&mut RoutableAddressing)>(&self, op: &str, f: F) -> Result<Reference> {
        if self.is_fixed() {
            return Err(fixed_proxy(op));
        }
        Ok(self.with(|data| {
            if let Addressing::Routable(r) = &mut data.addressing {
                f(r);
            }
        }))
    }

    pub fn change_mode(&self, mode: InvocationMode) -> Reference {
        if mode == self.inner.mode {
            return self.clone();
        }
        self.with(|data| {
            data.mode = mode;
            data.batch = batch_queue_for(mode);
        })
    }

    pub fn change_identity(&self, identity: Identity) -> Reference {
        if identity == self.inner.identity {
            return self.clone();
        }
        self.with(|data| data.identity = identity)
    }

    pub fn change_facet(&self, facet: &str) -> Reference {
        if facet == self.inner.facet {
            return self.clone();
        }
        self.with(|data| data.facet = facet.to_owned())
    }

    pub fn change_context(&self, context: Context) -> Reference {
        if context == self.inner.context {
            return self.clone();
        }
        self.with(|data| data.context = context)
    }

    pub fn change_secure(&self, secure: bool) -> Reference {
        if secure == self.inner.secure {
            return self.clone();
        }
        self.with(|data| data.secure = secure)
    }

    pub fn change_protocol(&self, protocol: ProtocolVersion) -> Reference {
        if protocol == self.inner.protocol {
            return self.clone();
        }
        self.with(|data| data.protocol = protocol)
    }

    pub fn change_encoding(&self, encoding: EncodingVersion) -> Reference {
        if encoding == self.inner.encoding {
            return self.clone();
        }
        self.with(|data| data.encoding = encoding)
    }

    pub fn change_invocation_timeout(&self, timeout_ms: i64) -> Reference {
        if timeout_ms == self.inner.invocation_timeout {
            return self.clone();
        }
        self.with(|data| data.invocation_timeout = timeout_ms)
    }

    /// Overrides compression; routable references apply it to each endpoint.
    pub fn change_compress(&self, compress: bool) -> Reference {
        if self.inner.compress == Some(compress) {
            return self.clone();
        }
        self.with(|data| {
            data.compress = Some(compress);
            if let Addressing::Routable(r) = &mut data.addressing {
                r.endpoints = r.endpoints.iter().map(|ep| ep.with_compress(compress)).collect();
            }
        })
    }

    /// Switches to indirect addressing, dropping the endpoints.
    pub fn change_adapter_id(&self, adapter_id: &str) -> Result<Reference> {
        if self.adapter_id() == adapter_id && !self.is_fixed() {
            return Ok(self.clone());
        }
        self.with_routable("change_adapter_id", |r| {
            r.adapter_id = adapter_id.to_owned();
            r.endpoints.clear();
        })
    }

    /// Switches to direct addressing, dropping the adapter id.
    pub fn change_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Reference> {
        if self.endpoints() == endpoints.as_slice() && !self.is_fixed() {
            return Ok(self.clone());
        }
        let compress = self.inner.compress;
        self.with_routable("change_endpoints", |r| {
            r.endpoints = apply_overrides(endpoints, &r.connection_id, compress);
            r.adapter_id.clear();
        })
    }

    pub fn change_locator(&self, locator: Option<Arc<LocatorInfo>>) -> Result<Reference> {
        if let Some(r) = self.routable_addressing() {
            if same_locator(&r.locator, &locator) {
                return Ok(self.clone());
            }
        }
        self.with_routable("change_locator", |r| r.locator = locator)
    }

    pub fn change_router(&self, router: Option<Arc<RouterInfo>>) -> Result<Reference> {
        if let Some(r) = self.routable_addressing() {
            if same_router(&r.router, &router) {
                return Ok(self.clone());
            }
        }
        self.with_routable("change_router", |r| r.router = router)
    }

    pub fn change_collocation_optimized(&self, enabled: bool) -> Result<Reference> {
        if self.routable_addressing().map(|r| r.collocation_optimized) == Some(enabled) {
            return Ok(self.clone());
        }
        self.with_routable("change_collocation_optimized", |r| {
            r.collocation_optimized = enabled
        })
    }

    pub fn change_cache_connection(&self, enabled: bool) -> Result<Reference> {
        if self.routable_addressing().map(|r| r.cache_connection) == Some(enabled) {
            return Ok(self.clone());
        }
        self.with_routable("change_cache_connection", |r| r.cache_connection = enabled)
    }

    pub fn change_prefer_secure(&self, prefer: bool) -> Result<Reference> {
        if self.routable_addressing().map(|r| r.prefer_secure) == Some(prefer) {
            return Ok(self.clone());
        }
        self.with_routable("change_prefer_secure", |r| r.prefer_secure = prefer)
    }

    pub fn change_endpoint_selection(&self, selection: EndpointSelection) -> Result<Reference> {
        if self.routable_addressing().map(|r| r.endpoint_selection) == Some(selection) {
            return Ok(self.clone());
        }
        self.with_routable("change_endpoint_selection", |r| {
            r.endpoint_selection = selection
        })
    }

    pub fn change_locator_cache_timeout(&self, ttl: i64) -> Result<Reference> {
        if self.routable_addressing().map(|r| r.locator_cache_timeout) == Some(ttl) {
            return Ok(self.clone());
        }
        self.with_routable("change_locator_cache_timeout", |r| {
            r.locator_cache_timeout = ttl
        })
    }

    /// Sets the connection id used to keep connections apart, on the
    /// reference and on each of its endpoints.
    pub fn change_connection_id(&self, connection_id: &str) -> Result<Reference> {
        if self.routable_addressing().map(|r| r.connection_id.as_str()) == Some(connection_id) {
            return Ok(self.clone());
        }
        self.with_routable("change_connection_id", |r| {
            r.connection_id = connection_id.to_owned();
            r.endpoints = r
                .endpoints
                .iter()
                .map(|ep| ep.with_connection_id(connection_id))
                .collect();
        })
    }

    /// Returns a handler able to send requests for this reference right now.
    ///
    /// Bound references get a handler on their connection, collocated
    /// targets a handler dispatching to the local adapter. Anything else gets
    /// a connecting handler that queues requests while the endpoints are
    /// resolved and the connection established in the background.
    pub fn get_request_handler(&self) -> Result<RequestHandler> {
        let instance = self.instance();
        instance.check_destroyed()?;
        match &self.inner.addressing {
            Addressing::Bound { connection } => {
                let endpoint = connection.endpoint();
                if endpoint.datagram() != self.mode().is_datagram()
                    || (self.secure() && !endpoint.secure())
                {
                    return Err(Error::no_endpoints(self.to_string()));
                }
                if !connection.is_active() {
                    return Err(Error::new(
                        ErrorKind::ConnectionLost,
                        format!("connection to `{}' is closed", endpoint),
                    ));
                }
                let compress = self.compress().unwrap_or_else(|| endpoint.compress());
                Ok(RequestHandler::Bound(Arc::new(ConnectionRequestHandler::new(
                    self.clone(),
                    connection.clone(),
                    compress,
                ))))
            }
            Addressing::Routable(routable) => {
                if routable.collocation_optimized {
                    if let Some(adapter) = instance.adapters().find_object_adapter(
                        self.identity(),
                        &routable.adapter_id,
                        &routable.endpoints,
                    ) {
                        return Ok(RequestHandler::Collocated(CollocatedRequestHandler::new(
                            self.clone(),
                            adapter,
                        )));
                    }
                }

                let handler = ConnectRequestHandler::new(self.clone());
                let connecting = handler.clone();
                let reference = self.clone();
                instance.handle().spawn(async move {
                    match reference.get_connection().await {
                        Ok((connection, compress)) => {
                            connecting.set_connection(connection, compress).await
                        }
                        Err(err) => connecting.set_exception(err),
                    }
                });
                Ok(RequestHandler::Connecting(handler))
            }
        }
    }

    /// Resolves the endpoints and establishes a connection. Routed
    /// references go to the router's client endpoints.
    pub(crate) async fn get_connection(&self) -> Result<(Arc<dyn Connection>, bool)> {
        let routable = self
            .routable_addressing()
            .ok_or_else(|| Error::new(ErrorKind::FixedProxy, self.to_string()))?;
        if let Some(router) = &routable.router {
            let endpoints = router.get_client_endpoints().await?;
            if !endpoints.is_empty() {
                let endpoints = apply_overrides(endpoints, &routable.connection_id, self.compress());
                return self.create_connection(endpoints).await;
            }
        }
        self.get_connection_no_router(routable).await
    }

    async fn get_connection_no_router(
        &self,
        routable: &RoutableAddressing,
    ) -> Result<(Arc<dyn Connection>, bool)> {
        if !routable.endpoints.is_empty() {
            return self.create_connection(routable.endpoints.clone()).await;
        }
        let locator = match &routable.locator {
            Some(locator) => locator,
            None => return Err(Error::no_endpoints(self.to_string())),
        };

        let mut retried = false;
        loop {
            let (endpoints, cached) = locator
                .get_endpoints(self, routable.locator_cache_timeout)
                .await?;
            let endpoints = apply_overrides(endpoints, &routable.connection_id, self.compress());
            match self.create_connection(endpoints).await {
                Ok(connection) => return Ok(connection),
                Err(err) if err.kind() == ErrorKind::NoEndpoints => return Err(err),
                Err(err) => {
                    locator.clear_cache(self);
                    if cached && !retried {
                        if self.instance().trace().retry >= 2 {
                            tracing::debug!(
                                "connection to cached endpoints failed, removing endpoints from cache and trying again: {}",
                                err
                            );
                        }
                        retried = true;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn create_connection(&self, all: Vec<Endpoint>) -> Result<(Arc<dyn Connection>, bool)> {
        let endpoints = filter_endpoints(
            all,
            self.mode(),
            self.secure(),
            self.prefer_secure(),
            self.endpoint_selection(),
        );
        if endpoints.is_empty() {
            return Err(Error::no_endpoints(self.to_string()));
        }

        let establisher = self.instance().establisher();
        let connection = if self.cache_connection() || endpoints.len() == 1 {
            establisher.connect(&endpoints, false).await?
        } else {
            // one endpoint at a time so that a new connection is opened even
            // if one already exists to a later endpoint
            let mut first_error = None;
            let mut established = None;
            for (i, endpoint) in endpoints.iter().enumerate() {
                let has_more = i + 1 < endpoints.len();
                match establisher.connect(std::slice::from_ref(endpoint), has_more).await {
                    Ok(connection) => {
                        established = Some(connection);
                        break;
                    }
                    Err(err) => {
                        if self.instance().trace().network >= 2 {
                            tracing::debug!("connection to `{}' failed: {}", endpoint, err);
                        }
                        first_error.get_or_insert(err);
                    }
                }
            }
            match established {
                Some(connection) => connection,
                None => {
                    return Err(first_error.unwrap_or_else(|| Error::no_endpoints(self.to_string())))
                }
            }
        };

        if let Some(adapter) = self.router_info().and_then(|r| r.get_adapter()) {
            connection.set_adapter(Some(adapter));
        }
        let compress = connection.endpoint().compress();
        Ok((connection, compress))
    }
}

/// Applies the reference's connection id and compression override to
/// endpoints obtained from a locator or router.
fn apply_overrides(endpoints: Vec<Endpoint>, connection_id: &str, compress: Option<bool>) -> Vec<Endpoint> {
    endpoints
        .into_iter()
        .map(|ep| {
            let ep = ep.with_connection_id(connection_id);
            match compress {
                Some(c) => ep.with_compress(c),
                None => ep,
            }
        })
        .collect()
}

fn same_locator(a: &Option<Arc<LocatorInfo>>, b: &Option<Arc<LocatorInfo>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.locator_identity() == b.locator_identity(),
        _ => false,
    }
}

fn same_router(a: &Option<Arc<RouterInfo>>, b: &Option<Arc<RouterInfo>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.router_identity() == b.router_identity(),
        _ => false,
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Reference) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let (a, b) = (&*self.inner, &*other.inner);
        if a.mode != b.mode
            || a.identity != b.identity
            || a.facet != b.facet
            || a.context != b.context
            || a.secure != b.secure
            || a.protocol != b.protocol
            || a.encoding != b.encoding
            || a.invocation_timeout != b.invocation_timeout
            || a.compress != b.compress
        {
            return false;
        }
        match (&a.addressing, &b.addressing) {
            (Addressing::Bound { connection: c1 }, Addressing::Bound { connection: c2 }) => {
                same_connection(c1, c2)
            }
            (Addressing::Routable(r1), Addressing::Routable(r2)) => {
                r1.endpoints == r2.endpoints
                    && r1.adapter_id == r2.adapter_id
                    && same_locator(&r1.locator, &r2.locator)
                    && same_router(&r1.router, &r2.router)
                    && r1.collocation_optimized == r2.collocation_optimized
                    && r1.cache_connection == r2.cache_connection
                    && r1.prefer_secure == r2.prefer_secure
                    && r1.endpoint_selection == r2.endpoint_selection
                    && r1.locator_cache_timeout == r2.locator_cache_timeout
                    && r1.connection_id == r2.connection_id
            }
            _ => false,
        }
    }
}

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let data = &*self.inner;
        data.mode.hash(state);
        data.identity.hash(state);
        data.facet.hash(state);
        data.context.hash(state);
        data.secure.hash(state);
        data.protocol.hash(state);
        data.encoding.hash(state);
        data.invocation_timeout.hash(state);
        data.compress.hash(state);
        match &data.addressing {
            Addressing::Bound { connection } => {
                (Arc::as_ptr(connection) as *const () as usize).hash(state);
            }
            Addressing::Routable(r) => {
                r.endpoints.hash(state);
                r.adapter_id.hash(state);
                r.locator.as_ref().map(|l| l.locator_identity()).hash(state);
                r.router.as_ref().map(|r| r.router_identity()).hash(state);
                r.collocation_optimized.hash(state);
                r.cache_connection.hash(state);
                r.prefer_secure.hash(state);
                r.endpoint_selection.hash(state);
                r.locator_cache_timeout.hash(state);
                r.connection_id.hash(state);
            }
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.identity)?;
        if !self.inner.facet.is_empty() {
            write!(f, " -f {}", self.inner.facet)?;
        }
        let mode = match self.inner.mode {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        };
        write!(f, " {}", mode)?;
        if self.inner.secure {
            write!(f, " -s")?;
        }
        match &self.inner.addressing {
            Addressing::Bound { connection } => write!(f, " (fixed {})", connection.endpoint()),
            Addressing::Routable(r) if !r.adapter_id.is_empty() => {
                write!(f, " @ {}", r.adapter_id)
            }
            Addressing::Routable(r) => {
                for ep in &r.endpoints {
                    write!(f, " {}", ep)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({})", self)
    }
}
