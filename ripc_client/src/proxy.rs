use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use ripc_protocol::*;

use crate::{
    Connection, Invocation, InvocationFuture, LocatorService, Reference, RequestHandler,
    RequestHandlerCache, RouterService, SentCallback,
};

/// A handle on a remote object: a [`Reference`] plus the request handler
/// cache shared by its clones.
///
/// ```ignore
/// let proxy = Proxy::new(Reference::indirect(&instance, Identity::new("hello", ""), "HelloAdapter"));
/// let reply = proxy.invoke(proxy.request("sayHello")).await?;
/// ```
#[derive(Clone)]
pub struct Proxy {
    reference: Reference,
    cache: Arc<RequestHandlerCache>,
}

impl Proxy {
    pub fn new(reference: Reference) -> Self {
        Proxy {
            cache: Arc::new(RequestHandlerCache::new(reference.clone())),
            reference,
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn handler_cache(&self) -> &Arc<RequestHandlerCache> {
        &self.cache
    }

    /// A request for `operation` addressed to this proxy's identity, facet
    /// and context.
    pub fn request(&self, operation: &str) -> Request {
        let mut request = Request::new(self.reference.identity().clone(), operation);
        request.facet = self.reference.facet().to_owned();
        request.context = self.reference.context().clone();
        request
    }

    /// Starts an invocation. Batch proxies queue the request until
    /// [`Proxy::flush_batch_requests`] and complete at once.
    pub fn begin_invoke(&self, request: Request, sent: Option<SentCallback>) -> InvocationFuture {
        let reference = &self.reference;
        if reference.is_batch() {
            if let Some(queue) = reference.batch_queue() {
                queue.enqueue(request);
            }
            return InvocationFuture::completed(Ok(Reply::ok(Bytes::new())));
        }
        if let Err(err) = reference.instance().check_destroyed() {
            return InvocationFuture::completed(Err(err));
        }
        let mode = request.mode;
        Invocation::start(
            self.cache.clone(),
            vec![request],
            mode,
            reference.is_twoway(),
            sent,
        )
    }

    pub async fn invoke(&self, request: Request) -> Result<Reply> {
        self.begin_invoke(request, None).await
    }

    /// Invokes an operation that returns values, which needs a twoway proxy.
    pub async fn invoke_twoway(&self, request: Request) -> Result<Reply> {
        self.check_twoway_only(&request.operation)?;
        self.invoke(request).await
    }

    pub fn check_twoway_only(&self, operation: &str) -> Result<()> {
        if !self.reference.is_twoway() {
            return Err(Error::new(
                ErrorKind::TwowayOnly,
                format!("operation `{}' can only be invoked with a twoway proxy", operation),
            )
            .with_operation(operation));
        }
        Ok(())
    }

    /// Sends the requests queued by a batch proxy as one invocation.
    pub fn flush_batch_requests(&self) -> InvocationFuture {
        let requests = match self.reference.batch_queue() {
            Some(queue) => queue.swap(),
            None => Vec::new(),
        };
        if requests.is_empty() {
            return InvocationFuture::completed(Ok(Reply::ok(Bytes::new())));
        }
        if let Err(err) = self.reference.instance().check_destroyed() {
            return InvocationFuture::completed(Err(err));
        }
        Invocation::start(self.cache.clone(), requests, OperationMode::Normal, false, None)
    }

    /// The connection calls go out on, establishing it if needed. `None`
    /// for collocated targets.
    pub async fn connection(&self) -> Result<Option<Arc<dyn Connection>>> {
        let handler = self.cache.get_handler()?;
        match &handler {
            RequestHandler::Connecting(connecting) => match connecting.wait_for_connection().await {
                Ok(connection) => Ok(Some(connection)),
                Err(err) => {
                    self.cache.clear_if_matches(&handler);
                    Err(err)
                }
            },
            RequestHandler::Bound(bound) => Ok(Some(bound.connection().clone())),
            RequestHandler::Collocated(_) => Ok(None),
        }
    }

    /// The connection of the cached handler, without establishing one.
    pub fn cached_connection(&self) -> Option<Arc<dyn Connection>> {
        self.cache.cached().and_then(|handler| handler.connection())
    }

    fn derive(&self, reference: Reference) -> Proxy {
        if reference.ptr_eq(&self.reference) {
            self.clone()
        } else {
            Proxy::new(reference)
        }
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Proxy {
        self.derive(self.reference.change_mode(mode))
    }

    pub fn with_twoway(&self) -> Proxy {
        self.with_mode(InvocationMode::Twoway)
    }

    pub fn with_oneway(&self) -> Proxy {
        self.with_mode(InvocationMode::Oneway)
    }

    pub fn with_batch_oneway(&self) -> Proxy {
        self.with_mode(InvocationMode::BatchOneway)
    }

    pub fn with_identity(&self, identity: Identity) -> Proxy {
        self.derive(self.reference.change_identity(identity))
    }

    pub fn with_facet(&self, facet: &str) -> Proxy {
        self.derive(self.reference.change_facet(facet))
    }

    pub fn with_context(&self, context: Context) -> Proxy {
        self.derive(self.reference.change_context(context))
    }

    pub fn with_secure(&self, secure: bool) -> Proxy {
        self.derive(self.reference.change_secure(secure))
    }

    pub fn with_encoding(&self, encoding: EncodingVersion) -> Proxy {
        self.derive(self.reference.change_encoding(encoding))
    }

    pub fn with_invocation_timeout(&self, timeout_ms: i64) -> Proxy {
        self.derive(self.reference.change_invocation_timeout(timeout_ms))
    }

    pub fn with_compress(&self, compress: bool) -> Proxy {
        self.derive(self.reference.change_compress(compress))
    }

    pub fn with_adapter_id(&self, adapter_id: &str) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_adapter_id(adapter_id)?))
    }

    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_endpoints(endpoints)?))
    }

    pub fn with_locator(&self, locator: Option<Arc<dyn LocatorService>>) -> Result<Proxy> {
        let instance = self.reference.instance();
        let info = locator.map(|l| instance.locator_info(l));
        Ok(self.derive(self.reference.change_locator(info)?))
    }

    pub fn with_router(&self, router: Option<Arc<dyn RouterService>>) -> Result<Proxy> {
        let instance = self.reference.instance();
        let info = router.map(|r| instance.router_info(r));
        Ok(self.derive(self.reference.change_router(info)?))
    }

    pub fn with_collocation_optimized(&self, enabled: bool) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_collocation_optimized(enabled)?))
    }

    pub fn with_cache_connection(&self, enabled: bool) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_cache_connection(enabled)?))
    }

    pub fn with_prefer_secure(&self, prefer: bool) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_prefer_secure(prefer)?))
    }

    pub fn with_endpoint_selection(&self, selection: EndpointSelection) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_endpoint_selection(selection)?))
    }

    pub fn with_locator_cache_timeout(&self, ttl: i64) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_locator_cache_timeout(ttl)?))
    }

    pub fn with_connection_id(&self, connection_id: &str) -> Result<Proxy> {
        Ok(self.derive(self.reference.change_connection_id(connection_id)?))
    }

    /// A proxy for the same object bound to `connection`, keeping the
    /// invocation policy of this one.
    pub fn with_fixed(&self, connection: Arc<dyn Connection>) -> Proxy {
        let r = &self.reference;
        let fixed = Reference::fixed(r.instance(), r.identity().clone(), connection)
            .change_mode(r.mode())
            .change_facet(r.facet())
            .change_context(r.context().clone())
            .change_secure(r.secure())
            .change_encoding(r.encoding())
            .change_invocation_timeout(r.invocation_timeout());
        let fixed = match r.compress() {
            Some(compress) => fixed.change_compress(compress),
            None => fixed,
        };
        Proxy::new(fixed)
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Proxy) -> bool {
        self.reference == other.reference
    }
}

impl Eq for Proxy {}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reference, f)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy({})", self.reference)
    }
}
