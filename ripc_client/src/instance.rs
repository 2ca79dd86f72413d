use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use ripc_adapter::ObjectAdapterRegistry;
use ripc_protocol::{Error, ErrorKind, Result};

use crate::{
    ClientConfig, ConnectionEstablisher, LocatorInfo, LocatorManager, LocatorService, RetryQueue,
    RouterInfo, RouterManager, RouterService, TraceLevels,
};

/// Runs user-visible callbacks away from the engine's locks.
pub trait Executor: Send + Sync {
    fn execute(&self, f: Box<dyn FnOnce() + Send>);
}

/// Runs every callback as its own task on a tokio runtime.
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        TokioExecutor { handle }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, f: Box<dyn FnOnce() + Send>) {
        self.handle.spawn(async move { f() });
    }
}

/// Everything shared by the references and proxies of one client: its
/// configuration, collaborators and registries.
pub struct Instance {
    config: ClientConfig,
    retry_delays: Vec<Duration>,
    handle: Handle,
    executor: Arc<dyn Executor>,
    establisher: Arc<dyn ConnectionEstablisher>,
    adapters: Arc<ObjectAdapterRegistry>,
    locators: LocatorManager,
    routers: RouterManager,
    default_locator: Option<Arc<LocatorInfo>>,
    default_router: Option<Arc<RouterInfo>>,
    retry_queue: Arc<RetryQueue>,
    destroyed: AtomicBool,
    next_call_id: AtomicU64,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("config", &self.config)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Instance {
    pub fn builder(establisher: Arc<dyn ConnectionEstablisher>) -> InstanceBuilder {
        InstanceBuilder::new(establisher)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn trace(&self) -> TraceLevels {
        self.config.trace
    }

    pub fn retry_delays(&self) -> &[Duration] {
        &self.retry_delays
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn establisher(&self) -> &Arc<dyn ConnectionEstablisher> {
        &self.establisher
    }

    pub fn adapters(&self) -> &Arc<ObjectAdapterRegistry> {
        &self.adapters
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub fn default_locator(&self) -> Option<Arc<LocatorInfo>> {
        self.default_locator.clone()
    }

    pub fn default_router(&self) -> Option<Arc<RouterInfo>> {
        self.default_router.clone()
    }

    /// The shared resolver for `locator`.
    pub fn locator_info(&self, locator: Arc<dyn LocatorService>) -> Arc<LocatorInfo> {
        self.locators.get(locator)
    }

    /// The shared resolver for `router`.
    pub fn router_info(&self, router: Arc<dyn RouterService>) -> Arc<RouterInfo> {
        self.routers.get(router)
    }

    pub fn locators(&self) -> &LocatorManager {
        &self.locators
    }

    pub fn routers(&self) -> &RouterManager {
        &self.routers
    }

    pub(crate) fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn check_destroyed(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::new(
                ErrorKind::CommunicatorDestroyed,
                "the client instance is destroyed",
            ));
        }
        Ok(())
    }

    /// Fails pending retries, forgets resolver state and deactivates local
    /// adapters. New invocations fail with `CommunicatorDestroyed`.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("destroying client instance");
        self.retry_queue.destroy();
        self.routers.destroy();
        self.locators.destroy();
        self.adapters.destroy();
    }
}

pub struct InstanceBuilder {
    config: ClientConfig,
    establisher: Arc<dyn ConnectionEstablisher>,
    handle: Option<Handle>,
    executor: Option<Arc<dyn Executor>>,
    adapters: Option<Arc<ObjectAdapterRegistry>>,
    locator: Option<Arc<dyn LocatorService>>,
    router: Option<Arc<dyn RouterService>>,
}

impl InstanceBuilder {
    pub fn new(establisher: Arc<dyn ConnectionEstablisher>) -> Self {
        InstanceBuilder {
            config: ClientConfig::default(),
            establisher,
            handle: None,
            executor: None,
            adapters: None,
            locator: None,
            router: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn adapters(mut self, adapters: Arc<ObjectAdapterRegistry>) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Locator given to every reference created from the instance.
    pub fn default_locator(mut self, locator: Arc<dyn LocatorService>) -> Self {
        self.locator = Some(locator);
        self
    }

    /// Router given to every reference created from the instance.
    pub fn default_router(mut self, router: Arc<dyn RouterService>) -> Self {
        self.router = Some(router);
        self
    }

    /// Fails with `InvalidArgument` when no runtime handle was given and the
    /// builder is not running inside a tokio runtime.
    pub fn build(self) -> Result<Arc<Instance>> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|err| Error::new(ErrorKind::InvalidArgument, err.to_string()))?,
        };
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(TokioExecutor::new(handle.clone())));
        let trace = self.config.trace;
        let locators =
            LocatorManager::new(self.config.background_locator_cache_updates, trace.locator);
        let routers = RouterManager::new();
        let default_locator = self.locator.map(|l| locators.get(l));
        let default_router = self.router.map(|r| routers.get(r));

        Ok(Arc::new(Instance {
            retry_delays: self.config.retry_delays(),
            retry_queue: Arc::new(RetryQueue::new(handle.clone(), trace.retry)),
            config: self.config,
            handle,
            executor,
            establisher: self.establisher,
            adapters: self.adapters.unwrap_or_default(),
            locators,
            routers,
            default_locator,
            default_router,
            destroyed: AtomicBool::new(false),
            next_call_id: AtomicU64::new(1),
        }))
    }
}
