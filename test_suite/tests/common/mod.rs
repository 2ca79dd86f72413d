//! In-memory collaborators for the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use ripc::*;

/// How a [`MockConnection`] treats a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Writes the request and replies with its payload.
    Echo,
    /// Writes the request and replies with the given status.
    Status(ReplyStatus),
    /// Writes the request and never replies.
    Hold,
    /// Writes the request, then loses the connection with this error.
    FailAfterSend(ErrorKind),
    /// Refuses the request before writing anything.
    FailBeforeSend(ErrorKind),
}

pub struct MockConnection {
    endpoint: Endpoint,
    active: AtomicBool,
    default: Mutex<Behavior>,
    script: Mutex<VecDeque<Behavior>>,
    log: Mutex<Vec<Vec<String>>>,
    pending: Mutex<HashMap<u64, Arc<dyn OutgoingCall>>>,
}

impl MockConnection {
    pub fn new(endpoint: Endpoint, behavior: Behavior) -> Self {
        MockConnection {
            endpoint,
            active: AtomicBool::new(true),
            default: Mutex::new(behavior),
            script: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.default.lock().unwrap() = behavior;
    }

    /// Behaviors used, in order, for the next requests.
    pub fn script(&self, behaviors: Vec<Behavior>) {
        self.script.lock().unwrap().extend(behaviors);
    }

    /// The operations of each written call, in write order.
    pub fn log(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().clone()
    }

    pub fn sends(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// The connection dies: later requests must go elsewhere.
    pub fn kill(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn next_behavior(&self) -> Behavior {
        match self.script.lock().unwrap().pop_front() {
            Some(behavior) => behavior,
            None => self.default.lock().unwrap().clone(),
        }
    }
}

impl Connection for MockConnection {
    fn send_request(&self, call: Arc<dyn OutgoingCall>, _compress: bool, response: bool) -> SendOutcome {
        if !self.is_active() {
            return SendOutcome::RetryNeeded(Error::new(
                ErrorKind::ConnectionLost,
                format!("connection to `{}' is closed", self.endpoint),
            ));
        }
        let behavior = self.next_behavior();
        if let Behavior::FailBeforeSend(kind) = behavior {
            return SendOutcome::Failed(kind.into());
        }

        self.log.lock().unwrap().push(
            call.requests()
                .iter()
                .map(|r| r.operation.clone())
                .collect(),
        );
        let invoke_sent_callback = call.sent();

        match behavior {
            Behavior::Echo if response => {
                let payload = call.requests()[0].payload.clone();
                tokio::spawn(async move { call.response(Reply::ok(payload)) });
            }
            Behavior::Status(status) if response => {
                tokio::spawn(async move {
                    call.response(Reply {
                        status,
                        payload: bytes::Bytes::new(),
                    })
                });
            }
            Behavior::FailAfterSend(kind) => {
                tokio::spawn(async move { call.exception(kind.into()) });
            }
            Behavior::Hold if response => {
                self.pending.lock().unwrap().insert(call.id(), call);
            }
            _ => {}
        }
        SendOutcome::Sent {
            invoke_sent_callback,
        }
    }

    fn request_canceled(&self, call: &Arc<dyn OutgoingCall>, reason: Error) {
        let removed = self.pending.lock().unwrap().remove(&call.id());
        if let Some(call) = removed {
            call.exception(reason);
        }
    }

    fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().unwrap().drain().map(|(_, c)| c).collect();
        for call in pending {
            call.exception(ErrorKind::ConnectionManuallyClosed.into());
        }
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Hands out one [`MockConnection`] per endpoint, replacing dead ones.
pub struct MockEstablisher {
    behavior: Behavior,
    connections: Mutex<HashMap<String, Arc<MockConnection>>>,
    refused: Mutex<HashSet<String>>,
    connects: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockEstablisher {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(MockEstablisher {
            behavior,
            connections: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
            connects: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    /// Connection attempts made so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connection(&self, endpoint: &Endpoint) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().get(&endpoint.to_string()).cloned()
    }

    pub fn refuse(&self, endpoint: &Endpoint) {
        self.refused.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn accept(&self, endpoint: &Endpoint) {
        self.refused.lock().unwrap().remove(&endpoint.to_string());
    }

    /// Makes connection attempts wait until [`MockEstablisher::open`].
    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(1);
        }
    }
}

#[async_trait]
impl ConnectionEstablisher for MockEstablisher {
    async fn connect(&self, endpoints: &[Endpoint], _has_more: bool) -> Result<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }

        for endpoint in endpoints {
            let key = endpoint.to_string();
            if self.refused.lock().unwrap().contains(&key) {
                continue;
            }
            let mut connections = self.connections.lock().unwrap();
            let connection = connections
                .entry(key)
                .or_insert_with(|| Arc::new(MockConnection::new(endpoint.clone(), self.behavior.clone())));
            if !connection.is_active() {
                *connection = Arc::new(MockConnection::new(endpoint.clone(), self.behavior.clone()));
            }
            let connection: Arc<dyn Connection> = connection.clone();
            return Ok(connection);
        }
        Err(Error::new(ErrorKind::ConnectFailed, "connection refused"))
    }
}

/// A locator answering from in-memory tables and counting the lookups.
pub struct MockLocator {
    adapters: Mutex<HashMap<String, Vec<Endpoint>>>,
    objects: Mutex<HashMap<Identity, ObjectLocation>>,
    adapter_lookups: AtomicUsize,
    object_lookups: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockLocator {
    pub fn new() -> Arc<Self> {
        Arc::new(MockLocator {
            adapters: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            adapter_lookups: AtomicUsize::new(0),
            object_lookups: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    pub fn add_adapter(&self, adapter_id: &str, endpoints: Vec<Endpoint>) {
        self.adapters.lock().unwrap().insert(adapter_id.to_owned(), endpoints);
    }

    pub fn add_object(&self, identity: Identity, location: ObjectLocation) {
        self.objects.lock().unwrap().insert(identity, location);
    }

    pub fn adapter_lookups(&self) -> usize {
        self.adapter_lookups.load(Ordering::SeqCst)
    }

    pub fn object_lookups(&self) -> usize {
        self.object_lookups.load(Ordering::SeqCst)
    }

    pub fn hold(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(1);
        }
    }

    async fn wait(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
    }
}

#[async_trait]
impl LocatorService for MockLocator {
    fn identity(&self) -> Identity {
        Identity::new("Locator", "DemoGrid")
    }

    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<Vec<Endpoint>>> {
        self.adapter_lookups.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        Ok(self.adapters.lock().unwrap().get(adapter_id).cloned())
    }

    async fn find_object_by_id(&self, identity: &Identity) -> Result<Option<ObjectLocation>> {
        self.object_lookups.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        Ok(self.objects.lock().unwrap().get(identity).cloned())
    }
}

/// A router with a routing table that records registrations.
pub struct MockRouter {
    client_endpoints: Vec<Endpoint>,
    added: Mutex<Vec<Identity>>,
    add_calls: AtomicUsize,
    failures: Mutex<VecDeque<Error>>,
}

impl MockRouter {
    pub fn new(client_endpoints: Vec<Endpoint>) -> Arc<Self> {
        Arc::new(MockRouter {
            client_endpoints,
            added: Mutex::new(Vec::new()),
            add_calls: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn added(&self) -> Vec<Identity> {
        self.added.lock().unwrap().clone()
    }

    /// The next registration fails with `err`.
    pub fn fail_next_add(&self, err: Error) {
        self.failures.lock().unwrap().push_back(err);
    }
}

#[async_trait]
impl RouterService for MockRouter {
    fn identity(&self) -> Identity {
        Identity::new("router", "Glacier")
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.client_endpoints.clone()
    }

    async fn get_client_proxy(&self) -> Result<ClientProxy> {
        Ok(ClientProxy {
            endpoints: Some(self.client_endpoints.clone()),
            has_routing_table: Some(true),
        })
    }

    async fn get_server_proxy(&self) -> Result<Option<Vec<Endpoint>>> {
        Ok(None)
    }

    async fn add_proxies(&self, proxies: Vec<Reference>) -> Result<Vec<Identity>> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut added = self.added.lock().unwrap();
        added.extend(proxies.iter().map(|p| p.identity().clone()));
        Ok(Vec::new())
    }
}

pub fn config(retry_intervals: Vec<i64>) -> ClientConfig {
    ClientConfig {
        retry_intervals,
        ..Default::default()
    }
}

pub fn instance(establisher: &Arc<MockEstablisher>, config: ClientConfig) -> Arc<Instance> {
    Instance::builder(establisher.clone())
        .config(config)
        .build()
        .unwrap()
}

pub fn hello() -> Identity {
    Identity::new("hello", "")
}

pub fn direct_proxy(instance: &Arc<Instance>, endpoint: Endpoint) -> Proxy {
    Proxy::new(Reference::direct(instance, hello(), vec![endpoint]))
}

/// Yields until `cond` holds, letting spawned tasks make progress.
pub async fn until<F: Fn() -> bool>(cond: F) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
