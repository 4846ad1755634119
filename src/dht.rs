//! Dht node.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::common::{
    Contact, Id, Insertion, Message, MessageType, RequestSpecific, ResponseSpecific,
    ResponseTypeSpecific, RoutingTable, Status, StoreRequestArguments, StoreResponseArguments,
};
use crate::rpc::iterative_query::{self, LookupParams, Probe};
use crate::rpc::{
    server, udp, CancellationToken, Config, NodeLookup, Rpc, Transport, ValueLookup,
};
use crate::store::{MemoryStore, Storage};
use crate::{Error, Result};

#[derive(Debug, Clone)]
/// Kademlia Dht node.
///
/// Cheap to clone, every clone drives the same node.
pub struct Dht {
    inner: Arc<Node>,
}

#[derive(Debug)]
struct Node {
    routing_table: RoutingTable,
    rpc: Rpc,
    storage: Box<dyn Storage>,
    alpha: usize,
    cache_lookups: bool,
    /// Stale contacts currently being pinged before a possible eviction.
    probing: Mutex<HashSet<Id>>,
    shutdown: AtomicBool,
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new Dht node listening on a UDP socket, with default settings.
    pub fn client() -> Result<Self> {
        Dht::builder().build()
    }

    fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let id = config.id.unwrap_or_else(Id::random);
        let local = Contact::new(id, config.address);

        let routing_table = RoutingTable::new(id)
            .with_k(config.k)
            .with_failure_threshold(config.failure_threshold);

        info!(?id, address = ?config.address, "Starting Dht node");

        Dht {
            inner: Arc::new(Node {
                routing_table,
                rpc: Rpc::new(local, transport, config.request_timeout),
                storage: config
                    .storage
                    .unwrap_or_else(|| Box::new(MemoryStore::default())),
                alpha: config.alpha.max(1),
                cache_lookups: config.cache_lookups,
                probing: Mutex::new(HashSet::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    // === Getters ===

    /// Returns this node's [Id].
    pub fn id(&self) -> &Id {
        self.inner.routing_table.id()
    }

    /// This node as advertised to its peers.
    pub fn local_contact(&self) -> &Contact {
        self.inner.rpc.local()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.routing_table
    }

    pub fn storage(&self) -> &dyn Storage {
        self.inner.storage.as_ref()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Returns a summary of this node's information and statistics.
    pub fn info(&self) -> Info {
        Info {
            id: *self.id(),
            address: self.local_contact().address(),
            contacts: self.inner.routing_table.len(),
            inflight_requests: self.inner.rpc.inflight_count(),
            k: self.inner.routing_table.k(),
            alpha: self.inner.alpha,
        }
    }

    // === Public Methods ===

    /// Stop answering and sending messages.
    ///
    /// Requests still pending resolve with their timeout.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        debug!(id = ?self.id(), "Dht node shutdown");
    }

    /// Send a request and block until its response, folding the outcome into
    /// the routing table.
    ///
    /// A response refreshes (or inserts) the contact, a timeout or error counts
    /// as one failed probe.
    pub fn send_request(
        &self,
        contact: &Contact,
        request: RequestSpecific,
    ) -> Result<ResponseSpecific> {
        if self.is_shutdown() {
            return Err(Error::DhtWasShutdown);
        }

        let rpc = &self.inner.rpc;
        let result = rpc.request(contact, request).and_then(|pending| rpc.wait(pending));

        match &result {
            Ok(_) => self.observe(contact.clone()),
            Err(error) => {
                let failed = self.inner.routing_table.mark_failed(contact.id());
                debug!(?error, to = ?contact.id(), ?failed, "Request failed");
            }
        }

        result
    }

    /// Handle one encoded message from the transport, returning the encoded
    /// response if it was a request.
    ///
    /// Undecodable messages are dropped. If a malformed response still carries
    /// a known correlation id, the waiting request fails with [Error::MalformedMessage].
    pub fn handle_incoming(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        if self.is_shutdown() {
            return None;
        }

        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!(
                    context = "incoming_error",
                    ?error,
                    message = ?String::from_utf8_lossy(bytes),
                    "Dropping invalid message"
                );

                if matches!(error, Error::MalformedMessage(_)) {
                    if let Some((correlation_id, from)) = Message::peek_response_id(bytes) {
                        self.inner.rpc.fail(&correlation_id, &from, error);
                    }
                }

                return None;
            }
        };

        match message.message_type {
            MessageType::Request(request) => {
                trace!(context = "incoming_request", ?request, from = ?message.sender);

                let requester = *message.sender.id();
                if requester == *self.id() {
                    trace!(context = "incoming_validation", "Request claims our own id");
                    return None;
                }
                self.observe(message.sender);

                let ResponseSpecific {
                    status,
                    response_type,
                } = server::handle_request(
                    &self.inner.routing_table,
                    self.storage(),
                    &requester,
                    &request,
                );

                let response = Message::response(
                    message.transaction_id,
                    self.local_contact().clone(),
                    status,
                    response_type,
                );

                match response.to_bytes() {
                    Ok(bytes) => Some(bytes),
                    Err(error) => {
                        debug!(?error, "Failed to encode response");
                        None
                    }
                }
            }
            MessageType::Response(_) => {
                self.inner.rpc.handle_response(message);
                None
            }
        }
    }

    /// Ping a contact.
    pub fn ping(&self, contact: &Contact) -> Result<()> {
        self.send_request(contact, RequestSpecific::Ping)?;

        Ok(())
    }

    /// Ask a contact to store `value` under `key`, or delete the key if `value` is `None`.
    ///
    /// Returns the value it replaced.
    pub fn store(&self, contact: &Contact, key: &str, value: Option<String>) -> Result<Option<String>> {
        let response = self.send_request(
            contact,
            RequestSpecific::Store(StoreRequestArguments {
                key: key.to_string(),
                value,
            }),
        )?;

        match response {
            ResponseSpecific {
                status: Status::Ok,
                response_type:
                    ResponseTypeSpecific::StoreAck(StoreResponseArguments { previous_value }),
            } => Ok(previous_value),
            ResponseSpecific { status, .. } => Err(Error::Rejected(status)),
        }
    }

    /// Find the k closest responding nodes to `target`.
    pub fn find_node(&self, target: Id) -> NodeLookup {
        self.find_node_with(target, &CancellationToken::new())
    }

    /// Same as [Self::find_node], abortable through `cancel`.
    pub fn find_node_with(&self, target: Id, cancel: &CancellationToken) -> NodeLookup {
        let seed = self
            .inner
            .routing_table
            .closest_contacts(&target, self.inner.routing_table.k());

        iterative_query::find_node(target, seed, self.as_probe(), self.lookup_params(), cancel)
    }

    /// Look for the value stored under `key` across the network.
    pub fn find_value(&self, key: &str) -> ValueLookup {
        self.find_value_with(key, &CancellationToken::new())
    }

    /// Same as [Self::find_value], abortable through `cancel`.
    pub fn find_value_with(&self, key: &str, cancel: &CancellationToken) -> ValueLookup {
        let seed = self
            .inner
            .routing_table
            .closest_contacts(&Id::from_key(key), self.inner.routing_table.k());

        let lookup =
            iterative_query::find_value(key, seed, self.as_probe(), self.lookup_params(), cancel);

        if self.inner.cache_lookups {
            if let ValueLookup::Found {
                value,
                closest_without_value,
                ..
            } = &lookup
            {
                if let Some(closest) = closest_without_value.first() {
                    if let Err(error) = self.store(closest, key, Some(value.clone())) {
                        debug!(?error, ?key, to = ?closest.id(), "Failed to cache value");
                    }
                }
            }
        }

        lookup
    }

    /// Store `value` at the k closest nodes to `key`.
    ///
    /// Returns the contacts that acknowledged the store.
    pub fn put(&self, key: &str, value: String) -> Result<Vec<Contact>> {
        if self.is_shutdown() {
            return Err(Error::DhtWasShutdown);
        }

        let closest = match self.find_node(Id::from_key(key)) {
            NodeLookup::Completed(contacts) => contacts,
            NodeLookup::EmptyRoutingTable => {
                debug!(?key, "Put found no nodes to store at");
                return Ok(Vec::new());
            }
            NodeLookup::Cancelled => return Ok(Vec::new()),
        };

        let stored = thread::scope(|scope| {
            let handles: Vec<_> = closest
                .iter()
                .map(|contact| {
                    let value = value.clone();
                    scope.spawn(move || (contact, self.store(contact, key, Some(value))))
                })
                .collect();

            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .filter_map(|(contact, result)| match result {
                    Ok(_) => Some(contact.clone()),
                    Err(error) => {
                        debug!(?error, ?key, to = ?contact.id(), "Put store failed");
                        None
                    }
                })
                .collect::<Vec<_>>()
        });

        debug!(?key, stored = stored.len(), "Put done");

        Ok(stored)
    }

    /// Read `key` from local storage, or from the network.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        if self.is_shutdown() {
            return Err(Error::DhtWasShutdown);
        }

        if let Some(value) = self.storage().get(key)? {
            return Ok(Some(value));
        }

        Ok(self.find_value(key).value().map(String::from))
    }

    /// Join the network through known contacts.
    ///
    /// Pings every seed, then looks up our own id to fill the routing table.
    /// Returns true if the routing table is no longer empty.
    pub fn bootstrap(&self, seeds: &[Contact]) -> bool {
        thread::scope(|scope| {
            for seed in seeds.iter().filter(|seed| seed.id() != self.id()) {
                scope.spawn(move || {
                    if let Err(error) = self.ping(seed) {
                        debug!(?error, seed = ?seed.address(), "Bootstrap seed did not answer");
                    }
                });
            }
        });

        let lookup = self.find_node(*self.id());
        let bootstrapped = !self.inner.routing_table.is_empty();

        info!(
            id = ?self.id(),
            contacts = self.inner.routing_table.len(),
            closest = lookup.contacts().len(),
            bootstrapped,
            "Bootstrap done"
        );

        bootstrapped
    }

    // === Private Methods ===

    pub(crate) fn downgrade(&self) -> WeakDht {
        WeakDht(Arc::downgrade(&self.inner))
    }

    fn lookup_params(&self) -> LookupParams {
        LookupParams {
            local_id: *self.id(),
            k: self.inner.routing_table.k(),
            alpha: self.inner.alpha,
        }
    }

    fn as_probe(&self) -> Arc<dyn Probe> {
        Arc::new(self.clone())
    }

    /// Fold a contact we heard from into the routing table.
    fn observe(&self, contact: Contact) {
        match self.inner.routing_table.insert_or_refresh(contact.clone()) {
            Ok(Insertion::BucketFull { least_recently_seen }) => {
                self.probe_stale(least_recently_seen, contact)
            }
            Ok(_) => {}
            Err(error) => trace!(context = "routing_table", ?error, "Ignoring contact"),
        }
    }

    /// Ping the least recently seen contact of a full bucket off thread, and
    /// replace it with `candidate` if it does not answer.
    fn probe_stale(&self, stale: Contact, candidate: Contact) {
        let stale_id = *stale.id();

        if !self.probing().insert(stale_id) {
            return;
        }

        let dht = self.clone();
        let spawned = thread::Builder::new()
            .name("kadnode bucket probe".to_string())
            .spawn(move || {
                if dht.ping(&stale).is_err()
                    && dht.inner.routing_table.replace(stale.id(), candidate.clone())
                {
                    debug!(evicted = ?stale.id(), inserted = ?candidate.id(), "Replaced unresponsive contact");
                }

                dht.probing().remove(stale.id());
            });

        if let Err(error) = spawned {
            debug!(?error, "Could not spawn bucket probe");
            self.probing().remove(&stale_id);
        }
    }

    fn probing(&self) -> MutexGuard<'_, HashSet<Id>> {
        self.inner
            .probing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Probe for Dht {
    fn probe(&self, contact: &Contact, request: RequestSpecific) -> Result<ResponseSpecific> {
        self.send_request(contact, request)
    }
}

/// Handle on a [Dht] that does not keep it alive.
#[derive(Debug, Clone)]
pub(crate) struct WeakDht(Weak<Node>);

impl WeakDht {
    pub(crate) fn upgrade(&self) -> Option<Dht> {
        self.0.upgrade().map(|inner| Dht { inner })
    }
}

#[derive(Debug, Default)]
/// Create a [Dht] node with custom settings.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set this node's Id instead of a random one.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);

        self
    }

    /// Address to bind (UDP) and advertise.
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.0.address = address;

        self
    }

    /// Maximum contacts per bucket, and size of lookup results.
    pub fn k(mut self, k: usize) -> Self {
        self.0.k = k;

        self
    }

    /// Concurrent probes per lookup round, at least 1.
    pub fn alpha(mut self, alpha: usize) -> Self {
        self.0.alpha = alpha.max(1);

        self
    }

    /// Set the request timeout.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Consecutive failed probes after which a contact may be evicted.
    pub fn failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.0.failure_threshold = failure_threshold;

        self
    }

    /// Store found values at the closest responder that lacked them.
    pub fn cache_lookups(mut self, cache_lookups: bool) -> Self {
        self.0.cache_lookups = cache_lookups;

        self
    }

    /// Set bootstrapping contacts.
    pub fn bootstrap(mut self, bootstrap: &[Contact]) -> Self {
        self.0.bootstrap = bootstrap.to_vec();

        self
    }

    /// Set the storage answering `store` and `findValue` requests.
    pub fn storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.0.storage = Some(storage);

        self
    }

    pub(crate) fn take_bootstrap(&mut self) -> Vec<Contact> {
        std::mem::take(&mut self.0.bootstrap)
    }

    /// Bind a UDP socket at the configured address, start listening and bootstrap.
    pub fn build(mut self) -> Result<Dht> {
        let bootstrap = self.take_bootstrap();

        let socket = UdpSocket::bind(self.0.address)?;
        let address = socket.local_addr()?;

        let transport = udp::UdpTransport::new(socket.try_clone()?);
        let dht = self.address(address).build_with_transport(Arc::new(transport));

        udp::listen(socket, dht.downgrade())?;

        if !bootstrap.is_empty() {
            dht.bootstrap(&bootstrap);
        }

        Ok(dht)
    }

    /// Create a node sending through a custom transport.
    ///
    /// The transport must hand every message addressed to this node to
    /// [Dht::handle_incoming], and deliver what it returns back to the sender.
    /// Bootstrap contacts are not contacted, call [Dht::bootstrap] once the
    /// transport delivers to the node.
    pub fn build_with_transport(self, transport: Arc<dyn Transport>) -> Dht {
        Dht::new(self.0, transport)
    }
}

/// Information and statistics about a [Dht] node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    address: SocketAddr,
    contacts: usize,
    inflight_requests: usize,
    k: usize,
    alpha: usize,
}

impl Info {
    /// This node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }
    /// Address advertised to other nodes.
    pub fn address(&self) -> SocketAddr {
        self.address
    }
    /// Number of contacts in the routing table.
    pub fn contacts(&self) -> usize {
        self.contacts
    }
    /// Requests waiting for a response.
    pub fn inflight_requests(&self) -> usize {
        self.inflight_requests
    }
    pub fn k(&self) -> usize {
        self.k
    }
    pub fn alpha(&self) -> usize {
        self.alpha
    }
}
