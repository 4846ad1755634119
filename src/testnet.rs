//! In-process network of [Dht] nodes, for tests and simulations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::trace;

use crate::common::Contact;
use crate::dht::{DhtBuilder, WeakDht};
use crate::rpc::{Transport, TransportError};
use crate::{Dht, Result};

/// Create a testnet of Dht nodes, talking over an in-memory [MemoryNetwork].
///
/// Every node bootstraps through the first one.
#[derive(Debug)]
pub struct Testnet {
    pub bootstrap: Vec<Contact>,
    pub nodes: Vec<Dht>,
    network: MemoryNetwork,
}

impl Testnet {
    /// Create `count` nodes with default settings.
    pub fn new(count: usize) -> Result<Testnet> {
        Testnet::with_builder(count, Dht::builder)
    }

    /// Create `count` nodes, each configured by a fresh builder from `builder`.
    pub fn with_builder<F>(count: usize, builder: F) -> Result<Testnet>
    where
        F: Fn() -> DhtBuilder,
    {
        let network = MemoryNetwork::new();
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);
        let mut bootstrap = Vec::new();

        for _ in 0..count {
            let node = network.spawn(builder().bootstrap(&bootstrap))?;

            if bootstrap.is_empty() {
                bootstrap.push(node.local_contact().clone());
            }

            nodes.push(node)
        }

        Ok(Testnet {
            bootstrap,
            nodes,
            network,
        })
    }

    // === Getters ===

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    // === Public Methods ===

    /// Add a node to this testnet's network, without bootstrapping it unless
    /// the builder says so.
    pub fn spawn(&self, builder: DhtBuilder) -> Result<Dht> {
        self.network.spawn(builder)
    }
}

#[derive(Debug)]
struct Endpoint {
    dht: WeakDht,
    offline: bool,
}

/// Registry of in-process nodes by address.
///
/// Deliveries run on their own thread, so a node never blocks on its peers.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<SocketAddr, Endpoint>>>,
    next_port: Arc<AtomicU16>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            next_port: Arc::new(AtomicU16::new(1)),
        }
    }

    // === Public Methods ===

    /// Build a node on this network, then bootstrap it if the builder has
    /// bootstrap contacts.
    pub fn spawn(&self, mut builder: DhtBuilder) -> Result<Dht> {
        let bootstrap = builder.take_bootstrap();
        let address = self.allocate();

        let transport = MemoryTransport {
            network: self.clone(),
            local: address,
        };
        let dht = builder
            .address(address)
            .build_with_transport(Arc::new(transport));

        self.endpoints().insert(
            address,
            Endpoint {
                dht: dht.downgrade(),
                offline: false,
            },
        );

        if !bootstrap.is_empty() {
            dht.bootstrap(&bootstrap);
        }

        Ok(dht)
    }

    /// Silently drop every message to and from `address`.
    pub fn set_offline(&self, address: SocketAddr, offline: bool) {
        if let Some(endpoint) = self.endpoints().get_mut(&address) {
            endpoint.offline = offline;
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Private Methods ===

    fn allocate(&self) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);

        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Returns the registered node at `address`, `Ok(None)` if it is offline.
    fn resolve(&self, address: SocketAddr) -> Result<Option<Dht>, TransportError> {
        let endpoints = self.endpoints();
        let endpoint = endpoints
            .get(&address)
            .ok_or(TransportError::Unreachable(address))?;

        if endpoint.offline {
            return Ok(None);
        }

        endpoint
            .dht
            .upgrade()
            .map(Some)
            .ok_or(TransportError::Unreachable(address))
    }

    fn endpoints(&self) -> MutexGuard<'_, HashMap<SocketAddr, Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// [Transport] of one node on a [MemoryNetwork].
#[derive(Debug)]
struct MemoryTransport {
    network: MemoryNetwork,
    local: SocketAddr,
}

impl Transport for MemoryTransport {
    fn send(&self, to: SocketAddr, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.network.resolve(self.local)?.is_none() {
            trace!(context = "testnet", from = ?self.local, "Sender is offline");
            return Ok(());
        }

        let target = match self.network.resolve(to)? {
            Some(target) => target,
            None => {
                trace!(context = "testnet", ?to, "Dropping message to offline node");
                return Ok(());
            }
        };

        let network = self.network.clone();
        let from = self.local;

        thread::Builder::new()
            .name("kadnode testnet delivery".to_string())
            .spawn(move || {
                let reply = match target.handle_incoming(&bytes) {
                    Some(reply) => reply,
                    None => return,
                };

                if let Ok(Some(origin)) = network.resolve(from) {
                    origin.handle_incoming(&reply);
                }
            })?;

        Ok(())
    }
}
