//! Iterative lookups walking the network towards a target.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::{RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::common::{
    ClosestContacts, Contact, Distance, FindNodeRequestArguments, FindValueRequestArguments, Id,
    NodesResponseArguments, RequestSpecific, ResponseSpecific, ResponseTypeSpecific,
    ValueResponseArguments,
};
use crate::Result;

/// How often a lookup waiting on probes checks for cancellation.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared flag aborting one or more lookups.
///
/// Probes already in flight run to completion, their results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Sends one lookup request to a contact and blocks for its response.
///
/// Implementations fold the outcome into the routing table: refresh the
/// contact on success, count a failed probe otherwise.
pub trait Probe: Send + Sync {
    fn probe(&self, contact: &Contact, request: RequestSpecific) -> Result<ResponseSpecific>;
}

/// Parameters shared by every lookup a node runs.
#[derive(Debug, Clone, Copy)]
pub struct LookupParams {
    /// Never probed, and dropped from learned contacts.
    pub local_id: Id,
    /// Size of the result and of the frontier considered each round.
    pub k: usize,
    /// Probes issued concurrently per round.
    pub alpha: usize,
}

/// Result of a `findNode` lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLookup {
    /// Up to k responding contacts, closest first.
    Completed(Vec<Contact>),
    /// There was nobody to ask.
    EmptyRoutingTable,
    Cancelled,
}

impl NodeLookup {
    /// Contacts found, empty unless the lookup completed.
    pub fn contacts(&self) -> &[Contact] {
        match self {
            NodeLookup::Completed(contacts) => contacts,
            _ => &[],
        }
    }
}

/// Result of a `findValue` lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueLookup {
    Found {
        value: String,
        /// The contact that returned the value.
        from: Contact,
        /// Closest responders that did not hold the value, closest first.
        closest_without_value: Vec<Contact>,
    },
    /// Searched to convergence, these are the closest responders.
    NotFound(Vec<Contact>),
    /// There was nobody to ask.
    EmptyRoutingTable,
    Cancelled,
}

impl ValueLookup {
    pub fn value(&self) -> Option<&str> {
        match self {
            ValueLookup::Found { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Iteratively find the k closest contacts to `target`.
pub fn find_node(
    target: Id,
    seed: Vec<Contact>,
    probe: Arc<dyn Probe>,
    params: LookupParams,
    cancel: &CancellationToken,
) -> NodeLookup {
    let mut query = IterativeQuery::new(
        target,
        RequestSpecific::FindNode(FindNodeRequestArguments { target }),
        params,
    );

    match query.run(seed, &probe, cancel) {
        Traversal::Exhausted | Traversal::Found { .. } => {
            NodeLookup::Completed(query.closest_responders())
        }
        Traversal::EmptyRoutingTable => NodeLookup::EmptyRoutingTable,
        Traversal::Cancelled => NodeLookup::Cancelled,
    }
}

/// Iteratively look for the value stored under `key`.
pub fn find_value(
    key: &str,
    seed: Vec<Contact>,
    probe: Arc<dyn Probe>,
    params: LookupParams,
    cancel: &CancellationToken,
) -> ValueLookup {
    let mut query = IterativeQuery::new(
        Id::from_key(key),
        RequestSpecific::FindValue(FindValueRequestArguments {
            key: key.to_string(),
        }),
        params,
    );

    match query.run(seed, &probe, cancel) {
        Traversal::Found { value, from } => ValueLookup::Found {
            value,
            from,
            closest_without_value: query.closest_responders(),
        },
        Traversal::Exhausted => ValueLookup::NotFound(query.closest_responders()),
        Traversal::EmptyRoutingTable => ValueLookup::EmptyRoutingTable,
        Traversal::Cancelled => ValueLookup::Cancelled,
    }
}

/// How a traversal ended.
#[derive(Debug)]
enum Traversal {
    /// Every candidate among the k closest was contacted.
    Exhausted,
    Found { value: String, from: Contact },
    EmptyRoutingTable,
    Cancelled,
}

/// State of one lookup, owned by the coordinating thread.
///
/// Probes run on their own threads and report back through a channel, so
/// the frontier and the contacted set have a single writer.
#[derive(Debug)]
struct IterativeQuery {
    request: RequestSpecific,
    params: LookupParams,
    /// Known candidates by distance, failed probes removed.
    candidates: ClosestContacts,
    /// Everyone a probe was dispatched to.
    contacted: HashSet<Id>,
    /// Contacts that answered without a value.
    responders: ClosestContacts,
}

impl IterativeQuery {
    fn new(target: Id, request: RequestSpecific, params: LookupParams) -> Self {
        trace!(?target, ?request, "New lookup");

        Self {
            request,
            params,
            candidates: ClosestContacts::new(target),
            contacted: HashSet::new(),
            responders: ClosestContacts::new(target),
        }
    }

    // === Getters ===

    fn target(&self) -> Id {
        self.candidates.target()
    }

    fn closest_responders(&self) -> Vec<Contact> {
        self.responders
            .contacts()
            .iter()
            .take(self.params.k)
            .cloned()
            .collect()
    }

    fn closest_distance(&self) -> Option<Distance> {
        self.candidates
            .contacts()
            .first()
            .map(|contact| contact.id().distance(&self.target()))
    }

    // === Private Methods ===

    fn run(
        &mut self,
        seed: Vec<Contact>,
        probe: &Arc<dyn Probe>,
        cancel: &CancellationToken,
    ) -> Traversal {
        if cancel.is_cancelled() {
            return Traversal::Cancelled;
        }

        for contact in seed {
            self.learn(contact);
        }

        if self.candidates.is_empty() {
            debug!(target = ?self.target(), "Lookup has no contacts to start from");
            return Traversal::EmptyRoutingTable;
        }

        let (sender, receiver) = flume::unbounded();
        // After a round without progress, probe all remaining closest k at once.
        let mut exhaustive = false;

        loop {
            let closest_before = self.closest_distance();
            let width = if exhaustive {
                self.params.k
            } else {
                self.params.alpha
            };

            let batch = self.next_batch(width);
            if batch.is_empty() {
                debug!(
                    target = ?self.target(),
                    contacted = self.contacted.len(),
                    responders = self.responders.len(),
                    "Done lookup"
                );
                return Traversal::Exhausted;
            }

            let mut outstanding = 0;
            for contact in batch {
                self.contacted.insert(*contact.id());
                if self.dispatch(probe, contact, &sender) {
                    outstanding += 1;
                }
            }

            while outstanding > 0 {
                match receiver.recv_timeout(CANCELLATION_POLL_INTERVAL) {
                    Ok((contact, result)) => {
                        outstanding -= 1;

                        if cancel.is_cancelled() {
                            return Traversal::Cancelled;
                        }
                        if let Some(found) = self.handle(contact, result) {
                            return found;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if cancel.is_cancelled() {
                            return Traversal::Cancelled;
                        }
                    }
                    // Unreachable while `sender` is alive.
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            exhaustive = match (closest_before, self.closest_distance()) {
                (Some(before), Some(after)) => after >= before,
                _ => true,
            };
        }
    }

    /// Up to `width` uncontacted candidates among the closest k.
    fn next_batch(&self, width: usize) -> Vec<Contact> {
        self.candidates
            .contacts()
            .iter()
            .take(self.params.k)
            .filter(|contact| !self.contacted.contains(contact.id()))
            .take(width)
            .cloned()
            .collect()
    }

    /// Probe a contact on its own thread, returns false if none could be spawned.
    fn dispatch(
        &mut self,
        probe: &Arc<dyn Probe>,
        contact: Contact,
        sender: &Sender<(Contact, Result<ResponseSpecific>)>,
    ) -> bool {
        let id = *contact.id();
        let probe = Arc::clone(probe);
        let sender = sender.clone();
        let request = self.request.clone();

        trace!(context = "lookup_probe", target = ?self.target(), to = ?id);

        let spawned = thread::Builder::new()
            .name("kadnode lookup probe".to_string())
            .spawn(move || {
                let result = probe.probe(&contact, request);
                // The lookup may be over already.
                let _ = sender.send((contact, result));
            });

        if let Err(error) = spawned {
            debug!(?error, to = ?id, "Could not spawn lookup probe");
            self.candidates.remove(&id);
            return false;
        }

        true
    }

    /// Fold one probe result into the frontier.
    fn handle(&mut self, contact: Contact, result: Result<ResponseSpecific>) -> Option<Traversal> {
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                debug!(context = "lookup_probe_failed", ?error, from = ?contact.id());
                self.candidates.remove(contact.id());
                return None;
            }
        };

        match response.response_type {
            ResponseTypeSpecific::Value(ValueResponseArguments {
                value: Some(value), ..
            }) => {
                debug!(target = ?self.target(), from = ?contact.id(), "Lookup found value");
                return Some(Traversal::Found {
                    value,
                    from: contact,
                });
            }
            ResponseTypeSpecific::Nodes(NodesResponseArguments { contacts }) => {
                trace!(context = "lookup_response", from = ?contact.id(), learned = contacts.len());

                for learned in contacts {
                    self.learn(learned);
                }
            }
            _ => {}
        }

        self.responders.add(contact);

        None
    }

    fn learn(&mut self, contact: Contact) {
        if contact.id() == &self.params.local_id || self.contacted.contains(contact.id()) {
            return;
        }

        self.candidates.add(contact);
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use rand::Rng;

    use super::*;
    use crate::common::RoutingTable;
    use crate::rpc::server::handle_request;
    use crate::store::{MemoryStore, Storage};
    use crate::Error;

    const K: usize = 8;
    /// Bucket capacity of mock nodes, large enough that they know their neighbourhood.
    const KNOWLEDGE: usize = 40;

    #[derive(Debug)]
    struct MockNode {
        contact: Contact,
        table: RoutingTable,
        storage: MemoryStore,
        offline: bool,
    }

    /// A network of nodes answering probes in process.
    #[derive(Debug)]
    struct MockNetwork {
        nodes: HashMap<Id, MockNode>,
        probes: AtomicUsize,
        max_delay_ms: u64,
    }

    impl MockNetwork {
        fn new(size: usize, max_delay_ms: u64) -> Self {
            let contacts: Vec<Contact> = (0..size).map(|_| Contact::random()).collect();

            let nodes = contacts
                .iter()
                .map(|contact| {
                    let table = RoutingTable::new(*contact.id()).with_k(KNOWLEDGE);
                    for other in contacts.iter().filter(|other| *other != contact) {
                        let _ = table.insert_or_refresh(other.clone());
                    }

                    let node = MockNode {
                        contact: contact.clone(),
                        table,
                        storage: MemoryStore::default(),
                        offline: false,
                    };

                    (*contact.id(), node)
                })
                .collect();

            Self {
                nodes,
                probes: AtomicUsize::new(0),
                max_delay_ms,
            }
        }

        fn contacts(&self) -> Vec<Contact> {
            self.nodes.values().map(|node| node.contact.clone()).collect()
        }

        /// The `count` closest online contacts to `target`, by brute force.
        fn closest(&self, target: &Id, count: usize) -> Vec<Contact> {
            let mut contacts: Vec<Contact> = self
                .nodes
                .values()
                .filter(|node| !node.offline)
                .map(|node| node.contact.clone())
                .collect();
            contacts.sort_by_key(|contact| contact.id().distance(target));
            contacts.truncate(count);
            contacts
        }

        fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }
    }

    impl Probe for MockNetwork {
        fn probe(&self, contact: &Contact, request: RequestSpecific) -> Result<ResponseSpecific> {
            self.probes.fetch_add(1, Ordering::SeqCst);

            if self.max_delay_ms > 0 {
                let delay = rand::thread_rng().gen_range(self.max_delay_ms / 2..=self.max_delay_ms);
                thread::sleep(Duration::from_millis(delay));
            }

            match self.nodes.get(contact.id()) {
                Some(node) if !node.offline => Ok(handle_request(
                    &node.table,
                    &node.storage,
                    &Id::random(),
                    &request,
                )),
                _ => Err(Error::Timeout {
                    correlation_id: "mock".to_string(),
                }),
            }
        }
    }

    fn params() -> LookupParams {
        LookupParams {
            local_id: Id::random(),
            k: K,
            alpha: 3,
        }
    }

    fn random_seed(network: &MockNetwork, count: usize) -> Vec<Contact> {
        let contacts = network.contacts();
        let mut rng = rand::thread_rng();

        (0..count)
            .map(|_| contacts[rng.gen_range(0..contacts.len())].clone())
            .collect()
    }

    fn ids(contacts: &[Contact]) -> Vec<Id> {
        contacts.iter().map(|contact| *contact.id()).collect()
    }

    #[test]
    fn converges_to_the_closest_k() {
        let network = Arc::new(MockNetwork::new(100, 0));

        for _ in 0..5 {
            let target = Id::random();
            let seed = random_seed(&network, 3);

            let lookup = find_node(
                target,
                seed,
                network.clone(),
                params(),
                &CancellationToken::new(),
            );

            assert_eq!(ids(lookup.contacts()), ids(&network.closest(&target, K)));
        }
    }

    #[test]
    fn skips_offline_contacts() {
        let mut network = MockNetwork::new(100, 0);
        let target = Id::random();

        // Take the nodes closest to the target offline.
        for contact in network.closest(&target, 5) {
            if let Some(node) = network.nodes.get_mut(contact.id()) {
                node.offline = true;
            }
        }
        let network = Arc::new(network);

        let lookup = find_node(
            target,
            random_seed(&network, 3),
            network.clone(),
            params(),
            &CancellationToken::new(),
        );

        assert_eq!(ids(lookup.contacts()), ids(&network.closest(&target, K)));
    }

    #[test]
    fn finds_value_held_by_one_node() {
        let key = "the answer";

        for _ in 0..5 {
            let network = MockNetwork::new(100, 3);
            let holder = network.closest(&Id::from_key(key), 1)[0].clone();
            network.nodes[holder.id()]
                .storage
                .put(key, "42".to_string())
                .unwrap();
            let network = Arc::new(network);

            let lookup = find_value(
                key,
                random_seed(&network, 3),
                network.clone(),
                params(),
                &CancellationToken::new(),
            );

            match lookup {
                ValueLookup::Found {
                    value,
                    from,
                    closest_without_value,
                } => {
                    assert_eq!(value, "42");
                    assert_eq!(from, holder);
                    assert!(!closest_without_value.contains(&holder));
                }
                other => panic!("expected the value, got {:?}", other),
            }
        }
    }

    #[test]
    fn value_not_found_after_convergence() {
        let network = Arc::new(MockNetwork::new(50, 0));

        let lookup = find_value(
            "nobody has this",
            random_seed(&network, 3),
            network.clone(),
            params(),
            &CancellationToken::new(),
        );

        match lookup {
            ValueLookup::NotFound(closest) => assert_eq!(
                ids(&closest),
                ids(&network.closest(&Id::from_key("nobody has this"), K))
            ),
            other => panic!("expected not found, got {:?}", other),
        }
    }

    #[test]
    fn empty_seed_issues_no_probe() {
        let network = Arc::new(MockNetwork::new(10, 0));

        let lookup = find_node(
            Id::random(),
            Vec::new(),
            network.clone(),
            params(),
            &CancellationToken::new(),
        );

        assert_eq!(lookup, NodeLookup::EmptyRoutingTable);
        assert_eq!(network.probes(), 0);
    }

    #[test]
    fn own_id_is_never_probed() {
        let network = Arc::new(MockNetwork::new(10, 0));
        let params = params();

        let lookup = find_node(
            Id::random(),
            vec![Contact::new(
                params.local_id,
                std::net::SocketAddr::from(([127, 0, 0, 1], 1)),
            )],
            network.clone(),
            params,
            &CancellationToken::new(),
        );

        assert_eq!(lookup, NodeLookup::EmptyRoutingTable);
        assert_eq!(network.probes(), 0);
    }

    #[test]
    fn cancelled_before_start() {
        let network = Arc::new(MockNetwork::new(10, 0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let lookup = find_value("key", network.contacts(), network.clone(), params(), &cancel);

        assert_eq!(lookup, ValueLookup::Cancelled);
        assert_eq!(network.probes(), 0);
    }

    #[test]
    fn cancelled_while_probing() {
        let network = Arc::new(MockNetwork::new(50, 200));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                cancel.cancel();
            })
        };

        let lookup = find_node(
            Id::random(),
            random_seed(&network, 3),
            network.clone(),
            params(),
            &cancel,
        );
        canceller.join().unwrap();

        assert_eq!(lookup, NodeLookup::Cancelled);
    }
}
