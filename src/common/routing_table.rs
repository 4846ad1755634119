//! Simplified Kademlia routing table

use std::slice::Iter;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::common::{ClosestContacts, Contact, Id, DEFAULT_FAILURE_THRESHOLD, ID_BITS};
use crate::Result;

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K: usize = 20;

/// Outcome of [RoutingTable::insert_or_refresh].
#[derive(Debug, Clone, PartialEq)]
pub enum Insertion {
    /// A new contact was appended, possibly evicting a stale one.
    Inserted,
    /// The contact was already known and moved to the most-recently-seen position.
    Refreshed,
    /// The bucket is full of live contacts.
    ///
    /// Probe `least_recently_seen`, and call [RoutingTable::replace] if it fails.
    BucketFull { least_recently_seen: Contact },
}

/// Kademlia routing table with one k-bucket per common prefix length.
///
/// Bucket `i` holds the contacts sharing exactly `i` leading bits with the local
/// id. Each bucket has its own lock, so lookups and inbound requests touching
/// different buckets don't contend.
#[derive(Debug)]
pub struct RoutingTable {
    id: Id,
    k: usize,
    failure_threshold: u32,
    buckets: Box<[Mutex<KBucket>]>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] with a given id.
    pub fn new(id: Id) -> Self {
        let buckets = (0..ID_BITS)
            .map(|_| Mutex::new(KBucket::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        RoutingTable {
            id,
            k: DEFAULT_K,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            buckets,
        }
    }

    // === Options ===

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    // === Public Methods ===

    /// Add a contact, or refresh it if its id is already known.
    ///
    /// Errors if the contact carries the local id.
    pub fn insert_or_refresh(&self, contact: Contact) -> Result<Insertion> {
        let index = self.id.common_prefix_len(contact.id())?;

        Ok(self
            .bucket(index)
            .insert_or_refresh(contact, self.k, self.failure_threshold))
    }

    /// Replace `stale` with `contact` after `stale` failed a liveness probe.
    ///
    /// Returns false if `stale` is gone or has been seen alive since.
    pub fn replace(&self, stale: &Id, contact: Contact) -> bool {
        let index = match self.id.common_prefix_len(contact.id()) {
            Ok(index) => index,
            Err(_) => return false,
        };

        self.bucket(index).replace(stale, contact)
    }

    /// Mark a contact as alive, moving it to the most-recently-seen position.
    pub fn touch(&self, id: &Id) -> bool {
        match self.id.common_prefix_len(id) {
            Ok(index) => self.bucket(index).touch(id),
            Err(_) => false,
        }
    }

    /// Record a failed probe, returning the consecutive failure count if known.
    pub fn mark_failed(&self, id: &Id) -> Option<u32> {
        let index = self.id.common_prefix_len(id).ok()?;

        self.bucket(index).mark_failed(id)
    }

    /// Remove a contact from this routing table, no-op if absent.
    pub fn remove(&self, id: &Id) {
        if let Ok(index) = self.id.common_prefix_len(id) {
            self.bucket(index).remove(id)
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &Id) -> Option<Contact> {
        let index = self.id.common_prefix_len(id).ok()?;

        self.bucket(index).get(id).cloned()
    }

    /// Return up to `count` contacts ordered by ascending distance to `target`.
    ///
    /// Starts from the bucket `target` would fall into and widens tier by tier:
    /// buckets further from the local id come next, then nearer buckets, each of
    /// which is strictly further from `target` than the ones before it.
    pub fn closest_contacts(&self, target: &Id, count: usize) -> Vec<Contact> {
        let mut closest = ClosestContacts::new(*target);

        if count == 0 {
            return vec![];
        }

        let start = self.id.common_prefix_len(target).unwrap_or(ID_BITS);

        if start < ID_BITS {
            self.collect_bucket(start, &mut closest);
        }

        if closest.len() < count {
            for index in (start + 1)..ID_BITS {
                self.collect_bucket(index, &mut closest);
            }
        }

        for index in (0..start).rev() {
            if closest.len() >= count {
                break;
            }
            self.collect_bucket(index, &mut closest);
        }

        closest.truncate(count);
        closest.into_iter().collect()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        (0..ID_BITS).all(|index| self.bucket(index).is_empty())
    }

    /// Return the number of contacts in this routing table.
    pub fn len(&self) -> usize {
        (0..ID_BITS).map(|index| self.bucket(index).len()).sum()
    }

    /// Export an owned vector of contacts, nearest buckets last.
    pub fn contacts(&self) -> Vec<Contact> {
        (0..ID_BITS)
            .flat_map(|index| self.bucket(index).iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    // === Private Methods ===

    fn bucket(&self, index: usize) -> MutexGuard<'_, KBucket> {
        self.buckets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn collect_bucket(&self, index: usize, closest: &mut ClosestContacts) {
        for contact in self.bucket(index).iter() {
            closest.add(contact.clone());
        }
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone, Default)]
pub struct KBucket {
    /// Contacts in the k-bucket, sorted by the least recently seen.
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            contacts: Vec::with_capacity(DEFAULT_K),
        }
    }

    // === Public Methods ===

    pub fn insert_or_refresh(
        &mut self,
        incoming: Contact,
        k: usize,
        failure_threshold: u32,
    ) -> Insertion {
        if let Some(index) = self.position(incoming.id()) {
            let mut existing = self.contacts.remove(index);
            existing.refresh_from(&incoming);
            self.contacts.push(existing);

            Insertion::Refreshed
        } else if self.contacts.len() < k {
            self.contacts.push(incoming);

            Insertion::Inserted
        } else if let Some(index) = self
            .contacts
            .iter()
            .position(|c| c.is_stale(failure_threshold))
        {
            // Least recently seen among the stale ones, given the bucket order.
            self.contacts.remove(index);
            self.contacts.push(incoming);

            Insertion::Inserted
        } else {
            match self.contacts.first() {
                Some(least_recently_seen) => Insertion::BucketFull {
                    least_recently_seen: least_recently_seen.clone(),
                },
                // k is at least 1, so a full bucket is never empty.
                None => Insertion::Inserted,
            }
        }
    }

    pub fn replace(&mut self, stale: &Id, incoming: Contact) -> bool {
        let index = match self.position(stale) {
            Some(index) => index,
            None => return false,
        };

        if self.contacts[index].failed_probes() == 0 || self.position(incoming.id()).is_some() {
            return false;
        }

        self.contacts.remove(index);
        self.contacts.push(incoming);

        true
    }

    pub fn touch(&mut self, id: &Id) -> bool {
        match self.position(id) {
            Some(index) => {
                let mut contact = self.contacts.remove(index);
                contact.touch();
                self.contacts.push(contact);
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, id: &Id) -> Option<u32> {
        let index = self.position(id)?;

        Some(self.contacts[index].mark_failed())
    }

    pub fn remove(&mut self, id: &Id) {
        self.contacts.retain(|contact| contact.id() != id);
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.contacts.iter().find(|contact| contact.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        self.contacts.iter().position(|contact| contact.id() == id)
    }
}
