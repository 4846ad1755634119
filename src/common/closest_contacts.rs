use std::vec::IntoIter;

use crate::common::{Contact, Id};

/// Contacts sorted by ascending XOR distance to a target, without duplicate ids.
#[derive(Debug, Clone)]
pub struct ClosestContacts {
    target: Id,
    contacts: Vec<Contact>,
}

impl ClosestContacts {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            contacts: Vec::with_capacity(200),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.position(id).is_some()
    }

    // === Public Methods ===

    /// Insert a contact at its distance rank, returns false if its id is known.
    pub fn add(&mut self, contact: Contact) -> bool {
        let seek = contact.id().distance(&self.target);

        match self
            .contacts
            .binary_search_by(|probe| probe.id().distance(&self.target).cmp(&seek))
        {
            // Equal distance means equal id.
            Ok(_) => false,
            Err(pos) => {
                self.contacts.insert(pos, contact);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        self.position(id).map(|index| self.contacts.remove(index))
    }

    pub fn truncate(&mut self, len: usize) {
        self.contacts.truncate(len)
    }

    // === Private Methods ===

    fn position(&self, id: &Id) -> Option<usize> {
        let seek = id.distance(&self.target);

        self.contacts
            .binary_search_by(|probe| probe.id().distance(&self.target).cmp(&seek))
            .ok()
    }
}

impl IntoIterator for ClosestContacts {
    type Item = Contact;
    type IntoIter = IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestContacts {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.iter()
    }
}
