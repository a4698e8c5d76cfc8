use std::vec::IntoIter;

use crate::common::{Contact, Id};

/// Contacts ordered by ascending XOR distance to a target, without duplicates.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    contacts: Vec<Contact>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            contacts: Vec::with_capacity(64),
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
        self.contacts.iter().any(|contact| contact.id() == id)
    }

    /// Distance of the closest contact to the target.
    pub fn closest_distance(&self) -> Option<Id> {
        self.contacts
            .first()
            .map(|contact| contact.id().xor(&self.target))
    }

    // === Public Methods ===

    /// Inserts `contact` at its distance rank. Returns false if it was already present.
    pub fn add(&mut self, contact: Contact) -> bool {
        if self.contains(contact.id()) {
            return false;
        }

        let seek = contact.id().xor(&self.target);

        match self
            .contacts
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
        {
            Ok(_) => false,
            Err(position) => {
                self.contacts.insert(position, contact);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let position = self.contacts.iter().position(|contact| contact.id() == id)?;

        Some(self.contacts.remove(position))
    }

    pub fn truncate(&mut self, len: usize) {
        self.contacts.truncate(len);
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Contact;
    type IntoIter = IntoIter<Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Contact;
    type IntoIter = std::slice::Iter<'a, Contact>;

    fn into_iter(self) -> Self::IntoIter {
        self.contacts.iter()
    }
}
