//! LRU k-buckets

use anonet_core::types::K;

use crate::{Contact, NodeId};

/// Result of inserting into a bucket.
#[derive(Debug, Clone)]
pub enum BucketInsert {
    /// New contact appended.
    Added,
    /// Already present; moved to the tail and refreshed.
    Refreshed,
    /// Bucket full. The oldest contact is returned as a ping candidate;
    /// it stays in the bucket until the caller confirms it dead.
    Full { oldest: Contact },
}

/// One k-bucket: up to K contacts ordered oldest first, no duplicates.
#[derive(Debug, Default)]
pub struct KBucket {
    contacts: Vec<Contact>,
}

impl KBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a contact.
    pub fn insert(&mut self, contact: Contact) -> BucketInsert {
        if let Some(pos) = self.position(&contact.node_id) {
            let mut existing = self.contacts.remove(pos);
            existing.addr = contact.addr;
            existing.touch();
            self.contacts.push(existing);
            return BucketInsert::Refreshed;
        }

        if self.contacts.len() < K {
            self.contacts.push(contact);
            return BucketInsert::Added;
        }

        BucketInsert::Full {
            oldest: self.contacts[0].clone(),
        }
    }

    /// Move a contact to the tail and refresh its timers.
    pub fn mark_seen(&mut self, node_id: &NodeId) -> bool {
        match self.position(node_id) {
            Some(pos) => {
                let mut contact = self.contacts.remove(pos);
                contact.touch();
                self.contacts.push(contact);
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, node_id: &NodeId) -> bool {
        match self.position(node_id) {
            Some(pos) => {
                self.contacts[pos].mark_failed();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, node_id: &NodeId) -> Option<Contact> {
        self.position(node_id).map(|pos| self.contacts.remove(pos))
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.position(node_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// Contacts unseen past the staleness window
    pub fn stale(&self) -> Vec<Contact> {
        self.contacts.iter().filter(|c| c.is_stale()).cloned().collect()
    }

    /// Contacts with too many unanswered queries
    pub fn bad(&self) -> Vec<Contact> {
        self.contacts.iter().filter(|c| c.is_bad()).cloned().collect()
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.node_id == *node_id)
    }
}
