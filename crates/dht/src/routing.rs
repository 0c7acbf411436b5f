//! Kademlia routing table: 160 k-buckets indexed by shared-prefix length

use parking_lot::Mutex;

use anonet_core::types::BUCKET_COUNT;

use crate::bucket::{BucketInsert, KBucket};
use crate::{Contact, NodeId};

/// The routing table. A coarse table lock serializes writers; reads clone
/// out what they need.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Mutex<Vec<KBucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let buckets = (0..BUCKET_COUNT).map(|_| KBucket::new()).collect();
        Self {
            local_id,
            buckets: Mutex::new(buckets),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Insert or refresh a contact.
    ///
    /// The local id is never inserted. When the target bucket is full the
    /// oldest resident is returned as a ping candidate; the caller evicts
    /// it with [`replace`](Self::replace) only once it is confirmed dead.
    pub fn add_contact(&self, contact: Contact) -> Option<Contact> {
        if contact.node_id == self.local_id {
            return None;
        }

        let index = self.local_id.bucket_index(&contact.node_id);
        let mut buckets = self.buckets.lock();
        match buckets[index].insert(contact) {
            BucketInsert::Full { oldest } => Some(oldest),
            _ => None,
        }
    }

    /// Evict `dead` and insert `replacement` in its place, if `dead` is
    /// still present.
    pub fn replace(&self, dead: &NodeId, replacement: Contact) -> bool {
        if replacement.node_id == self.local_id {
            return false;
        }

        let index = self.local_id.bucket_index(dead);
        let mut buckets = self.buckets.lock();
        if buckets[index].remove(dead).is_none() {
            return false;
        }
        buckets[index].insert(replacement);
        true
    }

    /// The `count` contacts closest to `target` by XOR distance.
    ///
    /// Starts at the target's bucket and widens over neighboring buckets
    /// until enough contacts are gathered, then sorts the union.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let center = self.local_id.bucket_index(target);
        let buckets = self.buckets.lock();

        let mut gathered: Vec<Contact> = buckets[center].contacts().to_vec();
        let mut low = center;
        let mut high = center;
        while gathered.len() < count && (low > 0 || high < BUCKET_COUNT - 1) {
            if low > 0 {
                low -= 1;
                gathered.extend(buckets[low].contacts().iter().cloned());
            }
            if high < BUCKET_COUNT - 1 {
                high += 1;
                gathered.extend(buckets[high].contacts().iter().cloned());
            }
        }
        drop(buckets);

        gathered.sort_by(|a, b| {
            a.node_id
                .xor_distance(target)
                .cmp(&b.node_id.xor_distance(target))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        gathered.truncate(count);
        gathered
    }

    /// Refresh timers for a contact we just heard from
    pub fn mark_seen(&self, node_id: &NodeId) -> bool {
        let index = self.local_id.bucket_index(node_id);
        self.buckets.lock()[index].mark_seen(node_id)
    }

    /// Count an unanswered query against a contact
    pub fn mark_failed(&self, node_id: &NodeId) -> bool {
        let index = self.local_id.bucket_index(node_id);
        self.buckets.lock()[index].mark_failed(node_id)
    }

    pub fn remove(&self, node_id: &NodeId) -> Option<Contact> {
        let index = self.local_id.bucket_index(node_id);
        self.buckets.lock()[index].remove(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        let index = self.local_id.bucket_index(node_id);
        self.buckets.lock()[index].contains(node_id)
    }

    /// Stale contacts across all buckets (ping targets for maintenance)
    pub fn stale(&self) -> Vec<Contact> {
        self.buckets.lock().iter().flat_map(|b| b.stale()).collect()
    }

    /// Contacts past the failure threshold (eviction targets)
    pub fn bad(&self) -> Vec<Contact> {
        self.buckets.lock().iter().flat_map(|b| b.bad()).collect()
    }

    pub fn all(&self) -> Vec<Contact> {
        self.buckets
            .lock()
            .iter()
            .flat_map(|b| b.contacts().iter().cloned())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.buckets.lock().iter().map(|b| b.len()).sum()
    }

    pub fn non_empty_bucket_count(&self) -> usize {
        self.buckets.lock().iter().filter(|b| !b.is_empty()).count()
    }
}
