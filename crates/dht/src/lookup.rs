//! Iterative FIND_VALUE
//!
//! Response-driven: VALUE and NODES replies complete the round through the
//! transaction registry. The local store is still polled between rounds as
//! a fallback, since STOREs from third parties land there out-of-band.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::debug;

use anonet_core::types::{ALPHA, K};
use anonet_core::CoreEvent;

use crate::announcement::PeerAnnouncement;
use crate::service::QUERY_TIMEOUT;
use crate::wire::Message;
use crate::{Contact, DhtService, NodeId};

/// Overall lookup budget.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long one round waits for its α responses.
const ROUND_WAIT: Duration = Duration::from_secs(2);

/// Grace period for late responses after the budget expires.
const FINAL_WAIT: Duration = Duration::from_secs(3);

impl DhtService {
    /// Locate the announcement stored under `key`, querying the network
    /// iteratively with parallelism α. Returns `None` when nothing
    /// verifiable was found within the budget.
    pub async fn lookup(&self, key: NodeId) -> Option<PeerAnnouncement> {
        let found = self.lookup_inner(key).await;
        self.events().emit(CoreEvent::LookupFinished {
            key_hex: key.to_hex(),
            found: found.is_some(),
        });
        found
    }

    async fn lookup_inner(&self, key: NodeId) -> Option<PeerAnnouncement> {
        if let Some(announcement) = self.verified_local(&key) {
            return Some(announcement);
        }

        let mut candidates = self.routing().closest(&key, K);
        if candidates.is_empty() {
            return None;
        }

        let mut queried: HashSet<NodeId> = HashSet::new();
        let deadline = Instant::now() + LOOKUP_TIMEOUT;

        while Instant::now() < deadline {
            let round: Vec<Contact> = candidates
                .iter()
                .filter(|c| !queried.contains(&c.node_id))
                .take(ALPHA)
                .cloned()
                .collect();
            if round.is_empty() {
                break;
            }
            for contact in &round {
                queried.insert(contact.node_id);
            }

            let (found, discovered) = self.ask(key, &round, ROUND_WAIT).await;
            if let Some(announcement) = found {
                return Some(announcement);
            }

            // Fallback path: a STORE may have landed while we were asking.
            if let Some(announcement) = self.verified_local(&key) {
                return Some(announcement);
            }

            for contact in discovered {
                if contact.node_id != *self.local_id() && !candidates.contains(&contact) {
                    candidates.push(contact);
                }
            }
            candidates.sort_by(|a, b| {
                a.node_id
                    .xor_distance(&key)
                    .cmp(&b.node_id.xor_distance(&key))
            });
        }

        // One last ask of the current K closest, with a grace period for
        // stragglers.
        let closest: Vec<Contact> = candidates.into_iter().take(K).collect();
        debug!(key = %key, "lookup budget spent, final round of {}", closest.len());
        let (found, _) = self.ask(key, &closest, FINAL_WAIT).await;
        if found.is_some() {
            return found;
        }
        self.verified_local(&key)
    }

    /// Send FIND_VALUE to every contact in `round` and collect responses
    /// until a verifying value arrives or `wait` elapses.
    async fn ask(
        &self,
        key: NodeId,
        round: &[Contact],
        wait: Duration,
    ) -> (Option<PeerAnnouncement>, Vec<Contact>) {
        let mut queries: JoinSet<crate::Result<Message>> = JoinSet::new();
        for contact in round {
            let service = self.clone();
            let addr = contact.addr;
            let target = contact.node_id;
            queries.spawn(async move {
                service
                    .query(addr, Some(target), Message::FindValue { key }, QUERY_TIMEOUT)
                    .await
            });
        }

        let mut discovered = Vec::new();
        let collect = async {
            while let Some(joined) = queries.join_next().await {
                match joined {
                    Ok(Ok(Message::Value { value })) => {
                        if let Ok(announcement) = PeerAnnouncement::from_verified_bytes(&value) {
                            let _ = self.store().insert(key, value);
                            return Some(announcement);
                        }
                    }
                    Ok(Ok(Message::Nodes { contacts })) => discovered.extend(contacts),
                    _ => {}
                }
            }
            None
        };

        let found = tokio::time::timeout(wait, collect).await.unwrap_or(None);
        queries.abort_all();
        (found, discovered)
    }

    fn verified_local(&self, key: &NodeId) -> Option<PeerAnnouncement> {
        let value = self.store().get(key)?;
        PeerAnnouncement::from_verified_bytes(&value).ok()
    }
}
