/// Backoff Table
///
/// Per-(topic, peer) embargo on GRAFTs. An entry is installed whenever
/// we prune a peer, whenever a peer prunes us, and whenever a graft is
/// rejected; while it is live we must not graft the peer and will
/// penalize the peer for grafting us.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::types::{PeerId, TopicId};

/// Upper bound on a remotely supplied backoff interval.
const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default)]
pub struct BackoffTable {
    entries: HashMap<TopicId, HashMap<PeerId, Instant>>,
}

impl BackoffTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a backoff expiring at `until`. An existing later expiry
    /// wins: backoffs never shorten.
    pub fn set(&mut self, topic: &str, peer: &PeerId, until: Instant) {
        let entry = self
            .entries
            .entry(topic.to_string())
            .or_default()
            .entry(*peer)
            .or_insert(until);
        if until > *entry {
            *entry = until;
        }
    }

    /// Install a backoff of `interval` from `now`, clamped to one day.
    pub fn set_interval(&mut self, topic: &str, peer: &PeerId, now: Instant, interval: Duration) {
        self.set(topic, peer, now + interval.min(MAX_BACKOFF));
    }

    pub fn get(&self, topic: &str, peer: &PeerId) -> Option<Instant> {
        self.entries.get(topic).and_then(|peers| peers.get(peer)).copied()
    }

    /// Whether a GRAFT to `(topic, peer)` is still embargoed.
    ///
    /// `slack` tolerates clock skew between both ends: the embargo is
    /// considered over `slack` before its nominal expiry.
    pub fn is_backing_off(&self, topic: &str, peer: &PeerId, now: Instant, slack: Duration) -> bool {
        match self.get(topic, peer) {
            Some(expiry) => expiry.saturating_duration_since(now) > slack,
            None => false,
        }
    }

    /// Remove entries of a topic that expired by `now`. Called per
    /// topic every heartbeat.
    pub fn age_expired(&mut self, topic: &str, now: Instant) {
        if let Some(peers) = self.entries.get_mut(topic) {
            peers.retain(|_, expiry| *expiry > now);
            if peers.is_empty() {
                self.entries.remove(topic);
            }
        }
    }

    pub fn len(&self, topic: &str) -> usize {
        self.entries.get(topic).map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
