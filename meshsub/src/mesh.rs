/// Mesh State
///
/// Manages the per-topic peer role sets.
///
/// ## Overview
///
/// Every topic splits its known peers into three disjoint roles:
///
/// | Role      | Description                                              |
/// |-----------|----------------------------------------------------------|
/// | gossipsub | All peers known to subscribe to the topic                |
/// | mesh      | Peers we exchange full messages with (eager push)        |
/// | fanout    | Transient forwarding peers for topics we publish to but  |
/// |           | do not subscribe to. Expires after fanout_ttl.           |
///
/// Mesh membership is bounded by the D parameters and maintained by the
/// heartbeat; fanout entries age out on publish inactivity. A peer is
/// never in both the mesh and the fanout of one topic, and direct peers
/// are in neither.
///
/// ## References
///
/// - Gossipsub v1.0: <https://github.com/libp2p/specs/blob/master/pubsub/gossipsub/gossipsub-v1.0.md>
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::types::{PeerId, TopicId};

/// Fanout state for a publish-only topic.
#[derive(Debug, Clone)]
pub struct FanoutEntry {
    /// Peers in the fanout for this topic, selected from available
    /// topic peers up to D.
    pub peers: HashSet<PeerId>,

    /// Moment of the last publish to this topic.
    pub last_published: Instant,
}

impl FanoutEntry {
    pub fn new(now: Instant) -> Self {
        Self {
            peers: HashSet::new(),
            last_published: now,
        }
    }

    /// Whether the entry has been idle longer than `ttl`.
    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_published) > ttl
    }
}

/// Complete role-set state across all topics.
#[derive(Debug, Clone, Default)]
pub struct MeshState {
    /// Topics we are subscribed to.
    subscriptions: HashSet<TopicId>,

    /// All peers known to subscribe to each topic.
    gossipsub: HashMap<TopicId, HashSet<PeerId>>,

    /// Mesh membership with graft moments, per subscribed topic.
    meshes: HashMap<TopicId, HashMap<PeerId, Instant>>,

    /// Fanout state for publish-only topics.
    fanouts: HashMap<TopicId, FanoutEntry>,
}

impl MeshState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, initializing its mesh.
    ///
    /// Existing fanout peers are promoted into the mesh and returned so
    /// the caller can notify them with a GRAFT.
    pub fn subscribe(&mut self, topic: TopicId, now: Instant) -> Vec<PeerId> {
        if self.subscriptions.contains(&topic) {
            return Vec::new();
        }

        self.subscriptions.insert(topic.clone());

        let mut mesh = HashMap::new();
        let mut promoted = Vec::new();
        if let Some(fanout) = self.fanouts.remove(&topic) {
            for peer in fanout.peers {
                mesh.insert(peer, now);
                promoted.push(peer);
            }
        }
        self.meshes.insert(topic, mesh);
        promoted
    }

    /// Unsubscribe from a topic.
    ///
    /// Returns the peers that were in the mesh; each needs a PRUNE.
    pub fn unsubscribe(&mut self, topic: &str) -> Vec<PeerId> {
        self.subscriptions.remove(topic);
        self.meshes
            .remove(topic)
            .map(|mesh| mesh.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains(topic)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &TopicId> {
        self.subscriptions.iter()
    }

    /// Note that a peer subscribed to a topic.
    pub fn peer_subscribed(&mut self, topic: &str, peer: PeerId) -> bool {
        self.gossipsub.entry(topic.to_string()).or_default().insert(peer)
    }

    /// Note that a peer unsubscribed from a topic. The peer also leaves
    /// the topic's mesh and fanout.
    pub fn peer_unsubscribed(&mut self, topic: &str, peer: &PeerId) -> bool {
        let was_known = match self.gossipsub.get_mut(topic) {
            Some(peers) => {
                let removed = peers.remove(peer);
                if peers.is_empty() {
                    self.gossipsub.remove(topic);
                }
                removed
            }
            None => false,
        };
        self.remove_from_mesh(topic, peer);
        if let Some(fanout) = self.fanouts.get_mut(topic) {
            fanout.peers.remove(peer);
        }
        was_known
    }

    /// All peers known to subscribe to `topic`.
    pub fn topic_peers(&self, topic: &str) -> impl Iterator<Item = &PeerId> {
        self.gossipsub.get(topic).into_iter().flatten()
    }

    pub fn mesh_peers(&self, topic: &str) -> Vec<PeerId> {
        self.meshes
            .get(topic)
            .map(|mesh| mesh.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn mesh_len(&self, topic: &str) -> usize {
        self.meshes.get(topic).map(|mesh| mesh.len()).unwrap_or(0)
    }

    pub fn in_mesh(&self, topic: &str, peer: &PeerId) -> bool {
        self.meshes
            .get(topic)
            .map(|mesh| mesh.contains_key(peer))
            .unwrap_or(false)
    }

    /// Moment the peer was grafted, when it is in the topic's mesh.
    pub fn graft_time(&self, topic: &str, peer: &PeerId) -> Option<Instant> {
        self.meshes.get(topic).and_then(|mesh| mesh.get(peer)).copied()
    }

    /// Add a peer to a topic's mesh, recording the graft moment.
    ///
    /// The peer leaves the topic's fanout if present, keeping the roles
    /// disjoint. Returns `false` if already in the mesh or the topic is
    /// not subscribed.
    pub fn add_to_mesh(&mut self, topic: &str, peer: PeerId, now: Instant) -> bool {
        let Some(mesh) = self.meshes.get_mut(topic) else {
            return false;
        };
        if mesh.contains_key(&peer) {
            return false;
        }
        mesh.insert(peer, now);
        if let Some(fanout) = self.fanouts.get_mut(topic) {
            fanout.peers.remove(&peer);
        }
        true
    }

    pub fn remove_from_mesh(&mut self, topic: &str, peer: &PeerId) -> bool {
        self.meshes
            .get_mut(topic)
            .map(|mesh| mesh.remove(peer).is_some())
            .unwrap_or(false)
    }

    /// Topics with an active mesh.
    pub fn mesh_topics(&self) -> Vec<TopicId> {
        self.meshes.keys().cloned().collect()
    }

    /// Topics with an active fanout.
    pub fn fanout_topics(&self) -> Vec<TopicId> {
        self.fanouts.keys().cloned().collect()
    }

    pub fn fanout_peers(&self, topic: &str) -> Vec<PeerId> {
        self.fanouts
            .get(topic)
            .map(|fanout| fanout.peers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn in_fanout(&self, topic: &str, peer: &PeerId) -> bool {
        self.fanouts
            .get(topic)
            .map(|fanout| fanout.peers.contains(peer))
            .unwrap_or(false)
    }

    /// Fanout entry of a topic, created at `now` if absent.
    pub fn fanout_entry(&mut self, topic: &str, now: Instant) -> &mut FanoutEntry {
        self.fanouts
            .entry(topic.to_string())
            .or_insert_with(|| FanoutEntry::new(now))
    }

    pub fn get_fanout(&self, topic: &str) -> Option<&FanoutEntry> {
        self.fanouts.get(topic)
    }

    pub fn get_fanout_mut(&mut self, topic: &str) -> Option<&mut FanoutEntry> {
        self.fanouts.get_mut(topic)
    }

    /// Drop fanout entries idle longer than `ttl`.
    ///
    /// Returns the dropped topics.
    pub fn drop_stale_fanouts(&mut self, now: Instant, ttl: Duration) -> Vec<TopicId> {
        let stale: Vec<_> = self
            .fanouts
            .iter()
            .filter(|(_, fanout)| fanout.is_stale(now, ttl))
            .map(|(topic, _)| topic.clone())
            .collect();

        for topic in &stale {
            self.fanouts.remove(topic);
        }
        stale
    }

    /// Purge a peer from every role set. Called on disconnect.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        for peers in self.gossipsub.values_mut() {
            peers.remove(peer);
        }
        self.gossipsub.retain(|_, peers| !peers.is_empty());
        for mesh in self.meshes.values_mut() {
            mesh.remove(peer);
        }
        for fanout in self.fanouts.values_mut() {
            fanout.peers.remove(peer);
        }
    }
}
