/// Preamble / Bandwidth Subsystem (v1.4)
///
/// Tracks in-flight large-message receptions announced by PREAMBLE
/// messages so redundant pulls can be suppressed elsewhere in the mesh,
/// and recovers via IWANT when an announced transmission never
/// completes.
///
/// ## Stores
///
/// | Store                  | Meaning                                     |
/// |------------------------|---------------------------------------------|
/// | ongoing_receives       | A mesh peer announced it is sending to us   |
/// | ongoing_iwant_receives | We asked for the message by IWANT and wait  |
///
/// Entries expire after an estimated transmission time derived from
/// the sender's observed download rate. Expiry of an announced receive
/// penalizes the sender and, in pull mode, retries against an
/// alternate peer that also claimed to hold the message.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::control::{ControlMessage, IWant, ImReceiving, Preamble};
use crate::manager::{MeshManager, BEHAVIOUR_PENALTY_STEP};
use crate::types::{MeshEvent, MessageId, PeerId, PeerKind, TopicId};

/// Estimate used when a peer's download rate is still unobserved.
const DEFAULT_RECEIVE_TIME: Duration = Duration::from_secs(5);

/// Bounds of the transmission-time estimate.
const MIN_RECEIVE_TIME: Duration = Duration::from_millis(100);
const MAX_RECEIVE_TIME: Duration = Duration::from_secs(30);

/// Margin multiplied onto the raw transfer-time estimate.
const RECEIVE_TIME_MARGIN: f64 = 2.0;

/// Conservative estimate of how long `bytes` take to arrive at `bps`.
pub fn receive_time(bytes: usize, bps: f64) -> Duration {
    if bps <= f64::EPSILON {
        return DEFAULT_RECEIVE_TIME;
    }
    let secs = (bytes as f64 / bps * RECEIVE_TIME_MARGIN).clamp(
        MIN_RECEIVE_TIME.as_secs_f64(),
        MAX_RECEIVE_TIME.as_secs_f64(),
    );
    Duration::from_secs_f64(secs)
}

/// One tracked in-flight reception.
#[derive(Debug, Clone)]
pub struct PreambleEntry {
    pub message_id: MessageId,
    pub topic: TopicId,
    pub message_len: usize,
    pub sender: PeerId,
    pub starts_at: Instant,
    pub expires_at: Instant,
    /// Peers that also claim to hold the message; candidates for a
    /// pull retry.
    pub possible_peers: Vec<PeerId>,
}

/// The two moment-keyed expiry stores of the subsystem.
#[derive(Debug, Default)]
pub struct PreambleTracker {
    ongoing_receives: HashMap<MessageId, PreambleEntry>,
    ongoing_iwant_receives: HashMap<MessageId, PreambleEntry>,
}

impl PreambleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether either store tracks this id.
    pub fn is_tracking(&self, id: &MessageId) -> bool {
        self.ongoing_receives.contains_key(id) || self.ongoing_iwant_receives.contains_key(id)
    }

    pub fn tracks_ongoing(&self, id: &MessageId) -> bool {
        self.ongoing_receives.contains_key(id)
    }

    /// Declared length of a tracked reception, if any.
    pub fn tracked_length(&self, id: &MessageId) -> Option<usize> {
        self.ongoing_receives
            .get(id)
            .or_else(|| self.ongoing_iwant_receives.get(id))
            .map(|entry| entry.message_len)
    }

    pub fn insert_ongoing(&mut self, entry: PreambleEntry) {
        self.ongoing_receives.insert(entry.message_id, entry);
    }

    pub fn insert_iwant(&mut self, entry: PreambleEntry) {
        self.ongoing_iwant_receives.insert(entry.message_id, entry);
    }

    /// Note another peer that claims to hold a tracked message.
    pub fn register_alternate(&mut self, id: &MessageId, peer: PeerId) {
        let entry = self
            .ongoing_receives
            .get_mut(id)
            .or_else(|| self.ongoing_iwant_receives.get_mut(id));
        if let Some(entry) = entry {
            if entry.sender != peer && !entry.possible_peers.contains(&peer) {
                entry.possible_peers.push(peer);
            }
        }
    }

    /// Stop tracking a message that arrived.
    pub fn complete(&mut self, id: &MessageId) {
        self.ongoing_receives.remove(id);
        self.ongoing_iwant_receives.remove(id);
    }

    /// Scrub a disconnected peer from alternate lists. Entries it was
    /// sending stay and run into their expiry.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        for entry in self
            .ongoing_receives
            .values_mut()
            .chain(self.ongoing_iwant_receives.values_mut())
        {
            entry.possible_peers.retain(|candidate| candidate != peer);
        }
    }

    /// Remove and return the expired entries of both stores.
    pub fn drain_expired(&mut self, now: Instant) -> (Vec<PreambleEntry>, Vec<PreambleEntry>) {
        let expired_ongoing: Vec<MessageId> = self
            .ongoing_receives
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        let expired_iwant: Vec<MessageId> = self
            .ongoing_iwant_receives
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        (
            expired_ongoing
                .iter()
                .filter_map(|id| self.ongoing_receives.remove(id))
                .collect(),
            expired_iwant
                .iter()
                .filter_map(|id| self.ongoing_iwant_receives.remove(id))
                .collect(),
        )
    }

    pub fn ongoing_len(&self) -> usize {
        self.ongoing_receives.len()
    }

    pub fn iwant_len(&self) -> usize {
        self.ongoing_iwant_receives.len()
    }
}

impl MeshManager {
    /// Handle a PREAMBLE announcement from a peer.
    pub fn handle_preamble(&mut self, from: &PeerId, preamble: &Preamble, now: Instant) {
        let id = preamble.message_id;
        let topic = preamble.topic_id.as_str();

        let Some(state) = self.peers.get_mut(from) else {
            return;
        };
        if state.preamble_budget <= 0 {
            debug!(peer = %from, "preamble budget exhausted, dropping");
            return;
        }
        state.preamble_budget -= 1;

        if state.he_is_sendings.contains_key(&id) {
            return;
        }
        if self.seen.has_seen(self.seen.salt(&id)) {
            return;
        }
        // A second announcement for a tracked id is dropped; a length
        // conflict is not treated as a violation.
        if self.preambles.tracks_ongoing(&id) {
            return;
        }

        state.he_is_sendings.insert(id, now);
        let bps = state.bandwidth.download_bps();
        let expires_at = now + receive_time(preamble.message_len, bps);
        let entry = PreambleEntry {
            message_id: id,
            topic: topic.to_string(),
            message_len: preamble.message_len,
            sender: *from,
            starts_at: now,
            expires_at,
            possible_peers: Vec::new(),
        };

        if !self.mesh.in_mesh(topic, from) {
            self.preambles.insert_iwant(entry);
            return;
        }
        self.preambles.insert_ongoing(entry);

        // Only announce onward for senders at least as fast as the
        // typical mesh recipient; slower ones would hold the mesh back.
        let median = self.median_download_rate(topic);
        if bps >= median {
            let recipients: Vec<PeerId> = self
                .mesh
                .mesh_peers(topic)
                .into_iter()
                .filter(|peer| peer != from && self.peers.kind(peer) == Some(PeerKind::V1_4))
                .collect();
            for peer in recipients {
                self.queue_control(
                    peer,
                    ControlMessage {
                        im_receivings: vec![ImReceiving {
                            message_id: id,
                            message_len: preamble.message_len,
                        }],
                        ..Default::default()
                    },
                    false,
                );
            }
        }
    }

    /// Handle an IMRECEIVING announcement from a peer.
    pub fn handle_im_receiving(&mut self, from: &PeerId, receiving: &ImReceiving) {
        if let Some(tracked) = self.preambles.tracked_length(&receiving.message_id) {
            if tracked != receiving.message_len {
                return;
            }
        }
        let max = self.params.max_he_is_receiving;
        if let Some(state) = self.peers.get_mut(from) {
            if state.he_is_receivings.len() >= max {
                return;
            }
            state
                .he_is_receivings
                .insert(receiving.message_id, receiving.message_len);
        }
    }

    /// Expiry sweep of both stores. Runs every 200 ms.
    pub fn preamble_heartbeat(&mut self, now: Instant) {
        let (expired_ongoing, expired_iwant) = self.preambles.drain_expired(now);

        for entry in expired_ongoing {
            warn!(peer = %entry.sender, id = %entry.message_id, topic = %entry.topic,
                "announced transmission never completed");
            self.peers.penalize(&entry.sender, BEHAVIOUR_PENALTY_STEP);
            self.metrics.inc_behaviour_penalty("preamble_expired");
            self.metrics.inc_preamble_expirations("ongoing");

            if self.params.enable_preamble_pull && self.retry_via_iwant(entry, now) {
                continue;
            }
            // No recovery possible within the mesh manager.
        }

        for entry in expired_iwant {
            debug!(id = %entry.message_id, topic = %entry.topic, "iwant reception expired");
            self.metrics.inc_preamble_expirations("iwant");
            self.push_event(MeshEvent::DeliveryFailed {
                topic: entry.topic,
                id: entry.message_id,
            });
        }
    }

    /// Ask a random alternate holder for an expired message. Returns
    /// `false` when no usable alternate remains.
    fn retry_via_iwant(&mut self, entry: PreambleEntry, now: Instant) -> bool {
        let candidates: Vec<PeerId> = entry
            .possible_peers
            .iter()
            .filter(|peer| {
                self.peers.is_connected(peer) && self.peers.kind(peer) == Some(PeerKind::V1_4)
            })
            .copied()
            .collect();
        let Some(alternate) = candidates.choose(&mut rand::thread_rng()).copied() else {
            self.push_event(MeshEvent::DeliveryFailed {
                topic: entry.topic,
                id: entry.message_id,
            });
            return false;
        };

        let has_budget = self
            .peers
            .get_mut(&alternate)
            .map(|state| {
                if state.iwant_budget > 0 {
                    state.iwant_budget -= 1;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !has_budget {
            self.push_event(MeshEvent::DeliveryFailed {
                topic: entry.topic,
                id: entry.message_id,
            });
            return false;
        }

        let bps = self
            .peers
            .get(&alternate)
            .map(|state| state.bandwidth.download_bps())
            .unwrap_or(0.0);
        let expires_at = now + receive_time(entry.message_len, bps);
        debug!(peer = %alternate, id = %entry.message_id, "retrying expired reception via iwant");

        self.queue_control(
            alternate,
            ControlMessage::iwant(IWant {
                message_ids: vec![entry.message_id],
            }),
            true,
        );

        let possible_peers = entry
            .possible_peers
            .into_iter()
            .filter(|peer| *peer != alternate)
            .collect();
        self.preambles.insert_iwant(PreambleEntry {
            message_id: entry.message_id,
            topic: entry.topic,
            message_len: entry.message_len,
            sender: alternate,
            starts_at: now,
            expires_at,
            possible_peers,
        });
        true
    }

    /// Median observed download rate across the topic's v1.4 mesh
    /// peers. Zero when none has been measured yet.
    fn median_download_rate(&self, topic: &str) -> f64 {
        let mut rates: Vec<f64> = self
            .mesh
            .mesh_peers(topic)
            .into_iter()
            .filter(|peer| self.peers.kind(peer) == Some(PeerKind::V1_4))
            .filter_map(|peer| self.peers.get(&peer))
            .map(|state| state.bandwidth.download_bps())
            .collect();
        if rates.is_empty() {
            return 0.0;
        }
        rates.sort_by(f64::total_cmp);
        let median = rates[rates.len() / 2];
        debug!(topic = %topic, median, "median mesh download rate");
        median
    }
}
