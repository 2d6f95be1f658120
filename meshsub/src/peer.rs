/// Peer State Store
///
/// Per-peer mutable state and the table that owns it. Topic role sets
/// hold peer ids only; every access to peer state goes through
/// [`PeerTable`], which simply answers "unknown" after a disconnect.
use std::collections::{HashMap, HashSet, VecDeque};
#[cfg(feature = "v1_4")]
use std::time::{Duration, Instant};

use crate::config::MeshsubParameters;
use crate::types::{MessageId, PeerId, PeerKind, SaltedId, TopicId};

/// IWANT messages we are willing to address to one peer between
/// heartbeats.
pub const IWANT_PEER_BUDGET: i32 = 25;

/// Smoothed estimate of a peer's download throughput.
///
/// Fed by observed transfer completions; consulted when estimating how
/// long an announced in-flight message will take to arrive.
#[cfg(feature = "v1_4")]
#[derive(Debug, Clone, Default)]
pub struct BandwidthTracking {
    download_bps: f64,
}

#[cfg(feature = "v1_4")]
impl BandwidthTracking {
    /// Current estimate in bytes per second. Zero means no observation
    /// yet.
    pub fn download_bps(&self) -> f64 {
        self.download_bps
    }

    /// Record a completed transfer of `bytes` over `elapsed`.
    pub fn record_download(&mut self, bytes: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            return;
        }
        let instant = bytes as f64 / secs;
        if self.download_bps <= f64::EPSILON {
            self.download_bps = instant;
        } else {
            self.download_bps = 0.7 * self.download_bps + 0.3 * instant;
        }
    }
}

/// Mutable state of a single known peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub score: f64,
    pub connected: bool,
    /// Whether we initiated the underlying connection.
    pub outbound: bool,
    /// Negotiated protocol variant.
    pub kind: PeerKind,

    /// Penalty accumulator increased on protocol violations; read by
    /// the external scoring subsystem.
    pub behaviour_penalty: f64,

    pub ihave_budget: i32,
    pub iwant_budget: i32,
    pub ping_budget: i32,
    pub preamble_budget: i32,

    /// Ids we advertised to this peer, one set per heartbeat
    /// generation, newest first.
    sent_ihaves: VecDeque<HashSet<MessageId>>,

    /// Salted ids the peer asked us not to send, one set per heartbeat
    /// generation, newest first.
    idontwants: VecDeque<HashSet<SaltedId>>,

    /// First-copy deliveries per topic since the last graft. Cleared
    /// when the peer is grafted so mesh delivery scoring restarts.
    deliveries: HashMap<TopicId, u64>,

    /// Messages this peer announced it is transmitting to us, keyed by
    /// id with the announcement time.
    #[cfg(feature = "v1_4")]
    pub he_is_sendings: HashMap<MessageId, Instant>,

    /// Messages this peer announced it is receiving from someone else,
    /// keyed by id with the declared length.
    #[cfg(feature = "v1_4")]
    pub he_is_receivings: HashMap<MessageId, usize>,

    #[cfg(feature = "v1_4")]
    pub bandwidth: BandwidthTracking,
}

impl PeerState {
    pub fn new(outbound: bool, kind: PeerKind, params: &MeshsubParameters) -> Self {
        let mut sent_ihaves = VecDeque::with_capacity(params.history_length);
        sent_ihaves.push_front(HashSet::new());
        let mut idontwants = VecDeque::with_capacity(params.history_length);
        idontwants.push_front(HashSet::new());

        Self {
            score: 0.0,
            connected: true,
            outbound,
            kind,
            behaviour_penalty: 0.0,
            ihave_budget: params.ihave_peer_budget,
            iwant_budget: IWANT_PEER_BUDGET,
            ping_budget: params.pings_peer_budget,
            preamble_budget: params.preamble_peer_budget,
            sent_ihaves,
            idontwants,
            deliveries: HashMap::new(),
            #[cfg(feature = "v1_4")]
            he_is_sendings: HashMap::new(),
            #[cfg(feature = "v1_4")]
            he_is_receivings: HashMap::new(),
            #[cfg(feature = "v1_4")]
            bandwidth: BandwidthTracking::default(),
        }
    }

    /// Open a fresh history generation and refill the budgets. Called
    /// once per heartbeat.
    pub fn heartbeat(&mut self, params: &MeshsubParameters) {
        self.sent_ihaves.push_front(HashSet::new());
        while self.sent_ihaves.len() > params.history_length {
            self.sent_ihaves.pop_back();
        }
        self.idontwants.push_front(HashSet::new());
        while self.idontwants.len() > params.history_length {
            self.idontwants.pop_back();
        }

        self.ihave_budget = params.ihave_peer_budget;
        self.iwant_budget = IWANT_PEER_BUDGET;
        self.ping_budget = params.pings_peer_budget;
        self.preamble_budget = params.preamble_peer_budget;
    }

    /// Record ids advertised to this peer in the current generation, so
    /// a later IWANT for them can be honored.
    pub fn record_sent_ihaves(&mut self, ids: &[MessageId]) {
        if let Some(current) = self.sent_ihaves.front_mut() {
            current.extend(ids.iter().copied());
        }
    }

    /// Redeem an advertisement: true exactly once per advertised id.
    ///
    /// An id is consumed on redemption, so repeated IWANTs for the same
    /// id count as invalid requests.
    pub fn take_advertised(&mut self, id: &MessageId) -> bool {
        for generation in self.sent_ihaves.iter_mut() {
            if generation.remove(id) {
                return true;
            }
        }
        false
    }

    /// Record a salted id the peer does not want. Returns false once
    /// the current generation is full; surplus ids are dropped.
    pub fn record_idontwant(&mut self, salted: SaltedId, max_count: usize) -> bool {
        match self.idontwants.front_mut() {
            Some(current) if current.len() < max_count => {
                current.insert(salted);
                true
            }
            _ => false,
        }
    }

    /// Whether the peer asked us not to send this message.
    pub fn wants_not(&self, salted: SaltedId) -> bool {
        self.idontwants.iter().any(|set| set.contains(&salted))
    }

    /// First-copy delivery bookkeeping for the scorer.
    pub fn record_delivery(&mut self, topic: &str) {
        *self.deliveries.entry(topic.to_string()).or_insert(0) += 1;
    }

    pub fn deliveries(&self, topic: &str) -> u64 {
        self.deliveries.get(topic).copied().unwrap_or(0)
    }

    /// Restart mesh delivery bookkeeping for a topic. Called when the
    /// peer is grafted so old counts do not carry over.
    pub fn clear_deliveries(&mut self, topic: &str) {
        self.deliveries.remove(topic);
    }

    pub fn history_lengths(&self) -> (usize, usize) {
        (self.sent_ihaves.len(), self.idontwants.len())
    }
}

/// Table of all currently known peers.
///
/// Entries are created on first observation and destroyed on
/// disconnect.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerState>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: PeerId, state: PeerState) {
        self.peers.insert(peer, state);
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerState> {
        self.peers.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerState> {
        self.peers.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn score(&self, peer: &PeerId) -> f64 {
        self.peers.get(peer).map(|p| p.score).unwrap_or(0.0)
    }

    pub fn is_outbound(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map(|p| p.outbound).unwrap_or(false)
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).map(|p| p.connected).unwrap_or(false)
    }

    pub fn kind(&self, peer: &PeerId) -> Option<PeerKind> {
        self.peers.get(peer).map(|p| p.kind)
    }

    pub fn update_score(&mut self, peer: &PeerId, score: f64) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.score = score;
        }
    }

    /// Charge a behaviour penalty for a detected protocol violation.
    pub fn penalize(&mut self, peer: &PeerId, amount: f64) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.behaviour_penalty += amount;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerState)> {
        self.peers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PeerId, &mut PeerState)> {
        self.peers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Roll every peer's history rings and budgets. Called once per
    /// heartbeat before any rebalancing.
    pub fn heartbeat(&mut self, params: &MeshsubParameters) {
        for state in self.peers.values_mut() {
            state.heartbeat(params);
        }
    }
}
