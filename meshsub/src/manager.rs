use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use metrics::SharedMetrics;
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::backoff::BackoffTable;
use crate::config::MeshsubParameters;
use crate::control::{ControlMessage, Graft, IDontWant, IHave, IWant, PeerInfo, Prune};
use crate::mcache::{CachedMessage, MessageCache};
use crate::mesh::MeshState;
use crate::peer::{PeerState, PeerTable};
#[cfg(feature = "v1_4")]
use crate::preamble::PreambleTracker;
use crate::types::{
    MeshEvent, MessageId, PeerId, PeerKind, SharedRecordBook, SharedSeenRegistry,
};

/// Penalty charged for each detected protocol violation.
pub const BEHAVIOUR_PENALTY_STEP: f64 = 0.1;

/// Invalid ids tolerated in one IWANT RPC before the whole response is
/// discarded.
const MAX_IWANT_INVALID_REQUESTS: usize = 20;

/// A control message waiting to be written to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundControl {
    pub peer: PeerId,
    pub message: ControlMessage,
    /// Membership signals must not be dropped under queue pressure;
    /// gossip may.
    pub high_priority: bool,
}

/// The mesh manager.
///
/// Owns every membership table and transforms inbound control messages
/// and heartbeat ticks into table mutations plus outbound control
/// messages. All mutation happens on the caller's task; outbound
/// messages and events accumulate in drains so that state is fully
/// settled before anything is written to the network.
pub struct MeshManager {
    pub(crate) params: MeshsubParameters,
    pub(crate) peers: PeerTable,
    pub(crate) mesh: MeshState,
    pub(crate) backoff: BackoffTable,
    pub(crate) mcache: MessageCache,
    pub(crate) seen: SharedSeenRegistry,
    pub(crate) records: SharedRecordBook,
    pub(crate) metrics: SharedMetrics,
    pub(crate) direct_peers: HashSet<PeerId>,
    outbox: VecDeque<OutboundControl>,
    events: VecDeque<MeshEvent>,
    #[cfg(feature = "v1_4")]
    pub(crate) preambles: PreambleTracker,
}

impl MeshManager {
    pub fn new(
        params: MeshsubParameters,
        seen: SharedSeenRegistry,
        records: SharedRecordBook,
        metrics: SharedMetrics,
    ) -> Self {
        let direct_peers = params
            .direct_peers
            .iter()
            .filter_map(|raw| match raw.parse::<PeerId>() {
                Ok(peer) => Some(peer),
                Err(err) => {
                    warn!("ignoring unparseable direct peer id {raw:?}: {err}");
                    None
                }
            })
            .collect();

        Self {
            mcache: MessageCache::new(params.history_length),
            peers: PeerTable::new(),
            mesh: MeshState::new(),
            backoff: BackoffTable::new(),
            seen,
            records,
            metrics,
            direct_peers,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            #[cfg(feature = "v1_4")]
            preambles: PreambleTracker::new(),
            params,
        }
    }

    pub fn params(&self) -> &MeshsubParameters {
        &self.params
    }

    pub fn mesh(&self) -> &MeshState {
        &self.mesh
    }

    pub fn backoff(&self) -> &BackoffTable {
        &self.backoff
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn mcache(&self) -> &MessageCache {
        &self.mcache
    }

    pub fn is_direct(&self, peer: &PeerId) -> bool {
        self.direct_peers.contains(peer)
    }

    /// Take the control messages accumulated since the last drain.
    pub fn drain_outbox(&mut self) -> Vec<OutboundControl> {
        self.outbox.drain(..).collect()
    }

    /// Take the events accumulated since the last drain.
    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn queue_control(&mut self, peer: PeerId, message: ControlMessage, high_priority: bool) {
        self.outbox.push_back(OutboundControl {
            peer,
            message,
            high_priority,
        });
    }

    pub(crate) fn push_event(&mut self, event: MeshEvent) {
        self.events.push_back(event);
    }

    // -------------------------------------------------------------------------
    // Peer lifecycle
    // -------------------------------------------------------------------------

    /// Note a new connection. Creates peer state on first observation.
    pub fn peer_connected(&mut self, peer: PeerId, outbound: bool, kind: PeerKind) {
        match self.peers.get_mut(&peer) {
            Some(state) => {
                state.connected = true;
                state.outbound = outbound;
                state.kind = kind;
            }
            None => {
                self.peers.insert(peer, PeerState::new(outbound, kind, &self.params));
            }
        }
        debug!(peer = %peer, %kind, outbound, "peer connected");
    }

    /// Destroy a peer's state and purge it from every role set. Backoff
    /// entries survive so a quick reconnect cannot evade an embargo.
    pub fn peer_disconnected(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.mesh.remove_peer(peer);
        #[cfg(feature = "v1_4")]
        self.preambles.remove_peer(peer);
        debug!(peer = %peer, "peer disconnected");
    }

    pub fn peer_subscribed(&mut self, peer: &PeerId, topic: &str) {
        self.mesh.peer_subscribed(topic, *peer);
    }

    pub fn peer_unsubscribed(&mut self, peer: &PeerId, topic: &str) {
        self.mesh.peer_unsubscribed(topic, peer);
    }

    /// Push an externally computed score for a peer. Collapse below
    /// zero is acted on at the next heartbeat.
    pub fn update_score(&mut self, peer: &PeerId, score: f64) {
        self.peers.update_score(peer, score);
    }

    /// Read a peer's behaviour penalty accumulator; consumed by the
    /// scoring subsystem.
    pub fn behaviour_penalty(&self, peer: &PeerId) -> f64 {
        self.peers.get(peer).map(|p| p.behaviour_penalty).unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Topic lifecycle and publishing
    // -------------------------------------------------------------------------

    /// Subscribe to a topic. Fanout peers are promoted into the mesh
    /// and grafted; the mesh is then filled toward D.
    pub fn subscribe(&mut self, topic: &str, now: Instant) {
        let promoted = self.mesh.subscribe(topic.to_string(), now);
        for peer in promoted {
            if let Some(state) = self.peers.get_mut(&peer) {
                state.clear_deliveries(topic);
            }
            self.metrics.inc_grafts("fanout_promotion");
            self.queue_control(peer, ControlMessage::graft(topic.to_string()), true);
        }
        self.rebalance_topic(topic, now);
    }

    /// Unsubscribe from a topic, pruning every mesh member.
    pub fn unsubscribe(&mut self, topic: &str, now: Instant) {
        let members = self.mesh.unsubscribe(topic);
        for peer in members {
            let prune = self.make_prune(topic, &peer, now);
            self.metrics.inc_prunes("unsubscribe");
            self.queue_control(peer, ControlMessage::prune(prune), true);
        }
        self.metrics.remove_mesh_topic(topic);
    }

    /// Record a locally published message and return the peers it
    /// should be forwarded to: the mesh for subscribed topics, the
    /// fanout otherwise.
    pub fn publish(&mut self, topic: &str, id: MessageId, data: Vec<u8>, now: Instant) -> Vec<PeerId> {
        self.mcache.add(topic.to_string(), id, data);
        let salted = self.seen.salt(&id);

        let mut targets = if self.mesh.is_subscribed(topic) {
            self.mesh.mesh_peers(topic)
        } else {
            self.publish_fanout(topic, now)
        };

        // Direct peers receive everything we publish, mesh or not.
        for peer in &self.direct_peers {
            let subscribed = self.mesh.topic_peers(topic).any(|p| p == peer);
            if subscribed && !targets.contains(peer) {
                targets.push(*peer);
            }
        }

        targets.retain(|peer| {
            self.peers.is_connected(peer)
                && self.peers.score(peer) >= self.params.publish_threshold
                && !self
                    .peers
                    .get(peer)
                    .map(|state| state.wants_not(salted))
                    .unwrap_or(false)
        });
        trace!(topic = %topic, id = %id, peers = targets.len(), "publish targets selected");
        targets
    }

    /// Touch the fanout of a publish-only topic and fill it toward D.
    fn publish_fanout(&mut self, topic: &str, now: Instant) -> Vec<PeerId> {
        let d = self.params.d;
        let existing = {
            let entry = self.mesh.fanout_entry(topic, now);
            entry.last_published = now;
            entry.peers.len()
        };

        if existing < d {
            let current: HashSet<PeerId> = self.mesh.fanout_peers(topic).into_iter().collect();
            let mut candidates: Vec<PeerId> = self
                .mesh
                .topic_peers(topic)
                .filter(|peer| {
                    !current.contains(peer)
                        && !self.direct_peers.contains(peer)
                        && self.peers.is_connected(peer)
                        && self.peers.score(peer) >= self.params.publish_threshold
                })
                .copied()
                .collect();
            let mut rng = rand::thread_rng();
            candidates.shuffle(&mut rng);
            candidates.truncate(d - existing);
            if let Some(entry) = self.mesh.get_fanout_mut(topic) {
                entry.peers.extend(candidates);
            }
        }

        self.mesh.fanout_peers(topic)
    }

    /// Note a message delivered by a peer.
    ///
    /// Feeds mesh delivery bookkeeping, closes any in-flight preamble
    /// tracking, and suppresses redundant copies of large messages via
    /// IDONTWANT.
    #[cfg_attr(not(feature = "v1_4"), allow(unused_variables))]
    pub fn message_received(
        &mut self,
        from: &PeerId,
        topic: &str,
        id: MessageId,
        length: usize,
        now: Instant,
    ) {
        if self.mesh.in_mesh(topic, from) {
            if let Some(state) = self.peers.get_mut(from) {
                state.record_delivery(topic);
            }
        }

        #[cfg(feature = "v1_4")]
        {
            if let Some(state) = self.peers.get_mut(from) {
                if let Some(started) = state.he_is_sendings.remove(&id) {
                    state
                        .bandwidth
                        .record_download(length, now.saturating_duration_since(started));
                }
            }
            self.preambles.complete(&id);
        }

        if length > self.params.idontwant_message_size_threshold {
            let suppress: Vec<PeerId> = self
                .mesh
                .mesh_peers(topic)
                .into_iter()
                .filter(|peer| {
                    peer != from
                        && self
                            .peers
                            .kind(peer)
                            .map(|kind| kind >= PeerKind::V1_2)
                            .unwrap_or(false)
                })
                .collect();
            for peer in suppress {
                self.queue_control(
                    peer,
                    ControlMessage {
                        idontwants: vec![IDontWant {
                            message_ids: vec![id],
                        }],
                        ..Default::default()
                    },
                    false,
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Control handlers
    // -------------------------------------------------------------------------

    /// Handle one inbound control RPC. Returns the cached messages an
    /// IWANT asked for; the reply control message is queued on the
    /// outbox once all tables are settled.
    pub fn handle_control(
        &mut self,
        from: &PeerId,
        message: ControlMessage,
        now: Instant,
    ) -> Vec<CachedMessage> {
        if !self.peers.contains(from) {
            warn!(peer = %from, "control message from unknown peer, dropping");
            return Vec::new();
        }

        let prunes = self.handle_graft(from, &message.grafts, now);
        self.handle_prune(from, &message.prunes, now);
        let mut reply = ControlMessage {
            prunes,
            ..Default::default()
        };
        if let Some(iwant) = self.handle_ihave(from, &message.ihaves) {
            reply.iwants.push(iwant);
        }
        let served = self.handle_iwant(from, &message.iwants);
        self.handle_idontwant(from, &message.idontwants);

        #[cfg(feature = "v1_4")]
        {
            for preamble in &message.preambles {
                self.handle_preamble(from, preamble, now);
            }
            for receiving in &message.im_receivings {
                self.handle_im_receiving(from, receiving);
            }
        }

        if !reply.is_empty() {
            self.queue_control(*from, reply, true);
        }
        served
    }

    /// Handle GRAFTs from a peer, producing the corrective PRUNEs.
    pub fn handle_graft(&mut self, from: &PeerId, grafts: &[Graft], now: Instant) -> Vec<Prune> {
        let mut prunes = Vec::new();
        let slack = self.params.backoff_slack();

        for graft in grafts {
            let topic = graft.topic_id.as_str();

            // Direct peerings are fixed by configuration; grafting one
            // is a violation.
            if self.direct_peers.contains(from) {
                warn!(peer = %from, topic = %topic, "graft from direct peer");
                self.peers.penalize(from, BEHAVIOUR_PENALTY_STEP);
                self.metrics.inc_behaviour_penalty("graft_direct");
                self.backoff
                    .set_interval(topic, from, now, self.params.prune_backoff());
                prunes.push(Prune {
                    topic_id: topic.to_string(),
                    peers: Vec::new(),
                    backoff_secs: self.params.prune_backoff_secs,
                });
                continue;
            }

            if self.mesh.in_mesh(topic, from) {
                continue;
            }

            // The embargo check tolerates twice the slack so an honest
            // peer with skewed clocks is not penalized for a race with
            // our own prune.
            if self.backoff.is_backing_off(topic, from, now, slack * 2) {
                warn!(peer = %from, topic = %topic, "graft during backoff");
                self.peers.penalize(from, BEHAVIOUR_PENALTY_STEP);
                self.metrics.inc_behaviour_penalty("graft_during_backoff");
                self.backoff
                    .set_interval(topic, from, now, self.params.prune_backoff());
                prunes.push(Prune {
                    topic_id: topic.to_string(),
                    peers: Vec::new(),
                    backoff_secs: self.params.prune_backoff_secs,
                });
                continue;
            }

            if self.peers.score(from) < self.params.publish_threshold {
                debug!(peer = %from, topic = %topic, "ignoring graft from low-scored peer");
                continue;
            }

            if !self.mesh.is_subscribed(topic) {
                trace!(peer = %from, topic = %topic, "graft for unsubscribed topic");
                continue;
            }

            let outbound_in_mesh = self.outbound_mesh_count(topic);
            let accept = self.mesh.mesh_len(topic) < self.params.d_high
                || (self.peers.is_outbound(from) && outbound_in_mesh < self.params.d_out);
            if accept {
                self.graft_peer(topic, from, now, "remote");
            } else {
                let prune = self.make_prune(topic, from, now);
                self.metrics.inc_prunes("graft_rejected");
                prunes.push(prune);
            }
        }

        prunes
    }

    /// Handle PRUNEs from a peer.
    pub fn handle_prune(&mut self, from: &PeerId, prunes: &[Prune], now: Instant) {
        for prune in prunes {
            let topic = prune.topic_id.as_str();

            // Respect the requested embargo, padded by the slack and
            // clamped; never shorten an existing one.
            let base = if prune.backoff_secs == 0 {
                self.params.prune_backoff()
            } else {
                Duration::from_secs(prune.backoff_secs)
            };
            self.backoff
                .set_interval(topic, from, now, base + self.params.backoff_slack());

            if self.mesh.remove_from_mesh(topic, from) {
                debug!(peer = %from, topic = %topic, "pruned from mesh by peer");
                self.metrics.inc_prunes("remote");
            }

            if prune.peers.is_empty() || self.peers.score(from) <= self.params.gossip_threshold {
                continue;
            }

            let mut valid = Vec::new();
            for info in &prune.peers {
                match &info.signed_record {
                    Some(record) if record.peer_id != info.peer_id => {
                        warn!(peer = %from, topic = %topic,
                            claimed = %info.peer_id, actual = %record.peer_id,
                            "discarding peer-exchange record with mismatched id");
                    }
                    _ => valid.push(info.clone()),
                }
            }
            if !valid.is_empty() {
                self.push_event(MeshEvent::PeerExchange {
                    topic: topic.to_string(),
                    peers: valid,
                });
            }
        }
    }

    /// Handle IHAVEs from a peer, producing at most one IWANT.
    pub fn handle_ihave(&mut self, from: &PeerId, ihaves: &[IHave]) -> Option<IWant> {
        if ihaves.is_empty() {
            return None;
        }

        let advertised: u64 = ihaves.iter().map(|i| i.message_ids.len() as u64).sum();
        if self.peers.score(from) < self.params.gossip_threshold {
            debug!(peer = %from, "ignoring ihave from low-scored peer");
            self.metrics.inc_received_ihaves("low_score", advertised);
            return None;
        }

        let Some(state) = self.peers.get_mut(from) else {
            return None;
        };
        if state.ihave_budget <= 0 {
            debug!(peer = %from, "ihave budget exhausted");
            self.metrics.inc_received_ihaves("no_budget", advertised);
            return None;
        }
        let mut budget = state.ihave_budget;

        let mut want = Vec::new();
        let mut dedup = HashSet::new();
        #[cfg(feature = "v1_4")]
        let mut tracked = Vec::new();

        'collect: for ihave in ihaves {
            if !self.mesh.is_subscribed(&ihave.topic_id) {
                continue;
            }
            for id in &ihave.message_ids {
                if budget <= 0 {
                    break 'collect;
                }
                if !dedup.insert(*id) {
                    continue;
                }
                if self.seen.has_seen(self.seen.salt(id)) {
                    continue;
                }
                #[cfg(feature = "v1_4")]
                if self.preambles.is_tracking(id) {
                    self.metrics.inc_preamble_saved_iwants();
                    tracked.push(*id);
                    continue;
                }
                want.push(*id);
                budget -= 1;
            }
        }

        #[cfg(feature = "v1_4")]
        for id in tracked {
            self.preambles.register_alternate(&id, *from);
        }

        let state = self
            .peers
            .get_mut(from)
            .expect("peer table is not mutated while collecting ihave ids");
        state.ihave_budget = budget;

        if want.is_empty() {
            return None;
        }
        if state.iwant_budget <= 0 {
            debug!(peer = %from, "iwant budget exhausted, not asking");
            return None;
        }
        state.iwant_budget -= 1;

        self.metrics.inc_received_ihaves("accepted", want.len() as u64);
        // Shuffle so a truncating remote cannot bias which ids we pull.
        want.shuffle(&mut rand::thread_rng());
        Some(IWant { message_ids: want })
    }

    /// Handle IWANTs from a peer, returning the cached messages to
    /// forward.
    pub fn handle_iwant(&mut self, from: &PeerId, iwants: &[IWant]) -> Vec<CachedMessage> {
        if iwants.is_empty() {
            return Vec::new();
        }
        if self.peers.score(from) < self.params.gossip_threshold {
            debug!(peer = %from, "ignoring iwant from low-scored peer");
            return Vec::new();
        }

        let mut served = Vec::new();
        let mut unknown = 0u64;
        let mut invalid = 0usize;

        for iwant in iwants {
            for id in &iwant.message_ids {
                // An id is redeemable exactly once; replays and ids we
                // never advertised count as invalid but still consume
                // their opportunity.
                let redeemed = self
                    .peers
                    .get_mut(from)
                    .map(|state| state.take_advertised(id))
                    .unwrap_or(false);
                if !redeemed {
                    invalid += 1;
                    if invalid > MAX_IWANT_INVALID_REQUESTS {
                        warn!(peer = %from, invalid, "too many invalid iwant ids, discarding response");
                        self.metrics.inc_received_iwants("skipped", 1);
                        return Vec::new();
                    }
                    continue;
                }

                match self.mcache.get(id) {
                    Some(message) => served.push(message.clone()),
                    None => unknown += 1,
                }
            }
        }

        self.metrics.inc_received_iwants("served", served.len() as u64);
        if unknown > 0 {
            self.metrics.inc_received_iwants("unknown", unknown);
        }
        served
    }

    /// Handle IDONTWANTs from a peer.
    pub fn handle_idontwant(&mut self, from: &PeerId, idontwants: &[IDontWant]) {
        let max_count = self.params.idontwant_max_count;
        for message in idontwants {
            for id in &message.message_ids {
                let salted = self.seen.salt(id);
                let recorded = self
                    .peers
                    .get_mut(from)
                    .map(|state| state.record_idontwant(salted, max_count))
                    .unwrap_or(false);
                if !recorded {
                    // Current generation is full; the rest of this
                    // message is dropped.
                    break;
                }
                #[cfg(feature = "v1_4")]
                {
                    if let Some(state) = self.peers.get_mut(from) {
                        state.he_is_receivings.remove(id);
                    }
                    self.preambles.register_alternate(id, *from);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shared helpers
    // -------------------------------------------------------------------------

    pub(crate) fn outbound_mesh_count(&self, topic: &str) -> usize {
        self.mesh
            .mesh_peers(topic)
            .iter()
            .filter(|peer| self.peers.is_outbound(peer))
            .count()
    }

    /// Insert a peer into a topic's mesh, restarting its delivery
    /// bookkeeping.
    pub(crate) fn graft_peer(&mut self, topic: &str, peer: &PeerId, now: Instant, reason: &str) {
        if self.mesh.add_to_mesh(topic, *peer, now) {
            if let Some(state) = self.peers.get_mut(peer) {
                state.clear_deliveries(topic);
            }
            self.metrics.inc_grafts(reason);
            debug!(peer = %peer, topic = %topic, reason, "grafted peer");
        }
    }

    /// Build the PRUNE for evicting `peer` from `topic` and install the
    /// matching backoff.
    pub(crate) fn make_prune(&mut self, topic: &str, peer: &PeerId, now: Instant) -> Prune {
        self.backoff
            .set_interval(topic, peer, now, self.params.prune_backoff());
        let peers = if self.params.enable_px {
            self.peer_exchange_list(topic)
        } else {
            Vec::new()
        };
        Prune {
            topic_id: topic.to_string(),
            peers,
            backoff_secs: self.params.prune_backoff_secs,
        }
    }

    /// Candidates offered to an evicted peer: non-negative-score topic
    /// peers, capped at twice the high watermark, with signed records
    /// where available.
    pub(crate) fn peer_exchange_list(&self, topic: &str) -> Vec<PeerInfo> {
        let mut candidates: Vec<PeerId> = self
            .mesh
            .topic_peers(topic)
            .filter(|peer| self.peers.is_connected(peer) && self.peers.score(peer) >= 0.0)
            .copied()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(2 * self.params.d_high);
        candidates
            .into_iter()
            .map(|peer_id| PeerInfo {
                signed_record: self.records.lookup(&peer_id),
                peer_id,
            })
            .collect()
    }
}
