use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::control::{ControlMessage, IHave};
use crate::manager::MeshManager;
use crate::types::{MeshEvent, PeerId, TopicId};

impl MeshManager {
    /// One maintenance tick.
    ///
    /// Rolls per-peer history rings and budgets, rebalances every
    /// subscribed topic, ages fanout and backoff state, emits gossip
    /// and advances the message cache by one generation.
    pub fn heartbeat(&mut self, now: Instant) {
        self.peers.heartbeat(&self.params);

        let topics = self.mesh.mesh_topics();
        let mut low_peer_topics = 0i64;
        for topic in &topics {
            self.backoff.age_expired(topic, now);
            self.evict_negative_scores(topic, now);
            self.rebalance_topic(topic, now);

            let mesh_len = self.mesh.mesh_len(topic);
            if mesh_len < self.params.d_low {
                low_peer_topics += 1;
            }
            self.metrics.set_mesh_peers(topic, mesh_len as i64);
        }
        self.metrics.set_low_peer_topics(low_peer_topics);

        for topic in self.mesh.drop_stale_fanouts(now, self.params.fanout_ttl()) {
            debug!(topic = %topic, "dropped stale fanout");
        }
        self.replenish_fanouts();

        self.emit_gossip();
        self.mcache.shift();
        self.push_event(MeshEvent::HeartbeatCompleted);
    }

    /// Evict mesh peers whose score collapsed below zero.
    fn evict_negative_scores(&mut self, topic: &str, now: Instant) {
        let collapsed: Vec<PeerId> = self
            .mesh
            .mesh_peers(topic)
            .into_iter()
            .filter(|peer| self.peers.score(peer) < 0.0)
            .collect();
        for peer in collapsed {
            debug!(peer = %peer, topic = %topic, "evicting negative-score mesh peer");
            self.mesh.remove_from_mesh(topic, &peer);
            let prune = self.make_prune(topic, &peer, now);
            self.metrics.inc_prunes("negative_score");
            self.queue_control(peer, ControlMessage::prune(prune), true);
        }
    }

    /// Rebalance one topic's mesh toward D within [d_low, d_high],
    /// keeping the outbound floor and protecting high scorers.
    pub fn rebalance_topic(&mut self, topic: &str, now: Instant) {
        let mut rng = rand::thread_rng();
        let mut grafted: Vec<PeerId> = Vec::new();

        // Replenish toward D when under the low watermark.
        let mesh_len = self.mesh.mesh_len(topic);
        if mesh_len < self.params.d_low {
            let mut candidates = self.graft_candidates(topic, now, 0.0, false);
            candidates.shuffle(&mut rng);
            candidates.sort_by(|a, b| self.peers.score(b).total_cmp(&self.peers.score(a)));
            candidates.truncate(self.params.d - mesh_len);
            for peer in candidates {
                self.graft_peer(topic, &peer, now, "replenish");
                grafted.push(peer);
            }
        }

        // Keep the outbound floor independent of total size.
        let outbound_in_mesh = self.outbound_mesh_count(topic);
        if outbound_in_mesh < self.params.d_out {
            let mut candidates = self.graft_candidates(topic, now, 0.0, true);
            candidates.shuffle(&mut rng);
            candidates.sort_by(|a, b| self.peers.score(b).total_cmp(&self.peers.score(a)));
            candidates.truncate(self.params.d_out - outbound_in_mesh);
            for peer in candidates {
                self.graft_peer(topic, &peer, now, "outbound_quota");
                grafted.push(peer);
            }
        }

        // Prune back to D above the high watermark.
        let mesh_len = self.mesh.mesh_len(topic);
        if mesh_len > self.params.d_high {
            let grafted_now: HashSet<PeerId> = grafted.iter().copied().collect();
            let mut candidates: Vec<PeerId> = self
                .mesh
                .mesh_peers(topic)
                .into_iter()
                .filter(|peer| !grafted_now.contains(peer))
                .collect();
            candidates.shuffle(&mut rng);
            candidates.sort_by(|a, b| self.peers.score(a).total_cmp(&self.peers.score(b)));

            // The d_score highest scorers are never pruned for size.
            let pool_len = candidates.len().saturating_sub(self.params.d_score);
            candidates.truncate(pool_len);

            // Of the remaining pool, cap outbound prunes so the floor
            // survives.
            let max_outbound_prunes = self
                .outbound_mesh_count(topic)
                .saturating_sub(self.params.d_out);
            let (mut outbound_pool, inbound_pool): (Vec<PeerId>, Vec<PeerId>) = candidates
                .into_iter()
                .partition(|peer| self.peers.is_outbound(peer));
            outbound_pool.truncate(max_outbound_prunes);

            let mut to_prune = inbound_pool;
            to_prune.extend(outbound_pool);
            let excess = mesh_len - self.params.d;
            if to_prune.len() > excess {
                to_prune.shuffle(&mut rng);
                to_prune.truncate(excess);
            }

            for peer in to_prune {
                self.mesh.remove_from_mesh(topic, &peer);
                let prune = self.make_prune(topic, &peer, now);
                self.metrics.inc_prunes("dhigh");
                self.queue_control(peer, ControlMessage::prune(prune), true);
            }
        }

        // Opportunistic grafting: when the median mesh score sags,
        // pull in better peers regardless of size.
        let mesh_peers = self.mesh.mesh_peers(topic);
        if mesh_peers.len() > 1 {
            let mut by_score = mesh_peers;
            by_score.sort_by(|a, b| self.peers.score(b).total_cmp(&self.peers.score(a)));
            let median = self.peers.score(&by_score[by_score.len() / 2]);
            if median < self.params.opportunistic_graft_threshold {
                let candidates = self.graft_candidates(topic, now, median, false);
                let chosen: Vec<PeerId> = candidates
                    .choose_multiple(&mut rng, self.params.max_opportunistic_graft_peers)
                    .copied()
                    .collect();
                for peer in chosen {
                    debug!(peer = %peer, topic = %topic, median, "opportunistically grafting");
                    self.graft_peer(topic, &peer, now, "opportunistic");
                    grafted.push(peer);
                }
            }
        }

        for peer in grafted {
            self.queue_control(peer, ControlMessage::graft(topic.to_string()), true);
        }
    }

    /// Peers of a topic eligible for grafting: connected, scored at
    /// least `min_score`, outside the mesh, not direct and not under a
    /// live backoff.
    fn graft_candidates(
        &self,
        topic: &str,
        now: Instant,
        min_score: f64,
        outbound_only: bool,
    ) -> Vec<PeerId> {
        self.mesh
            .topic_peers(topic)
            .filter(|peer| {
                self.peers.is_connected(peer)
                    && self.peers.score(peer) >= min_score
                    && !self.mesh.in_mesh(topic, peer)
                    && !self.direct_peers.contains(peer)
                    && !self.backoff.is_backing_off(topic, peer, now, Duration::ZERO)
                    && (!outbound_only || self.peers.is_outbound(peer))
            })
            .copied()
            .collect()
    }

    /// Keep surviving fanouts usable: drop members that went away and
    /// fill back toward D.
    fn replenish_fanouts(&mut self) {
        let mut rng = rand::thread_rng();
        for topic in self.mesh.fanout_topics() {
            let members = self.mesh.fanout_peers(&topic);
            for peer in &members {
                let keep = self.peers.is_connected(peer)
                    && self.peers.score(peer) >= self.params.publish_threshold;
                if !keep {
                    if let Some(entry) = self.mesh.get_fanout_mut(&topic) {
                        entry.peers.remove(peer);
                    }
                }
            }

            let current: HashSet<PeerId> = self.mesh.fanout_peers(&topic).into_iter().collect();
            if current.len() >= self.params.d {
                continue;
            }
            let candidates: Vec<PeerId> = self
                .mesh
                .topic_peers(&topic)
                .filter(|peer| {
                    !current.contains(peer)
                        && !self.direct_peers.contains(peer)
                        && self.peers.is_connected(peer)
                        && self.peers.score(peer) >= self.params.publish_threshold
                })
                .copied()
                .collect();
            let chosen: Vec<PeerId> = candidates
                .choose_multiple(&mut rng, self.params.d - current.len())
                .copied()
                .collect();
            if let Some(entry) = self.mesh.get_fanout_mut(&topic) {
                entry.peers.extend(chosen);
            }
        }
    }

    /// Advertise the retained message window to sampled peers outside
    /// the mesh and fanout.
    fn emit_gossip(&mut self) {
        let mut rng = rand::thread_rng();
        let mut topics: Vec<TopicId> = self.mesh.mesh_topics();
        for topic in self.mesh.fanout_topics() {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }

        for topic in topics {
            let mut ids = self.mcache.window(&topic);
            if ids.is_empty() {
                continue;
            }
            if ids.len() > self.params.ihave_max_length {
                ids.shuffle(&mut rng);
                ids.truncate(self.params.ihave_max_length);
            }

            let mesh_set: HashSet<PeerId> = self.mesh.mesh_peers(&topic).into_iter().collect();
            let fanout_set: HashSet<PeerId> = self.mesh.fanout_peers(&topic).into_iter().collect();
            let mut candidates: Vec<PeerId> = self
                .mesh
                .topic_peers(&topic)
                .filter(|peer| {
                    !self.direct_peers.contains(peer)
                        && !mesh_set.contains(peer)
                        && !fanout_set.contains(peer)
                        && self.peers.is_connected(peer)
                        && self.peers.score(peer) >= self.params.gossip_threshold
                })
                .copied()
                .collect();

            let target = std::cmp::max(
                self.params.d_lazy,
                (self.params.gossip_factor * candidates.len() as f64) as usize,
            );
            candidates.shuffle(&mut rng);
            candidates.truncate(target);

            for peer in candidates {
                // Remember what was advertised so the peer's IWANT can
                // be honored later.
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.record_sent_ihaves(&ids);
                }
                self.metrics.inc_gossip_ihaves_sent(1);
                self.queue_control(
                    peer,
                    ControlMessage::ihave(IHave {
                        topic_id: topic.clone(),
                        message_ids: ids.clone(),
                    }),
                    false,
                );
            }
        }
    }
}
