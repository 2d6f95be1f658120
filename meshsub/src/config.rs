/// Mesh Manager Parameters
///
/// Configuration parameters controlling mesh topology, gossip and
/// budgets.
///
/// ## Overview
///
/// Each subscribed topic maintains a mesh of peers for full message
/// exchange. These parameters tune the mesh size, the timing of the
/// maintenance heartbeat, the lazy gossip layer and the per-peer
/// budgets that bound what a remote may ask of us.
///
/// ## Parameter Categories
///
/// **Mesh degree (D parameters):**
///
/// ```text
/// d_low <= d <= d_high
///
/// d        Target mesh size (6)
/// d_low    Minimum before grafting new peers (5)
/// d_high   Maximum before pruning excess peers (12)
/// d_out    Outbound-connection floor inside the mesh (2)
/// d_score  High-score peers protected from pruning (4)
/// d_lazy   Minimum peers to gossip IHAVE messages to (6)
/// ```
///
/// **Timing:**
///
/// ```text
/// heartbeat_interval_secs   Mesh maintenance frequency (1s)
/// prune_backoff_secs        Re-graft embargo after a PRUNE (60s)
/// fanout_ttl_secs           How long to keep idle fanout peers (60s)
/// backoff_slack_secs        Tolerance for clock skew and reordering (2s)
/// ```
///
/// **Score thresholds:**
///
/// The score itself is computed elsewhere; the mesh manager only
/// compares it against these thresholds when accepting grafts,
/// exchanging gossip and grafting opportunistically.
///
/// ## References
///
/// - Gossipsub v1.1: <https://github.com/libp2p/specs/blob/master/pubsub/gossipsub/gossipsub-v1.1.md>
/// - Gossipsub v1.2: <https://github.com/libp2p/specs/blob/master/pubsub/gossipsub/gossipsub-v1.2.md>
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Core mesh manager configuration.
///
/// Default values follow the upstream gossipsub parameter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshsubParameters {
    // -------------------------------------------------------------------------
    // Mesh Degree Parameters
    // -------------------------------------------------------------------------

    /// Target number of mesh peers per topic.
    #[serde(default = "default_d")]
    pub d: usize,

    /// Minimum mesh peers before the heartbeat grafts back up to `d`.
    #[serde(default = "default_d_low")]
    pub d_low: usize,

    /// Maximum mesh peers before the heartbeat prunes back down to `d`.
    #[serde(default = "default_d_high")]
    pub d_high: usize,

    /// Minimum number of outbound-connection peers kept in each mesh.
    ///
    /// Guards against an attacker filling the mesh with inbound
    /// connections.
    #[serde(default = "default_d_out")]
    pub d_out: usize,

    /// Number of highest-scoring mesh peers never pruned for size.
    #[serde(default = "default_d_score")]
    pub d_score: usize,

    /// Minimum number of non-mesh peers receiving IHAVE gossip.
    #[serde(default = "default_d_lazy")]
    pub d_lazy: usize,

    /// Fraction of eligible non-mesh peers receiving IHAVE gossip,
    /// whichever of `d_lazy` and the fraction is larger.
    #[serde(default = "default_gossip_factor")]
    pub gossip_factor: f64,

    // -------------------------------------------------------------------------
    // Timing Parameters
    // -------------------------------------------------------------------------

    /// Interval between heartbeat ticks in seconds.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: f64,

    /// Backoff installed when pruning a peer, in seconds. The peer must
    /// not be grafted again before it elapses.
    #[serde(default = "default_prune_backoff_secs")]
    pub prune_backoff_secs: u64,

    /// Time-to-live for fanout entries in seconds.
    #[serde(default = "default_fanout_ttl_secs")]
    pub fanout_ttl_secs: u64,

    /// Slack subtracted from backoff comparisons to tolerate clock skew
    /// and message reordering, in seconds.
    #[serde(default = "default_backoff_slack_secs")]
    pub backoff_slack_secs: u64,

    // -------------------------------------------------------------------------
    // History and Gossip Parameters
    // -------------------------------------------------------------------------

    /// Number of heartbeat generations kept in the message cache and in
    /// the per-peer IHAVE/IDONTWANT history rings.
    #[serde(default = "default_history_length")]
    pub history_length: usize,

    /// Maximum number of ids advertised in one IHAVE.
    #[serde(default = "default_ihave_max_length")]
    pub ihave_max_length: usize,

    /// Maximum number of ids accepted from one IDONTWANT message.
    #[serde(default = "default_idontwant_max_count")]
    pub idontwant_max_count: usize,

    /// Minimum message size in bytes to trigger IDONTWANT emission.
    ///
    /// Suppressing tiny messages costs more than the duplicate.
    #[serde(default = "default_idontwant_threshold")]
    pub idontwant_message_size_threshold: usize,

    // -------------------------------------------------------------------------
    // Score Thresholds
    // -------------------------------------------------------------------------

    /// Below this score a peer's grafts are ignored and it receives no
    /// published messages.
    #[serde(default = "default_publish_threshold")]
    pub publish_threshold: f64,

    /// Below this score no gossip is exchanged with a peer.
    #[serde(default = "default_gossip_threshold")]
    pub gossip_threshold: f64,

    /// When the median mesh score drops below this value, the heartbeat
    /// grafts better-scored peers opportunistically.
    #[serde(default = "default_opportunistic_graft_threshold")]
    pub opportunistic_graft_threshold: f64,

    /// Maximum peers grafted by one opportunistic grafting round.
    #[serde(default = "default_max_opportunistic_graft_peers")]
    pub max_opportunistic_graft_peers: usize,

    // -------------------------------------------------------------------------
    // Peer Exchange
    // -------------------------------------------------------------------------

    /// Attach a peer-exchange list to emitted PRUNEs.
    #[serde(default)]
    pub enable_px: bool,

    /// Base58 peer ids of direct peerings.
    ///
    /// Direct peers are fixed by operators, never appear in any mesh or
    /// fanout, and may not GRAFT us.
    #[serde(default)]
    pub direct_peers: Vec<String>,

    // -------------------------------------------------------------------------
    // Per-Peer Budgets (refilled each heartbeat)
    // -------------------------------------------------------------------------

    /// IHAVE ids accepted from one peer between heartbeats.
    #[serde(default = "default_ihave_peer_budget")]
    pub ihave_peer_budget: i32,

    /// Preamble announcements accepted from one peer between heartbeats.
    #[serde(default = "default_preamble_peer_budget")]
    pub preamble_peer_budget: i32,

    /// Pings accepted from one peer between heartbeats.
    #[serde(default = "default_pings_peer_budget")]
    pub pings_peer_budget: i32,

    // -------------------------------------------------------------------------
    // Preamble Extension
    // -------------------------------------------------------------------------

    /// In-flight receptions one peer may announce via IMRECEIVING.
    #[serde(default = "default_max_he_is_receiving")]
    pub max_he_is_receiving: usize,

    /// Retry an expired announced reception with an IWANT to an
    /// alternate sender.
    #[serde(default = "default_enable_preamble_pull")]
    pub enable_preamble_pull: bool,

    // -------------------------------------------------------------------------
    // Topic Scoring Weights
    // -------------------------------------------------------------------------

    /// Per-topic scoring weights, keyed by topic. Read by the external
    /// scoring subsystem; opaque to the mesh manager itself.
    #[serde(default)]
    pub topic_params: HashMap<String, TopicParameters>,
}

/// Scoring weights of one topic. Consumed by the scorer, carried here
/// so deployments configure mesh and scoring in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicParameters {
    #[serde(default)]
    pub topic_weight: f64,
    #[serde(default)]
    pub mesh_message_deliveries_threshold: f64,
    #[serde(default)]
    pub mesh_message_deliveries_weight: f64,
    #[serde(default)]
    pub first_message_deliveries_weight: f64,
}

fn default_d() -> usize {
    6
}

fn default_d_low() -> usize {
    5
}

fn default_d_high() -> usize {
    12
}

fn default_d_out() -> usize {
    2
}

fn default_d_score() -> usize {
    4
}

fn default_d_lazy() -> usize {
    6
}

fn default_gossip_factor() -> f64 {
    0.25
}

fn default_heartbeat_interval_secs() -> f64 {
    1.0
}

fn default_prune_backoff_secs() -> u64 {
    60
}

fn default_fanout_ttl_secs() -> u64 {
    60
}

fn default_backoff_slack_secs() -> u64 {
    2
}

fn default_history_length() -> usize {
    5
}

fn default_ihave_max_length() -> usize {
    5000
}

fn default_idontwant_max_count() -> usize {
    1000
}

fn default_idontwant_threshold() -> usize {
    1000
}

fn default_publish_threshold() -> f64 {
    -1000.0
}

fn default_gossip_threshold() -> f64 {
    -500.0
}

fn default_opportunistic_graft_threshold() -> f64 {
    3.5
}

fn default_max_opportunistic_graft_peers() -> usize {
    2
}

fn default_ihave_peer_budget() -> i32 {
    10
}

fn default_preamble_peer_budget() -> i32 {
    10
}

fn default_pings_peer_budget() -> i32 {
    100
}

fn default_max_he_is_receiving() -> usize {
    50
}

fn default_enable_preamble_pull() -> bool {
    true
}

impl Default for MeshsubParameters {
    fn default() -> Self {
        Self {
            d: default_d(),
            d_low: default_d_low(),
            d_high: default_d_high(),
            d_out: default_d_out(),
            d_score: default_d_score(),
            d_lazy: default_d_lazy(),
            gossip_factor: default_gossip_factor(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            prune_backoff_secs: default_prune_backoff_secs(),
            fanout_ttl_secs: default_fanout_ttl_secs(),
            backoff_slack_secs: default_backoff_slack_secs(),
            history_length: default_history_length(),
            ihave_max_length: default_ihave_max_length(),
            idontwant_max_count: default_idontwant_max_count(),
            idontwant_message_size_threshold: default_idontwant_threshold(),
            publish_threshold: default_publish_threshold(),
            gossip_threshold: default_gossip_threshold(),
            opportunistic_graft_threshold: default_opportunistic_graft_threshold(),
            max_opportunistic_graft_peers: default_max_opportunistic_graft_peers(),
            enable_px: false,
            direct_peers: Vec::new(),
            ihave_peer_budget: default_ihave_peer_budget(),
            preamble_peer_budget: default_preamble_peer_budget(),
            pings_peer_budget: default_pings_peer_budget(),
            max_he_is_receiving: default_max_he_is_receiving(),
            enable_preamble_pull: default_enable_preamble_pull(),
            topic_params: HashMap::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl MeshsubParameters {
    /// Load parameters from a YAML file, filling absent fields with
    /// defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let params: Self = serde_yaml::from_reader(file)?;
        params.validate()?;
        Ok(params)
    }

    /// Check the internal consistency of the parameter set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.d_low > self.d || self.d > self.d_high {
            return Err(ConfigError::Invalid(format!(
                "mesh degrees must satisfy d_low <= d <= d_high, got {} <= {} <= {}",
                self.d_low, self.d, self.d_high
            )));
        }
        if self.d_out > self.d_low || self.d_out > self.d / 2 {
            return Err(ConfigError::Invalid(format!(
                "d_out must be at most d_low and at most d/2, got {}",
                self.d_out
            )));
        }
        if self.history_length == 0 {
            return Err(ConfigError::Invalid(
                "history_length must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gossip_factor) {
            return Err(ConfigError::Invalid(format!(
                "gossip_factor must be within [0, 1], got {}",
                self.gossip_factor
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs)
    }

    pub fn prune_backoff(&self) -> Duration {
        Duration::from_secs(self.prune_backoff_secs)
    }

    pub fn fanout_ttl(&self) -> Duration {
        Duration::from_secs(self.fanout_ttl_secs)
    }

    pub fn backoff_slack(&self) -> Duration {
        Duration::from_secs(self.backoff_slack_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let params = MeshsubParameters::default();

        assert_eq!(params.d, 6);
        assert_eq!(params.d_low, 5);
        assert_eq!(params.d_high, 12);
        assert_eq!(params.d_out, 2);
        assert_eq!(params.d_score, 4);
        assert_eq!(params.d_lazy, 6);
        assert_eq!(params.gossip_factor, 0.25);
        assert_eq!(params.heartbeat_interval_secs, 1.0);
        assert_eq!(params.prune_backoff_secs, 60);
        assert_eq!(params.fanout_ttl_secs, 60);
        assert_eq!(params.history_length, 5);
        assert_eq!(params.max_he_is_receiving, 50);
        assert!(!params.enable_px);
        assert!(params.direct_peers.is_empty());

        // Relationships the heartbeat relies on
        assert!(params.d_low <= params.d);
        assert!(params.d <= params.d_high);
        assert!(params.d_out <= params.d_low);
        assert!(params.d_score <= params.d);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_degrees() {
        let params = MeshsubParameters {
            d_low: 10,
            d: 6,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }
}
