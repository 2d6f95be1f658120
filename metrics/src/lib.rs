use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    mesh_peers: IntGaugeVec,
    low_peer_topics: IntGauge,
    grafts: IntCounterVec,
    prunes: IntCounterVec,
    received_iwants: IntCounterVec,
    received_ihaves: IntCounterVec,
    behaviour_penalties: IntCounterVec,
    gossip_ihaves_sent: IntCounter,
    preamble_saved_iwants: IntCounter,
    preamble_expirations: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let mesh_peers = IntGaugeVec::new(
            Opts::new("meshsub_mesh_peers", "Number of mesh peers per topic"),
            &["topic"],
        ).unwrap();
        registry.register(Box::new(mesh_peers.clone())).unwrap();

        let low_peer_topics = IntGauge::with_opts(Opts::new(
            "meshsub_low_peer_topics",
            "Number of subscribed topics whose mesh is below the low watermark",
        )).unwrap();
        registry.register(Box::new(low_peer_topics.clone())).unwrap();

        let grafts = IntCounterVec::new(
            Opts::new("meshsub_grafts_total", "Total number of peers grafted into a mesh"),
            &["reason"],
        ).unwrap();
        registry.register(Box::new(grafts.clone())).unwrap();

        let prunes = IntCounterVec::new(
            Opts::new("meshsub_prunes_total", "Total number of peers pruned from a mesh"),
            &["reason"],
        ).unwrap();
        registry.register(Box::new(prunes.clone())).unwrap();

        let received_iwants = IntCounterVec::new(
            Opts::new("meshsub_received_iwants_total", "Total number of IWANT ids received"),
            &["outcome"],
        ).unwrap();
        registry.register(Box::new(received_iwants.clone())).unwrap();

        let received_ihaves = IntCounterVec::new(
            Opts::new("meshsub_received_ihaves_total", "Total number of IHAVE ids received"),
            &["outcome"],
        ).unwrap();
        registry.register(Box::new(received_ihaves.clone())).unwrap();

        let behaviour_penalties = IntCounterVec::new(
            Opts::new("meshsub_behaviour_penalties_total", "Total number of behaviour penalties charged"),
            &["reason"],
        ).unwrap();
        registry.register(Box::new(behaviour_penalties.clone())).unwrap();

        let gossip_ihaves_sent = IntCounter::with_opts(Opts::new(
            "meshsub_gossip_ihaves_sent_total",
            "Total number of IHAVE control messages emitted by the heartbeat",
        )).unwrap();
        registry.register(Box::new(gossip_ihaves_sent.clone())).unwrap();

        let preamble_saved_iwants = IntCounter::with_opts(Opts::new(
            "meshsub_preamble_saved_iwants_total",
            "IHAVE ids skipped because a preamble already tracks the message",
        )).unwrap();
        registry.register(Box::new(preamble_saved_iwants.clone())).unwrap();

        let preamble_expirations = IntCounterVec::new(
            Opts::new("meshsub_preamble_expirations_total", "Expired in-flight receptions"),
            &["store"],
        ).unwrap();
        registry.register(Box::new(preamble_expirations.clone())).unwrap();

        Self {
            registry,
            mesh_peers,
            low_peer_topics,
            grafts,
            prunes,
            received_iwants,
            received_ihaves,
            behaviour_penalties,
            gossip_ihaves_sent,
            preamble_saved_iwants,
            preamble_expirations,
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics not utf8")
    }

    pub fn set_mesh_peers(&self, topic: &str, v: i64) {
        self.mesh_peers.with_label_values(&[topic]).set(v);
    }

    pub fn remove_mesh_topic(&self, topic: &str) {
        let _ = self.mesh_peers.remove_label_values(&[topic]);
    }

    pub fn set_low_peer_topics(&self, v: i64) {
        self.low_peer_topics.set(v);
    }

    pub fn inc_grafts(&self, reason: &str) {
        self.grafts.with_label_values(&[reason]).inc();
    }

    pub fn inc_prunes(&self, reason: &str) {
        self.prunes.with_label_values(&[reason]).inc();
    }

    pub fn inc_received_iwants(&self, outcome: &str, count: u64) {
        self.received_iwants.with_label_values(&[outcome]).inc_by(count);
    }

    pub fn inc_received_ihaves(&self, outcome: &str, count: u64) {
        self.received_ihaves.with_label_values(&[outcome]).inc_by(count);
    }

    pub fn inc_behaviour_penalty(&self, reason: &str) {
        self.behaviour_penalties.with_label_values(&[reason]).inc();
    }

    pub fn inc_gossip_ihaves_sent(&self, count: u64) {
        self.gossip_ihaves_sent.inc_by(count);
    }

    pub fn inc_preamble_saved_iwants(&self) {
        self.preamble_saved_iwants.inc();
    }

    pub fn inc_preamble_expirations(&self, store: &str) {
        self.preamble_expirations.with_label_values(&[store]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;
