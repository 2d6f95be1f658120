use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MeshsubParameters;
use crate::manager::MeshManager;
use crate::mcache::SaltedSeenCache;
use crate::types::{MessageId, PeerId, PeerKind, RecordBook, SignedRecord};

mod backoff;
mod handlers;
mod service;

/// Record book backed by a fixed map.
pub(crate) struct StaticRecordBook {
    pub records: HashMap<PeerId, SignedRecord>,
}

impl RecordBook for StaticRecordBook {
    fn lookup(&self, peer: &PeerId) -> Option<SignedRecord> {
        self.records.get(peer).cloned()
    }
}

pub(crate) fn new_manager(params: MeshsubParameters) -> (MeshManager, Arc<SaltedSeenCache>) {
    new_manager_with_records(params, HashMap::new())
}

pub(crate) fn new_manager_with_records(
    params: MeshsubParameters,
    records: HashMap<PeerId, SignedRecord>,
) -> (MeshManager, Arc<SaltedSeenCache>) {
    let seen = Arc::new(SaltedSeenCache::with_secret([7u8; 32], Duration::from_secs(120)));
    let manager = MeshManager::new(
        params,
        seen.clone(),
        Arc::new(StaticRecordBook { records }),
        Arc::new(metrics::Metrics::new()),
    );
    (manager, seen)
}

/// Connect a fresh random peer with the given direction and score.
pub(crate) fn connect_peer(manager: &mut MeshManager, outbound: bool, score: f64) -> PeerId {
    connect_peer_kind(manager, outbound, score, PeerKind::V1_2)
}

pub(crate) fn connect_peer_kind(
    manager: &mut MeshManager,
    outbound: bool,
    score: f64,
    kind: PeerKind,
) -> PeerId {
    let peer = PeerId::random();
    manager.peer_connected(peer, outbound, kind);
    manager.update_score(&peer, score);
    peer
}

/// Connect a peer and mark it subscribed to `topic`.
pub(crate) fn topic_peer(manager: &mut MeshManager, topic: &str, outbound: bool, score: f64) -> PeerId {
    let peer = connect_peer(manager, outbound, score);
    manager.peer_subscribed(&peer, topic);
    peer
}

pub(crate) fn mid(n: u8) -> MessageId {
    MessageId([n; 20])
}
