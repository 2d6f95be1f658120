use std::time::{Duration, Instant};

use crate::config::MeshsubParameters;
use crate::control::{Graft, IDontWant, IHave, IWant, PeerInfo, Prune};
use crate::types::{MeshEvent, PeerId, PeerKind, SignedRecord};

use super::{mid, new_manager, topic_peer};

fn graft(topic: &str) -> Graft {
    Graft {
        topic_id: topic.to_string(),
    }
}

#[test]
fn test_graft_accepted_into_mesh() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);

    let peer = topic_peer(&mut manager, "t", false, 0.0);
    let prunes = manager.handle_graft(&peer, &[graft("t")], now);

    assert!(prunes.is_empty());
    assert!(manager.mesh().in_mesh("t", &peer));
}

#[test]
fn test_graft_from_direct_peer_penalized() {
    let peer = PeerId::random();
    let params = MeshsubParameters {
        direct_peers: vec![peer.to_string()],
        ..Default::default()
    };
    let (mut manager, _) = new_manager(params);
    let now = Instant::now();
    manager.subscribe("t", now);
    manager.peer_connected(peer, false, PeerKind::V1_2);

    let prunes = manager.handle_graft(&peer, &[graft("t")], now);

    assert_eq!(prunes.len(), 1);
    assert!(prunes[0].peers.is_empty());
    assert!(!manager.mesh().in_mesh("t", &peer));
    assert!((manager.behaviour_penalty(&peer) - 0.1).abs() < 1e-9);
    assert!(manager
        .backoff()
        .is_backing_off("t", &peer, now, Duration::ZERO));
}

#[test]
fn test_graft_during_backoff_draws_prune_and_penalty() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    // We pruned the peer with the default 60s backoff...
    manager.make_prune("t", &peer, now);
    assert_eq!(
        manager.backoff().get("t", &peer),
        Some(now + Duration::from_secs(60))
    );

    // ...and five seconds later it grafts us anyway.
    let later = now + Duration::from_secs(5);
    let prunes = manager.handle_graft(&peer, &[graft("t")], later);

    assert_eq!(prunes.len(), 1);
    assert!(prunes[0].peers.is_empty());
    assert!(!manager.mesh().in_mesh("t", &peer));
    assert!((manager.behaviour_penalty(&peer) - 0.1).abs() < 1e-9);
    // The embargo was extended, not merely kept.
    assert_eq!(
        manager.backoff().get("t", &peer),
        Some(later + Duration::from_secs(60))
    );
}

#[test]
fn test_graft_ignored_below_publish_threshold() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, -2000.0);

    let prunes = manager.handle_graft(&peer, &[graft("t")], now);

    assert!(prunes.is_empty());
    assert!(!manager.mesh().in_mesh("t", &peer));
    assert_eq!(manager.behaviour_penalty(&peer), 0.0);
}

#[test]
fn test_graft_ignored_when_not_subscribed() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    let prunes = manager.handle_graft(&peer, &[graft("t")], now);

    assert!(prunes.is_empty());
    assert!(!manager.mesh().in_mesh("t", &peer));
}

#[test]
fn test_graft_rejected_when_mesh_full() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);

    for _ in 0..12 {
        let member = topic_peer(&mut manager, "t", false, 0.0);
        assert!(manager.handle_graft(&member, &[graft("t")], now).is_empty());
    }
    assert_eq!(manager.mesh().mesh_len("t"), 12);

    let late = topic_peer(&mut manager, "t", false, 0.0);
    let prunes = manager.handle_graft(&late, &[graft("t")], now);

    assert_eq!(prunes.len(), 1);
    assert_eq!(prunes[0].topic_id, "t");
    assert_eq!(prunes[0].backoff_secs, 60);
    assert!(!manager.mesh().in_mesh("t", &late));
    assert!(manager
        .backoff()
        .is_backing_off("t", &late, now, Duration::ZERO));
    // Rejection for capacity is not a violation.
    assert_eq!(manager.behaviour_penalty(&late), 0.0);
}

#[test]
fn test_graft_outbound_accepted_above_dhigh_under_quota() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);

    for _ in 0..12 {
        let member = topic_peer(&mut manager, "t", false, 0.0);
        manager.handle_graft(&member, &[graft("t")], now);
    }

    let outbound = topic_peer(&mut manager, "t", true, 0.0);
    let prunes = manager.handle_graft(&outbound, &[graft("t")], now);

    assert!(prunes.is_empty());
    assert!(manager.mesh().in_mesh("t", &outbound));
}

#[test]
fn test_rejected_graft_carries_peer_exchange_with_records() {
    let extra = PeerId::random();
    let record = SignedRecord {
        peer_id: extra,
        envelope: b"envelope".to_vec(),
    };
    let params = MeshsubParameters {
        enable_px: true,
        ..Default::default()
    };
    let (mut manager, _) = super::new_manager_with_records(
        params,
        std::collections::HashMap::from([(extra, record.clone())]),
    );
    let now = Instant::now();
    manager.subscribe("t", now);

    for _ in 0..12 {
        let member = topic_peer(&mut manager, "t", false, 0.0);
        manager.handle_graft(&member, &[graft("t")], now);
    }
    manager.peer_connected(extra, false, PeerKind::V1_2);
    manager.peer_subscribed(&extra, "t");

    let late = topic_peer(&mut manager, "t", false, 0.0);
    let prunes = manager.handle_graft(&late, &[graft("t")], now);

    assert_eq!(prunes.len(), 1);
    assert!(!prunes[0].peers.is_empty());
    assert!(prunes[0].peers.len() <= 24);
    let info = prunes[0]
        .peers
        .iter()
        .find(|info| info.peer_id == extra)
        .expect("exchanged candidate");
    assert_eq!(info.signed_record, Some(record));
}

#[test]
fn test_prune_installs_backoff_and_removes_from_mesh() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);
    manager.handle_graft(&peer, &[graft("t")], now);
    assert!(manager.mesh().in_mesh("t", &peer));

    manager.handle_prune(
        &peer,
        &[Prune {
            topic_id: "t".to_string(),
            peers: Vec::new(),
            backoff_secs: 60,
        }],
        now,
    );

    assert!(!manager.mesh().in_mesh("t", &peer));
    // The embargo holds for the announced interval plus the slack.
    assert!(manager.backoff().is_backing_off(
        "t",
        &peer,
        now + Duration::from_secs(61),
        Duration::ZERO
    ));
    assert!(!manager.backoff().is_backing_off(
        "t",
        &peer,
        now + Duration::from_secs(62),
        Duration::ZERO
    ));
}

#[test]
fn test_prune_peer_exchange_validates_records() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    let good = PeerId::random();
    let bare = PeerId::random();
    let impostor = PeerId::random();
    let exchanged = vec![
        PeerInfo {
            peer_id: good,
            signed_record: Some(SignedRecord {
                peer_id: good,
                envelope: b"record".to_vec(),
            }),
        },
        PeerInfo {
            peer_id: impostor,
            signed_record: Some(SignedRecord {
                peer_id: PeerId::random(),
                envelope: b"forged".to_vec(),
            }),
        },
        PeerInfo {
            peer_id: bare,
            signed_record: None,
        },
    ];

    manager.handle_prune(
        &peer,
        &[Prune {
            topic_id: "t".to_string(),
            peers: exchanged,
            backoff_secs: 60,
        }],
        now,
    );

    let events = manager.drain_events();
    let exchange = events
        .iter()
        .find_map(|event| match event {
            MeshEvent::PeerExchange { peers, .. } => Some(peers),
            _ => None,
        })
        .expect("peer exchange event");
    let ids: Vec<PeerId> = exchange.iter().map(|info| info.peer_id).collect();
    assert_eq!(ids, vec![good, bare]);
    assert!(!ids.contains(&impostor));
}

#[test]
fn test_prune_peer_exchange_ignored_from_low_score_sender() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, -600.0);

    let candidate = PeerId::random();
    manager.handle_prune(
        &peer,
        &[Prune {
            topic_id: "t".to_string(),
            peers: vec![PeerInfo {
                peer_id: candidate,
                signed_record: None,
            }],
            backoff_secs: 60,
        }],
        now,
    );

    assert!(manager
        .drain_events()
        .iter()
        .all(|event| !matches!(event, MeshEvent::PeerExchange { .. })));
}

#[test]
fn test_ihave_produces_iwant() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    let iwant = manager
        .handle_ihave(
            &peer,
            &[IHave {
                topic_id: "t".to_string(),
                message_ids: vec![mid(1), mid(2), mid(3)],
            }],
        )
        .expect("iwant");

    let mut ids = iwant.message_ids;
    ids.sort();
    assert_eq!(ids, vec![mid(1), mid(2), mid(3)]);

    let state = manager.peers().get(&peer).unwrap();
    assert_eq!(
        state.ihave_budget,
        MeshsubParameters::default().ihave_peer_budget - 3
    );
}

#[test]
fn test_ihave_skips_seen_ids() {
    let (mut manager, seen) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    seen.record(&mid(1), now);
    let iwant = manager
        .handle_ihave(
            &peer,
            &[IHave {
                topic_id: "t".to_string(),
                message_ids: vec![mid(1), mid(2)],
            }],
        )
        .expect("iwant");

    assert_eq!(iwant.message_ids, vec![mid(2)]);
}

#[test]
fn test_ihave_budget_bounds_iwant() {
    let params = MeshsubParameters {
        ihave_peer_budget: 2,
        ..Default::default()
    };
    let (mut manager, _) = new_manager(params);
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    let ids = vec![mid(1), mid(2), mid(3), mid(4), mid(5)];
    let iwant = manager
        .handle_ihave(
            &peer,
            &[IHave {
                topic_id: "t".to_string(),
                message_ids: ids,
            }],
        )
        .expect("iwant");

    assert_eq!(iwant.message_ids.len(), 2);
    assert_eq!(manager.peers().get(&peer).unwrap().ihave_budget, 0);

    // The budget is spent until the next heartbeat refills it.
    let again = manager.handle_ihave(
        &peer,
        &[IHave {
            topic_id: "t".to_string(),
            message_ids: vec![mid(6)],
        }],
    );
    assert!(again.is_none());
}

#[test]
fn test_ihave_deduplicates_ids() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    let iwant = manager
        .handle_ihave(
            &peer,
            &[IHave {
                topic_id: "t".to_string(),
                message_ids: vec![mid(1), mid(1), mid(2)],
            }],
        )
        .expect("iwant");

    assert_eq!(iwant.message_ids.len(), 2);
}

#[test]
fn test_ihave_rejected_below_gossip_threshold() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, -600.0);

    let iwant = manager.handle_ihave(
        &peer,
        &[IHave {
            topic_id: "t".to_string(),
            message_ids: vec![mid(1)],
        }],
    );
    assert!(iwant.is_none());
}

#[test]
fn test_ihave_ignores_unsubscribed_topics() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let peer = topic_peer(&mut manager, "other", false, 0.0);

    let iwant = manager.handle_ihave(
        &peer,
        &[IHave {
            topic_id: "other".to_string(),
            message_ids: vec![mid(1)],
        }],
    );
    assert!(iwant.is_none());
}

#[test]
fn test_iwant_serves_each_id_once() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    manager.publish("t", mid(1), b"payload".to_vec(), now);
    manager
        .peers
        .get_mut(&peer)
        .unwrap()
        .record_sent_ihaves(&[mid(1)]);

    let request = IWant {
        message_ids: vec![mid(1)],
    };
    let served = manager.handle_iwant(&peer, &[request.clone()]);
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].data, b"payload");

    // A replay of the same id is an invalid request.
    let replay = manager.handle_iwant(&peer, &[request]);
    assert!(replay.is_empty());
}

#[test]
fn test_iwant_aborts_after_twenty_invalid_ids() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);

    manager.publish("t", mid(1), b"payload".to_vec(), now);
    manager
        .peers
        .get_mut(&peer)
        .unwrap()
        .record_sent_ihaves(&[mid(1)]);

    let mut ids = vec![mid(1)];
    ids.extend((100..125).map(mid));
    let served = manager.handle_iwant(&peer, &[IWant { message_ids: ids }]);

    // The whole response is discarded once the invalid ids exceed the
    // tolerance, valid prefix included.
    assert!(served.is_empty());
}

#[test]
fn test_iwant_rejected_below_gossip_threshold() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, -600.0);

    manager.publish("t", mid(1), b"payload".to_vec(), now);
    let served = manager.handle_iwant(
        &peer,
        &[IWant {
            message_ids: vec![mid(1)],
        }],
    );
    assert!(served.is_empty());
}

#[test]
fn test_idontwant_suppresses_publishing() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);
    manager.handle_graft(&peer, &[graft("t")], now);

    manager.handle_idontwant(
        &peer,
        &[IDontWant {
            message_ids: vec![mid(1)],
        }],
    );

    let suppressed = manager.publish("t", mid(1), Vec::new(), now);
    assert!(!suppressed.contains(&peer));

    let other = manager.publish("t", mid(2), Vec::new(), now);
    assert!(other.contains(&peer));
}

#[test]
fn test_idontwant_surplus_dropped() {
    let params = MeshsubParameters {
        idontwant_max_count: 1,
        ..Default::default()
    };
    let (mut manager, _) = new_manager(params);
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);
    manager.handle_graft(&peer, &[graft("t")], now);

    manager.handle_idontwant(
        &peer,
        &[IDontWant {
            message_ids: vec![mid(1), mid(2)],
        }],
    );

    assert!(!manager.publish("t", mid(1), Vec::new(), now).contains(&peer));
    // The second id fell over the cap and was dropped.
    assert!(manager.publish("t", mid(2), Vec::new(), now).contains(&peer));
}

#[test]
fn test_handle_control_queues_corrective_prune() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);
    manager.make_prune("t", &peer, now);
    manager.drain_outbox();

    let mut message = crate::control::ControlMessage::default();
    message.grafts.push(graft("t"));
    manager.handle_control(&peer, message, now + Duration::from_secs(5));

    let outbox = manager.drain_outbox();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].peer, peer);
    assert!(outbox[0].high_priority);
    assert_eq!(outbox[0].message.prunes.len(), 1);
}

#[test]
fn test_unsubscribe_prunes_mesh_members() {
    let (mut manager, _) = new_manager(MeshsubParameters::default());
    let now = Instant::now();
    manager.subscribe("t", now);
    let peer = topic_peer(&mut manager, "t", false, 0.0);
    manager.handle_graft(&peer, &[graft("t")], now);
    manager.drain_outbox();

    manager.unsubscribe("t", now);

    assert!(!manager.mesh().is_subscribed("t"));
    let outbox = manager.drain_outbox();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].peer, peer);
    assert_eq!(outbox[0].message.prunes.len(), 1);
    assert!(manager
        .backoff()
        .is_backing_off("t", &peer, now, Duration::ZERO));
}
