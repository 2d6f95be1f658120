use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::config::MeshsubParameters;
use crate::control::ControlMessage;
use crate::mcache::CachedMessage;
use crate::service::{MeshCommand, MeshService};
use crate::types::{ControlSink, MeshEvent, PeerId, PeerKind};

use super::{mid, new_manager};

#[derive(Default)]
struct RecordingSink {
    controls: Mutex<Vec<(PeerId, ControlMessage, bool)>>,
}

#[async_trait]
impl ControlSink for RecordingSink {
    async fn send_control(
        &self,
        peer: PeerId,
        message: ControlMessage,
        high_priority: bool,
    ) -> Result<()> {
        self.controls.lock().push((peer, message, high_priority));
        Ok(())
    }

    async fn forward(&self, _peer: PeerId, _message: CachedMessage) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_service_processes_commands_and_flushes_replies() {
    let (manager, _) = new_manager(MeshsubParameters::default());
    let sink = Arc::new(RecordingSink::default());
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let service = MeshService::new(manager, sink.clone(), command_rx, event_tx, shutdown_rx);
    let handle = tokio::spawn(service.run());

    let peer = PeerId::random();
    for command in [
        MeshCommand::Subscribe {
            topic: "t".to_string(),
        },
        MeshCommand::PeerConnected {
            peer,
            outbound: false,
            kind: PeerKind::V1_2,
        },
        MeshCommand::PeerSubscribed {
            peer,
            topic: "t".to_string(),
        },
        // Accepted graft, then the peer prunes us, then grafts back
        // inside its own embargo: the service must answer the replay
        // with a corrective PRUNE.
        MeshCommand::Control {
            from: peer,
            message: ControlMessage::graft("t".to_string()),
        },
        MeshCommand::Control {
            from: peer,
            message: ControlMessage::prune(crate::control::Prune {
                topic_id: "t".to_string(),
                peers: Vec::new(),
                backoff_secs: 60,
            }),
        },
        MeshCommand::Control {
            from: peer,
            message: ControlMessage::graft("t".to_string()),
        },
        MeshCommand::Publish {
            topic: "t".to_string(),
            id: mid(1),
            data: b"payload".to_vec(),
        },
    ] {
        command_tx.send(command).await.unwrap();
    }

    // The publish answer doubles as the barrier: once it arrives, every
    // earlier command has been dispatched. Heartbeat completions may
    // interleave; skip them.
    let event = loop {
        let event = timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open");
        if event != MeshEvent::HeartbeatCompleted {
            break event;
        }
    };
    match event {
        MeshEvent::ForwardTargets { topic, id, peers } => {
            assert_eq!(topic, "t");
            assert_eq!(id, mid(1));
            // The peer pruned itself out of the mesh; nothing to
            // forward to.
            assert!(peers.is_empty());
        }
        other => panic!("unexpected event {other:?}"),
    }

    let controls = sink.controls.lock();
    let corrective = controls
        .iter()
        .find(|(to, message, _)| *to == peer && !message.prunes.is_empty())
        .expect("corrective prune sent");
    assert!(corrective.2);
    drop(controls);

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("service stops on shutdown")
        .unwrap()
        .unwrap();
}
