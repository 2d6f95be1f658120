use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::control::ControlMessage;
use crate::manager::MeshManager;
use crate::types::{ControlSink, MeshEvent, MessageId, PeerId, PeerKind, TopicId};

/// Requests into the mesh manager task.
///
/// Every mutation of mesh state travels through this channel so all
/// tables are only ever touched from the service task.
#[derive(Debug, Clone)]
pub enum MeshCommand {
    /// An inbound control RPC, tagged with its sender.
    Control { from: PeerId, message: ControlMessage },
    /// A full message arrived and passed duplicate detection.
    MessageReceived {
        from: PeerId,
        topic: TopicId,
        id: MessageId,
        length: usize,
    },
    /// Publish a local message; forwarding targets come back as a
    /// [`MeshEvent::ForwardTargets`].
    Publish {
        topic: TopicId,
        id: MessageId,
        data: Vec<u8>,
    },
    Subscribe { topic: TopicId },
    Unsubscribe { topic: TopicId },
    PeerConnected {
        peer: PeerId,
        outbound: bool,
        kind: PeerKind,
    },
    PeerDisconnected { peer: PeerId },
    PeerSubscribed { peer: PeerId, topic: TopicId },
    PeerUnsubscribed { peer: PeerId, topic: TopicId },
    /// Externally computed score for a peer.
    UpdateScore { peer: PeerId, score: f64 },
}

/// Interval of the preamble expiry sweep.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(200);

/// Drives the mesh manager: multiplexes the heartbeat, the preamble
/// expiry sweep and inbound commands onto one task, and flushes the
/// resulting control messages and events after each step.
pub struct MeshService<S> {
    manager: MeshManager,
    sink: Arc<S>,
    commands: mpsc::Receiver<MeshCommand>,
    events: mpsc::Sender<MeshEvent>,
    shutdown: watch::Receiver<bool>,
}

impl<S> MeshService<S>
where
    S: ControlSink + 'static,
{
    pub fn new(
        manager: MeshManager,
        sink: Arc<S>,
        commands: mpsc::Receiver<MeshCommand>,
        events: mpsc::Sender<MeshEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            manager,
            sink,
            commands,
            events,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut heartbeat = interval(self.manager.params().heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut expiry_sweep = interval(EXPIRY_SWEEP_INTERVAL);
        expiry_sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("mesh service shutting down");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.manager.heartbeat(Instant::now());
                    self.flush().await;
                }
                _ = expiry_sweep.tick() => {
                    #[cfg(feature = "v1_4")]
                    {
                        self.manager.preamble_heartbeat(Instant::now());
                        self.flush().await;
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            self.dispatch(command).await;
                            self.flush().await;
                        }
                        None => {
                            info!("command channel closed, stopping mesh service");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, command: MeshCommand) {
        let now = Instant::now();
        match command {
            MeshCommand::Control { from, message } => {
                let served = self.manager.handle_control(&from, message, now);
                for message in served {
                    if let Err(err) = self.sink.forward(from, message).await {
                        warn!(peer = %from, ?err, "failed to forward requested message");
                    }
                }
            }
            MeshCommand::MessageReceived {
                from,
                topic,
                id,
                length,
            } => {
                self.manager.message_received(&from, &topic, id, length, now);
            }
            MeshCommand::Publish { topic, id, data } => {
                let peers = self.manager.publish(&topic, id, data, now);
                self.emit(MeshEvent::ForwardTargets { topic, id, peers }).await;
            }
            MeshCommand::Subscribe { topic } => {
                info!(topic = %topic, "subscribing");
                self.manager.subscribe(&topic, now);
            }
            MeshCommand::Unsubscribe { topic } => {
                info!(topic = %topic, "unsubscribing");
                self.manager.unsubscribe(&topic, now);
            }
            MeshCommand::PeerConnected {
                peer,
                outbound,
                kind,
            } => {
                self.manager.peer_connected(peer, outbound, kind);
            }
            MeshCommand::PeerDisconnected { peer } => {
                self.manager.peer_disconnected(&peer);
            }
            MeshCommand::PeerSubscribed { peer, topic } => {
                self.manager.peer_subscribed(&peer, &topic);
            }
            MeshCommand::PeerUnsubscribed { peer, topic } => {
                self.manager.peer_unsubscribed(&peer, &topic);
            }
            MeshCommand::UpdateScore { peer, score } => {
                self.manager.update_score(&peer, score);
            }
        }
    }

    /// Write out everything the last step produced. Tables are already
    /// settled when this runs; a failed send is only logged and the
    /// next heartbeat reconciles.
    async fn flush(&mut self) {
        for outbound in self.manager.drain_outbox() {
            if let Err(err) = self
                .sink
                .send_control(outbound.peer, outbound.message, outbound.high_priority)
                .await
            {
                warn!(peer = %outbound.peer, ?err, "failed to send control message");
            }
        }
        for event in self.manager.drain_events() {
            self.emit(event).await;
        }
    }

    async fn emit(&mut self, event: MeshEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}
