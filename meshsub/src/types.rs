/// Core Type Definitions
///
/// Identifiers, protocol variants and the narrow interfaces the mesh
/// manager consumes from the surrounding node.
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::control::ControlMessage;
use crate::mcache::CachedMessage;

pub use libp2p_identity::PeerId;

/// Topic string identifier.
///
/// Topics are opaque to the mesh manager; the surrounding node decides
/// their format.
pub type TopicId = String;

/// Salted message identifier.
///
/// A keyed hash of a [`MessageId`] under a per-node secret. Remote nodes
/// cannot predict which salted ids a node tracks, which defeats
/// cross-node probing of the seen set.
pub type SaltedId = u64;

/// 20-byte message identifier.
///
/// Computed by the pub/sub base from message contents; the mesh manager
/// only compares and stores it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub [u8; 20]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 20]> for MessageId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// Negotiated protocol variant of a peer.
///
/// The variant is fixed at stream negotiation time and decides which
/// control messages a peer understands. Ordering follows protocol
/// capability: later variants understand everything earlier ones do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerKind {
    /// Baseline mesh protocol: GRAFT/PRUNE/IHAVE/IWANT.
    V1_0,
    /// Adds peer exchange, backoff and score-gated gossip.
    V1_1,
    /// Adds IDONTWANT suppression.
    V1_2,
    /// Adds preamble announcements and IMRECEIVING.
    V1_4,
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::V1_0 => "meshsub v1.0",
            Self::V1_1 => "meshsub v1.1",
            Self::V1_2 => "meshsub v1.2",
            Self::V1_4 => "meshsub v1.4",
        };
        f.write_str(kind)
    }
}

/// A signed peer record as carried in peer exchange.
///
/// The envelope encoding is owned by the peer-store layer; the mesh
/// manager only checks that the id a record claims matches the peer it
/// was attached for, and hands validated records onward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRecord {
    /// The peer id the record itself is signed by.
    pub peer_id: PeerId,
    /// Opaque envelope bytes.
    pub envelope: Vec<u8>,
}

/// Events surfaced to the embedding node.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Validated peer-exchange records received alongside a PRUNE.
    PeerExchange {
        topic: TopicId,
        peers: Vec<crate::control::PeerInfo>,
    },
    /// Peers a published message should be forwarded to.
    ForwardTargets {
        topic: TopicId,
        id: MessageId,
        peers: Vec<PeerId>,
    },
    /// An in-flight reception was requested by IWANT and never arrived.
    /// Terminal within the mesh manager; upper layers may re-request.
    DeliveryFailed { topic: TopicId, id: MessageId },
    /// A heartbeat cycle finished.
    HeartbeatCompleted,
}

/// Query interface of the duplicate-detection layer.
///
/// The pub/sub base owns the seen set; the mesh manager only asks
/// whether an advertised id is already known.
pub trait SeenRegistry: Send + Sync {
    /// Hash a message id under the node secret.
    fn salt(&self, id: &MessageId) -> SaltedId;

    /// Check whether a salted id has been seen.
    fn has_seen(&self, salted: SaltedId) -> bool;
}

/// Lookup interface of the signed-record store.
pub trait RecordBook: Send + Sync {
    fn lookup(&self, peer: &PeerId) -> Option<SignedRecord>;
}

/// A record book with no records. Peer exchange then carries bare ids.
pub struct EmptyRecordBook;

impl RecordBook for EmptyRecordBook {
    fn lookup(&self, _peer: &PeerId) -> Option<SignedRecord> {
        None
    }
}

/// Outbound side of the transport layer.
///
/// Send failures are reported to the caller but never roll back mesh
/// state; the next heartbeat reconciles.
#[async_trait]
pub trait ControlSink: Send + Sync {
    /// Send a control message to a single peer. High-priority messages
    /// (GRAFT/PRUNE) must not be dropped under queue pressure.
    async fn send_control(
        &self,
        peer: PeerId,
        message: ControlMessage,
        high_priority: bool,
    ) -> Result<()>;

    /// Forward a cached message in response to an IWANT.
    async fn forward(&self, peer: PeerId, message: CachedMessage) -> Result<()>;
}

pub type SharedSeenRegistry = Arc<dyn SeenRegistry>;
pub type SharedRecordBook = Arc<dyn RecordBook>;
