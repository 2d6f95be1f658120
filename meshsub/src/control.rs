/// Control Messages
///
/// Semantic representation of the mesh control vocabulary. Wire
/// encoding is owned by the framing layer; the mesh manager only
/// produces and consumes these values.
use crate::types::{MessageId, PeerId, SignedRecord, TopicId};

/// Invitation into a topic mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graft {
    pub topic_id: TopicId,
}

/// Eviction from a topic mesh.
///
/// Carries an optional peer-exchange list so the evicted peer can find
/// alternates, and the backoff interval during which it must not graft
/// back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prune {
    pub topic_id: TopicId,
    /// Peer-exchange candidates. Empty when PX is disabled or the
    /// prune is corrective.
    pub peers: Vec<PeerInfo>,
    /// Seconds the pruned peer must wait before grafting again.
    pub backoff_secs: u64,
}

/// Lazy advertisement of recently seen message ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHave {
    pub topic_id: TopicId,
    pub message_ids: Vec<MessageId>,
}

/// Request for full messages previously advertised via IHAVE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IWant {
    pub message_ids: Vec<MessageId>,
}

/// Announcement that the sender already holds these messages and does
/// not want them forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IDontWant {
    pub message_ids: Vec<MessageId>,
}

/// Advance announcement of a large in-flight message (v1.4).
#[cfg(feature = "v1_4")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub message_id: MessageId,
    pub topic_id: TopicId,
    pub message_len: usize,
}

/// Announcement that the sender is currently receiving a message from
/// someone else (v1.4).
#[cfg(feature = "v1_4")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImReceiving {
    pub message_id: MessageId,
    pub message_len: usize,
}

/// A peer-exchange entry attached to a PRUNE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    /// Signed record of the peer, when the record store has one.
    pub signed_record: Option<SignedRecord>,
}

/// All control messages of one RPC, grouped per verb.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlMessage {
    pub grafts: Vec<Graft>,
    pub prunes: Vec<Prune>,
    pub ihaves: Vec<IHave>,
    pub iwants: Vec<IWant>,
    pub idontwants: Vec<IDontWant>,
    #[cfg(feature = "v1_4")]
    pub preambles: Vec<Preamble>,
    #[cfg(feature = "v1_4")]
    pub im_receivings: Vec<ImReceiving>,
}

impl ControlMessage {
    pub fn is_empty(&self) -> bool {
        let empty = self.grafts.is_empty()
            && self.prunes.is_empty()
            && self.ihaves.is_empty()
            && self.iwants.is_empty()
            && self.idontwants.is_empty();
        #[cfg(feature = "v1_4")]
        let empty = empty && self.preambles.is_empty() && self.im_receivings.is_empty();
        empty
    }

    /// A message carrying a single GRAFT.
    pub fn graft(topic_id: TopicId) -> Self {
        Self {
            grafts: vec![Graft { topic_id }],
            ..Default::default()
        }
    }

    /// A message carrying a single PRUNE.
    pub fn prune(prune: Prune) -> Self {
        Self {
            prunes: vec![prune],
            ..Default::default()
        }
    }

    /// A message carrying a single IHAVE.
    pub fn ihave(ihave: IHave) -> Self {
        Self {
            ihaves: vec![ihave],
            ..Default::default()
        }
    }

    /// A message carrying a single IWANT.
    pub fn iwant(iwant: IWant) -> Self {
        Self {
            iwants: vec![iwant],
            ..Default::default()
        }
    }
}
