pub mod backoff;
pub mod config;
pub mod control;
pub mod manager;
pub mod mcache;
pub mod mesh;
pub mod peer;
#[cfg(feature = "v1_4")]
pub mod preamble;
pub mod service;
pub mod types;

mod heartbeat;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use backoff::BackoffTable;
pub use config::{ConfigError, MeshsubParameters, TopicParameters};
pub use control::{ControlMessage, Graft, IDontWant, IHave, IWant, PeerInfo, Prune};
#[cfg(feature = "v1_4")]
pub use control::{ImReceiving, Preamble};
pub use manager::{MeshManager, OutboundControl};
pub use mcache::{CachedMessage, MessageCache, SaltedSeenCache};
pub use mesh::{FanoutEntry, MeshState};
pub use peer::{PeerState, PeerTable};
pub use service::{MeshCommand, MeshService};
pub use types::{
    ControlSink, MeshEvent, MessageId, PeerId, PeerKind, RecordBook, SaltedId, SeenRegistry,
    SignedRecord, TopicId,
};
