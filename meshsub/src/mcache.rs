/// Message Cache
///
/// Caches recent messages for gossip dissemination and IWANT responses.
///
/// ## Overview
///
/// The message cache enables the lazy pull protocol by storing messages
/// that can be requested via IWANT after receiving IHAVE
/// advertisements.
///
/// ```text
/// Peer A                        Peer B (non-mesh)
///    |                              |
///    |--- IHAVE [msg1, msg2] ------>|
///    |                              |
///    |<----- IWANT [msg2] ----------|
///    |                              |
///    |--- MESSAGE [msg2] ---------->|  <- Retrieved from cache
/// ```
///
/// ## Sliding Window Design
///
/// The cache is organized as a sliding window of generations:
///
/// ```text
/// +----------+----------+----------+----------+
/// | Gen 0    | Gen 1    | Gen 2    | Gen 3    | ...
/// | (newest) |          |          | (oldest) |
/// +----------+----------+----------+----------+
///      ^
///      |
/// New messages go here
/// ```
///
/// Each heartbeat, `shift` evicts the oldest generation and prepends a
/// fresh one. `history_length` generations are retained; they bound how
/// far back IHAVE advertisements may reach.
///
/// ## Salted Seen Cache
///
/// A separate [`SaltedSeenCache`] tracks message ids for deduplication
/// without storing full messages. Ids are hashed under a per-node
/// secret so remote nodes cannot probe the seen set, and expire by TTL.
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::types::{MessageId, SaltedId, SeenRegistry, TopicId};

/// A message held for IWANT responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub id: MessageId,
    pub topic: TopicId,
    pub data: Vec<u8>,
}

/// Sliding window cache of recent messages.
#[derive(Debug, Clone)]
pub struct MessageCache {
    history_length: usize,
    /// Generation id sets, newest first.
    generations: VecDeque<HashSet<MessageId>>,
    /// Message lookup index keyed by id.
    by_id: HashMap<MessageId, CachedMessage>,
}

impl MessageCache {
    pub fn new(history_length: usize) -> Self {
        let mut generations = VecDeque::with_capacity(history_length);
        generations.push_back(HashSet::new());

        Self {
            history_length,
            generations,
            by_id: HashMap::new(),
        }
    }

    /// Add a message to the newest generation. Duplicates are ignored.
    ///
    /// Returns `true` if added.
    pub fn add(&mut self, topic: TopicId, id: MessageId, data: Vec<u8>) -> bool {
        if self.by_id.contains_key(&id) {
            return false;
        }

        if let Some(current) = self.generations.front_mut() {
            current.insert(id);
        }
        self.by_id.insert(id, CachedMessage { id, topic, data });
        true
    }

    /// Retrieve a message by id from any retained generation.
    pub fn get(&self, id: &MessageId) -> Option<&CachedMessage> {
        self.by_id.get(id)
    }

    pub fn has(&self, id: &MessageId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Ids of the retained window belonging to `topic`, newest
    /// generation first. These are the ids eligible for IHAVE
    /// advertisement.
    pub fn window(&self, topic: &str) -> Vec<MessageId> {
        let mut result = Vec::new();
        for generation in &self.generations {
            for id in generation {
                if let Some(entry) = self.by_id.get(id) {
                    if entry.topic == topic {
                        result.push(*id);
                    }
                }
            }
        }
        result
    }

    /// Rotate the window: evict the oldest generation, open a fresh
    /// one. Called once per heartbeat.
    ///
    /// Returns the number of messages evicted.
    pub fn shift(&mut self) -> usize {
        let mut evicted = 0;

        if self.generations.len() >= self.history_length {
            if let Some(oldest) = self.generations.pop_back() {
                for id in oldest {
                    if self.by_id.remove(&id).is_some() {
                        evicted += 1;
                    }
                }
            }
        }

        self.generations.push_front(HashSet::new());
        evicted
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[derive(Debug, Default)]
struct SeenInner {
    seen: HashSet<SaltedId>,
    /// Insertion order with timestamps, oldest first.
    stamps: VecDeque<(Instant, SaltedId)>,
}

/// TTL-based duplicate registry over salted message ids.
///
/// The pub/sub base records every delivered message here; the mesh
/// manager queries it through [`SeenRegistry`] when deciding whether an
/// advertised id is worth pulling.
pub struct SaltedSeenCache {
    secret: [u8; 32],
    ttl: Duration,
    inner: Mutex<SeenInner>,
}

impl SaltedSeenCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_secret(rand::random(), ttl)
    }

    pub fn with_secret(secret: [u8; 32], ttl: Duration) -> Self {
        Self {
            secret,
            ttl,
            inner: Mutex::new(SeenInner::default()),
        }
    }

    /// Mark a message as seen. Returns `true` if newly seen.
    pub fn record(&self, id: &MessageId, now: Instant) -> bool {
        let salted = self.salt(id);
        let mut inner = self.inner.lock();
        if !inner.seen.insert(salted) {
            return false;
        }
        inner.stamps.push_back((now, salted));
        true
    }

    /// Remove entries older than the TTL. Called periodically to bound
    /// memory.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        while let Some((stamp, salted)) = inner.stamps.front().copied() {
            if now.saturating_duration_since(stamp) <= self.ttl {
                break;
            }
            inner.stamps.pop_front();
            inner.seen.remove(&salted);
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().seen.is_empty()
    }
}

impl SeenRegistry for SaltedSeenCache {
    fn salt(&self, id: &MessageId) -> SaltedId {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(id.as_bytes());
        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(word)
    }

    fn has_seen(&self, salted: SaltedId) -> bool {
        self.inner.lock().seen.contains(&salted)
    }
}
