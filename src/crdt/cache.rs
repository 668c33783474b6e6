/// Merge/cache engine: the single entry point for folding messages into state.
///
/// `ForumCache` holds the current projection of every message seen so far:
/// one map per entity kind plus a dedup set. Every message flows through
/// `apply`, which deduplicates, dispatches by kind, and applies that kind's
/// merge rule:
///
/// - Community / Thread / Reply: upsert by id, newest timestamp wins
/// - Vote: one live vote per `(target, author)`, causally newest wins
/// - Moderation: one record per target, `(timestamp, id)` newest wins
///
/// **Determinism guarantee:** applying the same multiset of messages in any
/// order, with any duplication, yields the same `state_hash`, because every
/// rule is a max over a total order.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use crate::crdt::clock::is_newer;
use crate::protocol::{Author, Message, MessageBody, MessageId, MessageKind, VoteKey, VoteValue};

// ---------------------------------------------------------------------------
// ApplyOutcome
// ---------------------------------------------------------------------------

/// Result of applying one message. None of these are errors: duplicates and
/// stale writes are normal operating conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First message for its key.
    Inserted,
    /// Superseded the previous entry for its key.
    Replaced,
    /// Same `(kind, id, timestamp)` already processed.
    Duplicate,
    /// Lost the comparison against the stored entry and was discarded.
    Stale,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Replaced)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    kind: MessageKind,
    id: MessageId,
    timestamp: u64,
}

impl DedupKey {
    fn of(message: &Message) -> Self {
        DedupKey {
            kind: message.kind(),
            id: message.id.clone(),
            timestamp: message.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// VoteTally
// ---------------------------------------------------------------------------

/// Live votes on one target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteTally {
    pub upvoters: Vec<Author>,
    pub downvoters: Vec<Author>,
}

impl VoteTally {
    pub fn upvotes(&self) -> usize {
        self.upvoters.len()
    }

    pub fn downvotes(&self) -> usize {
        self.downvoters.len()
    }

    /// Distinct voters with a live vote.
    pub fn total(&self) -> usize {
        self.upvoters.len() + self.downvoters.len()
    }

    /// Upvotes minus downvotes.
    pub fn net(&self) -> i64 {
        self.upvoters.len() as i64 - self.downvoters.len() as i64
    }
}

// ---------------------------------------------------------------------------
// ForumCache
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct ForumCache {
    communities: BTreeMap<MessageId, Message>,
    threads: BTreeMap<MessageId, Message>,
    replies: BTreeMap<MessageId, Message>,
    votes: BTreeMap<VoteKey, Message>,
    /// Keyed by moderation target id (thread/reply id or author address).
    moderations: BTreeMap<String, Message>,
    /// Processed `(kind, id, timestamp)` triples (for idempotency).
    seen: HashSet<DedupKey>,
}

impl ForumCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single message. Never fails; see `ApplyOutcome`.
    pub fn apply(&mut self, message: &Message) -> ApplyOutcome {
        let key = DedupKey::of(message);
        if self.seen.contains(&key) {
            log::debug!("Duplicate {:?} {} ignored", key.kind, message.id);
            return ApplyOutcome::Duplicate;
        }

        let outcome = match &message.body {
            MessageBody::Community(_) => upsert_content(&mut self.communities, message),
            MessageBody::Thread(_) => upsert_content(&mut self.threads, message),
            MessageBody::Reply(_) => upsert_content(&mut self.replies, message),
            MessageBody::Vote(vote) => {
                let key = VoteKey::new(vote.target_id.clone(), message.author.clone());
                match self.votes.get(&key) {
                    None => {
                        self.votes.insert(key, message.clone());
                        ApplyOutcome::Inserted
                    }
                    Some(existing) if is_newer(message, existing) => {
                        self.votes.insert(key, message.clone());
                        ApplyOutcome::Replaced
                    }
                    Some(_) => ApplyOutcome::Stale,
                }
            }
            MessageBody::Moderation(moderation) => {
                let target = moderation.target_id.clone();
                match self.moderations.get(&target) {
                    None => {
                        self.moderations.insert(target, message.clone());
                        ApplyOutcome::Inserted
                    }
                    Some(existing) if moderation_cmp(message, existing) == Ordering::Greater => {
                        self.moderations.insert(target, message.clone());
                        ApplyOutcome::Replaced
                    }
                    Some(_) => ApplyOutcome::Stale,
                }
            }
        };

        if outcome == ApplyOutcome::Stale {
            log::debug!("Stale {:?} {} discarded", key.kind, message.id);
        }
        self.seen.insert(key);
        outcome
    }

    /// Reset all maps and the dedup set (explicit local wipe only).
    pub fn clear(&mut self) {
        self.communities.clear();
        self.threads.clear();
        self.replies.clear();
        self.votes.clear();
        self.moderations.clear();
        self.seen.clear();
    }

    // -----------------------------------------------------------------------
    // Read-only snapshots
    // -----------------------------------------------------------------------

    pub fn communities(&self) -> &BTreeMap<MessageId, Message> {
        &self.communities
    }

    pub fn threads(&self) -> &BTreeMap<MessageId, Message> {
        &self.threads
    }

    pub fn replies(&self) -> &BTreeMap<MessageId, Message> {
        &self.replies
    }

    pub fn votes(&self) -> &BTreeMap<VoteKey, Message> {
        &self.votes
    }

    pub fn moderations(&self) -> &BTreeMap<String, Message> {
        &self.moderations
    }

    /// Whether a message with this `(kind, id, timestamp)` has been processed.
    pub fn has_seen(&self, message: &Message) -> bool {
        self.seen.contains(&DedupKey::of(message))
    }

    /// Look up a community, thread or reply by id.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.communities
            .get(id)
            .or_else(|| self.threads.get(id))
            .or_else(|| self.replies.get(id))
    }

    /// Live vote of `author` on `target`.
    pub fn vote(&self, target: &MessageId, author: &Author) -> Option<&Message> {
        self.votes.get(&VoteKey::new(target.clone(), author.clone()))
    }

    /// Threads referencing a community, ordered by id.
    pub fn threads_in(&self, community: &MessageId) -> Vec<&Message> {
        self.threads
            .values()
            .filter(|m| m.as_thread().map(|t| &t.community_id) == Some(community))
            .collect()
    }

    /// Replies referencing a thread, ordered by id. Replies that arrived
    /// before their thread are included.
    pub fn replies_to(&self, thread: &MessageId) -> Vec<&Message> {
        self.replies
            .values()
            .filter(|m| m.as_reply().map(|r| &r.thread_id) == Some(thread))
            .collect()
    }

    /// Aggregate live votes on a target.
    pub fn tally(&self, target: &MessageId) -> VoteTally {
        let start = VoteKey::new(target.clone(), Author::new(""));
        let mut tally = VoteTally::default();
        for (key, message) in self.votes.range(start..) {
            if &key.target != target {
                break;
            }
            match message.as_vote().map(|v| v.value) {
                Some(VoteValue::Up) => tally.upvoters.push(key.author.clone()),
                Some(VoteValue::Down) => tally.downvoters.push(key.author.clone()),
                None => {}
            }
        }
        tally
    }

    /// Current moderation record for a thread/reply id or author address.
    pub fn moderation_for(&self, target_id: &str) -> Option<&Message> {
        self.moderations.get(target_id)
    }

    /// Total number of cached entries across all maps.
    pub fn len(&self) -> usize {
        self.communities.len()
            + self.threads.len()
            + self.replies.len()
            + self.votes.len()
            + self.moderations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic state hash for convergence verification.
    ///
    /// Hashes every map in canonical BTreeMap iteration order. Two peers that
    /// applied the same message set always produce the same hash. The dedup
    /// set is excluded: it records history, not state.
    pub fn state_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();

        hasher.update(b"C");
        hash_entries(&mut hasher, self.communities.values());
        hasher.update(b"T");
        hash_entries(&mut hasher, self.threads.values());
        hasher.update(b"R");
        hash_entries(&mut hasher, self.replies.values());
        hasher.update(b"V");
        hash_entries(&mut hasher, self.votes.values());
        hasher.update(b"M");
        hash_entries(&mut hasher, self.moderations.values());

        *hasher.finalize().as_bytes()
    }
}

// ---------------------------------------------------------------------------
// Merge rules
// ---------------------------------------------------------------------------

fn upsert_content(map: &mut BTreeMap<MessageId, Message>, message: &Message) -> ApplyOutcome {
    match map.get(&message.id) {
        None => {
            map.insert(message.id.clone(), message.clone());
            ApplyOutcome::Inserted
        }
        Some(existing) if message.timestamp > existing.timestamp => {
            map.insert(message.id.clone(), message.clone());
            ApplyOutcome::Replaced
        }
        Some(_) => ApplyOutcome::Stale,
    }
}

fn moderation_cmp(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id.cmp(&b.id))
}

fn hash_entries<'a>(hasher: &mut blake3::Hasher, entries: impl Iterator<Item = &'a Message>) {
    for message in entries {
        let bytes = serde_json::to_vec(message).unwrap_or_default();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
