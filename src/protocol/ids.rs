/// Core identity types for forum messages.
///
/// - `MessageId`: opaque message identifier (UUID v4 for locally authored messages)
/// - `Author`: identity string of the message author (address or public key hex)
/// - `VoteKey`: `(target, author)` pair keying the live-vote map
///
/// Keeping these as distinct newtypes prevents a thread id from being used
/// where an author is expected, and vice versa.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Opaque message identifier.
///
/// Ordering is plain lexicographic byte order of the underlying string; the
/// causal comparator relies on it as the final peer-independent tiebreak.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Fresh random identifier for a locally authored message.
    pub fn random() -> Self {
        MessageId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(8).collect();
        write!(f, "MessageId({})", short)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId(s)
    }
}

// ---------------------------------------------------------------------------
// Author
// ---------------------------------------------------------------------------

/// Identity string of a message author.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Author(String);

impl Author {
    pub fn new(address: impl Into<String>) -> Self {
        Author(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.0.chars().take(10).collect();
        write!(f, "Author({})", short)
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Author {
    fn from(s: &str) -> Self {
        Author(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// VoteKey
// ---------------------------------------------------------------------------

/// Key of the live-vote map: one vote per voter per target.
///
/// **Ordering**: `(target, author)` so that all votes on one target are
/// contiguous in a `BTreeMap` and can be tallied with a range scan.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoteKey {
    pub target: MessageId,
    pub author: Author,
}

impl VoteKey {
    pub fn new(target: MessageId, author: Author) -> Self {
        VoteKey { target, author }
    }
}

impl fmt::Debug for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VoteKey({:?}, {:?})", self.target, self.author)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_are_unique() {
        let a = MessageId::random();
        let b = MessageId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_message_id_lexicographic_order() {
        assert!(MessageId::from("a") < MessageId::from("b"));
        assert!(MessageId::from("ab") > MessageId::from("a"));
        assert!(MessageId::from("B") < MessageId::from("a"));
    }

    #[test]
    fn test_vote_key_groups_by_target() {
        let k1 = VoteKey::new("t1".into(), "zed".into());
        let k2 = VoteKey::new("t2".into(), "amy".into());
        // Target dominates author in the ordering
        assert!(k1 < k2);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = MessageId::from("msg-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"msg-1\"");
        let author: Author = serde_json::from_str("\"0xabc\"").unwrap();
        assert_eq!(author.as_str(), "0xabc");
    }
}
