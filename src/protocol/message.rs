/// Forum message envelope and payload types.
///
/// Every community action is an immutable, signed message. Messages are the
/// atomic unit of replication: merged into the cache, retained indefinitely,
/// superseded but never deleted.
///
/// - Wire format: one JSON object per message, payload fields flattened next
///   to the envelope fields and discriminated by `kind`
/// - Signing: the identity collaborator signs `signable_bytes()`, i.e. the
///   JSON encoding with `signature` and `signerPublicKey` removed
/// - Votes optionally carry `sds` causal metadata (see `crdt::clock`)
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::limits::MAX_MESSAGE_BYTES;
use crate::protocol::ids::{Author, MessageId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON encoding failed: {0}")]
    Encode(String),

    #[error("JSON decoding failed: {0}")]
    Decode(String),

    #[error("Message exceeds max size ({size} > {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid message: {0}")]
    Invalid(String),

    #[error("Channel carries {expected:?} messages, got {actual:?}")]
    KindMismatch {
        expected: MessageKind,
        actual: MessageKind,
    },
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Discriminant of the five content events.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MessageKind {
    Community = 0,
    Thread = 1,
    Reply = 2,
    Vote = 3,
    Moderation = 4,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Community,
        MessageKind::Thread,
        MessageKind::Reply,
        MessageKind::Vote,
        MessageKind::Moderation,
    ];

    /// Lowercase name, as used in JSON and in channel ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Community => "community",
            MessageKind::Thread => "thread",
            MessageKind::Reply => "reply",
            MessageKind::Vote => "vote",
            MessageKind::Moderation => "moderation",
        }
    }
}

// ---------------------------------------------------------------------------
// Payload types
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommunityPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPayload {
    pub community_id: MessageId,
    pub title: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPayload {
    pub thread_id: MessageId,
    pub content: String,
}

/// Direction of a vote. Encoded on the wire as `1` / `-1`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(try_from = "i8", into = "i8")]
pub enum VoteValue {
    Up,
    Down,
}

impl From<VoteValue> for i8 {
    fn from(v: VoteValue) -> i8 {
        match v {
            VoteValue::Up => 1,
            VoteValue::Down => -1,
        }
    }
}

impl TryFrom<i8> for VoteValue {
    type Error = String;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(VoteValue::Up),
            -1 => Ok(VoteValue::Down),
            other => Err(format!("vote value must be 1 or -1, got {}", other)),
        }
    }
}

/// Causal position of a vote within its logical channel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CausalMetadata {
    pub channel_id: String,
    /// Lamport value assigned by the author's channel clock (>= 1).
    pub lamport: u64,
    /// Most recently seen message ids on the channel, oldest first.
    #[serde(default)]
    pub causal_history: Vec<MessageId>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VotePayload {
    pub target_id: MessageId,
    pub value: VoteValue,
    /// Absent on messages from peers that predate causal ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sds: Option<CausalMetadata>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModerationTarget {
    Thread,
    Reply,
    User,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModerationPayload {
    pub community_id: MessageId,
    pub target_type: ModerationTarget,
    /// Thread/reply id, or the author address for `User` targets.
    pub target_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Kind-specific content of a message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    Community(CommunityPayload),
    Thread(ThreadPayload),
    Reply(ReplyPayload),
    Vote(VotePayload),
    Moderation(ModerationPayload),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Community(_) => MessageKind::Community,
            MessageBody::Thread(_) => MessageKind::Thread,
            MessageBody::Reply(_) => MessageKind::Reply,
            MessageBody::Vote(_) => MessageKind::Vote,
            MessageBody::Moderation(_) => MessageKind::Moderation,
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Immutable, signed forum message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(flatten)]
    pub body: MessageBody,
    /// Wall clock timestamp in milliseconds.
    pub timestamp: u64,
    pub author: Author,
    /// Hex signature over `signable_bytes()`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Hex public key of the signer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_public_key: Option<String>,
}

impl Message {
    /// Build an unsigned message with a fresh random id.
    pub fn new(author: Author, timestamp: u64, body: MessageBody) -> Self {
        Self::with_id(MessageId::random(), author, timestamp, body)
    }

    pub fn with_id(id: MessageId, author: Author, timestamp: u64, body: MessageBody) -> Self {
        Message {
            id,
            body,
            timestamp,
            author,
            signature: None,
            signer_public_key: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some() && self.signer_public_key.is_some()
    }

    pub fn as_community(&self) -> Option<&CommunityPayload> {
        match &self.body {
            MessageBody::Community(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<&ThreadPayload> {
        match &self.body {
            MessageBody::Thread(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_reply(&self) -> Option<&ReplyPayload> {
        match &self.body {
            MessageBody::Reply(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_vote(&self) -> Option<&VotePayload> {
        match &self.body {
            MessageBody::Vote(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_moderation(&self) -> Option<&ModerationPayload> {
        match &self.body {
            MessageBody::Moderation(p) => Some(p),
            _ => None,
        }
    }

    /// Causal metadata, if this is a vote that carries it.
    pub fn causal_metadata(&self) -> Option<&CausalMetadata> {
        self.as_vote().and_then(|v| v.sds.as_ref())
    }

    /// Produce the canonical bytes to sign/verify.
    ///
    /// Includes all fields except `signature` and `signerPublicKey`. Field
    /// order is fixed by the struct definitions, so the encoding is stable.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.signer_public_key = None;
        serde_json::to_vec(&unsigned).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Structural checks applied to every decoded message.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.id.as_str().is_empty() {
            return Err(CodecError::Invalid("empty id".into()));
        }
        if self.author.as_str().is_empty() {
            return Err(CodecError::Invalid("empty author".into()));
        }
        if let Some(meta) = self.causal_metadata() {
            if meta.lamport == 0 {
                return Err(CodecError::Invalid("lamport must be >= 1".into()));
            }
        }
        Ok(())
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = serde_json::to_vec(self).map_err(|e| CodecError::Encode(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }
        Ok(bytes)
    }

    /// Deserialize and validate a message from the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_MESSAGE_BYTES {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_BYTES,
            });
        }
        let message: Message =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(target: &str, value: VoteValue, sds: Option<CausalMetadata>) -> Message {
        Message::with_id(
            "v1".into(),
            "0xalice".into(),
            1_700_000_000_000,
            MessageBody::Vote(VotePayload {
                target_id: target.into(),
                value,
                sds,
            }),
        )
    }

    #[test]
    fn test_wire_format_is_flat() {
        let msg = vote(
            "t1",
            VoteValue::Down,
            Some(CausalMetadata {
                channel_id: "/forum/1/vote/json".into(),
                lamport: 2,
                causal_history: vec!["v0".into()],
            }),
        );
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "vote");
        assert_eq!(json["targetId"], "t1");
        assert_eq!(json["value"], -1);
        assert_eq!(json["sds"]["lamport"], 2);
        assert_eq!(json["sds"]["causalHistory"][0], "v0");
        assert!(json.get("signature").is_none());
    }

    #[test]
    fn test_decode_external_json() {
        let raw = br#"{
            "id": "r-9",
            "kind": "reply",
            "threadId": "t-1",
            "content": "hello",
            "timestamp": 42,
            "author": "0xbob",
            "signature": "ab",
            "signerPublicKey": "cd"
        }"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.kind(), MessageKind::Reply);
        assert_eq!(msg.as_reply().unwrap().thread_id.as_str(), "t-1");
        assert!(msg.is_signed());
    }

    #[test]
    fn test_decode_rejects_bad_vote_value() {
        let raw = br#"{"id":"v","kind":"vote","targetId":"t","value":3,"timestamp":1,"author":"a"}"#;
        assert!(matches!(Message::decode(raw), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_zero_lamport() {
        let raw = br#"{"id":"v","kind":"vote","targetId":"t","value":1,"timestamp":1,"author":"a",
            "sds":{"channelId":"c","lamport":0,"causalHistory":[]}}"#;
        assert!(matches!(Message::decode(raw), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode(b"not json").is_err());
        assert!(Message::decode(br#"{"id":"x","kind":"poll"}"#).is_err());
    }

    #[test]
    fn test_signable_bytes_ignore_signature() {
        let mut msg = vote("t1", VoteValue::Up, None);
        let before = msg.signable_bytes().unwrap();
        msg.signature = Some("00".repeat(64));
        msg.signer_public_key = Some("11".repeat(32));
        assert_eq!(before, msg.signable_bytes().unwrap());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = Message::new(
            "0xalice".into(),
            1,
            MessageBody::Reply(ReplyPayload {
                thread_id: "t".into(),
                content: "x".repeat(MAX_MESSAGE_BYTES + 1),
            }),
        );
        assert!(matches!(msg.encode(), Err(CodecError::TooLarge { .. })));
    }
}
