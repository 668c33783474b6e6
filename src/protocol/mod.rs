//! Message model: ids, the signed message envelope, and its JSON codec.

pub mod ids;
pub mod message;

pub use ids::{Author, MessageId, VoteKey};
pub use message::{
    CausalMetadata, CodecError, CommunityPayload, Message, MessageBody, MessageKind,
    ModerationPayload, ModerationTarget, ReplyPayload, ThreadPayload, VotePayload, VoteValue,
};

/// Current time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
