// Crate-level lint configuration: suppress stylistic warnings that don't affect correctness.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::type_complexity,
    clippy::new_without_default
)]

//! Forum sync: convergent community content over an unordered pub/sub network.
//!
//! | Module | Role |
//! |---|---|
//! | `protocol` | Message ids, the signed message envelope, JSON codec |
//! | `crypto` | Ed25519 identity collaborator, content digests |
//! | `crdt` | Causal clock for votes, merge/cache engine |
//! | `network` | Transport contract, reliable per-kind delivery channels |
//! | `storage` | Key-value contract, durable outbox |
//! | `relevance` | Deterministic ranking over the merged cache |
//! | `config` | `SyncConfig` / `ScoringConfig` |
//! | `node` | `ForumNode` service with start/stop lifecycle |

pub mod config;
pub mod crdt;
pub mod crypto;
pub mod network;
pub mod node;
pub mod protocol;
pub mod relevance;
pub mod storage;

// ── Re-export main types ────────────────────────────────────────────────────
pub use config::{ConfigError, ScoringConfig, SyncConfig};
pub use crdt::{ApplyOutcome, CausalClock, ForumCache, VoteTally};
pub use crypto::{Ed25519Identity, IdentityProvider, VerificationSource};
pub use network::{
    DeliveryEvent, DeliveryStatus, ReliableChannel, StatusCallback, Subscription, Transport,
    TransportError, TransportEvent,
};
#[cfg(feature = "native")]
pub use node::spawn_event_pump;
pub use node::{ForumNode, NodeError};
pub use protocol::{Author, Message, MessageBody, MessageId, MessageKind};
pub use relevance::{EntityRef, RelevanceBreakdown};
pub use storage::{DeliveryState, KvStore, MemoryStore, Outbox, StorageError};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}
