//! Delivery plumbing between the merge engine and the pub/sub transport.
//!
//! # Module structure
//! - `transport`: Collaborator contract and its event stream
//! - `delivery`: Per-kind logical channels, ack tracking, inbound dedup
//! - `replay_cache`: LRU window of inbound payload hashes
//! - `listeners`: Subscriber fan-out with drop-to-unsubscribe handles
pub mod delivery;
pub mod listeners;
pub mod replay_cache;
pub mod transport;

pub use delivery::{
    channel_id_for, ChannelStats, DeliveryError, DeliveryEvent, DeliveryStatus, QueuedCallback,
    ReliableChannel, StatusCallback,
};
pub use listeners::{Listeners, Subscription};
pub use replay_cache::ReplayCache;
pub use transport::{Transport, TransportError, TransportEvent};
