/// Transport collaborator contract.
///
/// The pub/sub network is a black box that accepts encoded payloads for a
/// channel and later reports what happened to each one. Progress and inbound
/// traffic both arrive as `TransportEvent`s, which the owner feeds into the
/// delivery channel (directly, or through the tokio event pump in `node`).
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Retry-able condition (no peers, rate limited, ...).
    #[error("Transient transport error: {0}")]
    Transient(String),
    /// The transport gave up permanently.
    #[error("Irrecoverable transport error: {0}")]
    Irrecoverable(String),
}

/// Events emitted by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport accepted the payload for propagation.
    Sent { delivery_id: String },
    /// Durable receipt confirmed.
    Acknowledged { delivery_id: String },
    /// Propagation stalled on a retry-able condition.
    TransientError { delivery_id: String, reason: String },
    /// The transport gave up on the payload.
    IrrecoverableError { delivery_id: String, reason: String },
    /// Inbound payload on a subscribed channel.
    Received { channel_id: String, payload: Vec<u8> },
}

pub trait Transport: Send + Sync {
    /// Hand an encoded payload to the network. `delivery_id` keys every
    /// later status event for this payload.
    fn send(&self, channel_id: &str, delivery_id: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Start receiving `Received` events for a channel.
    fn subscribe(&self, channel_id: &str) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, channel_id: &str, delivery_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        (**self).send(channel_id, delivery_id, payload)
    }

    fn subscribe(&self, channel_id: &str) -> Result<(), TransportError> {
        (**self).subscribe(channel_id)
    }
}
