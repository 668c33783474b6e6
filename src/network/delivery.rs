/// Reliable delivery channel: a thin adapter over the unordered transport.
///
/// One logical channel per message kind, each with its own channel id,
/// sequence counter, replay window and missing-message set, so a vote
/// backlog never blocks thread delivery. Outbound sends are keyed by a
/// content-derived delivery id and report `Sent` → `Acknowledged` or
/// `IrrecoverableError` through the caller's status callback.
///
/// The channel never retries. Status callbacks are queued and fired by
/// `flush_callbacks` (or handed out by `take_callbacks`), so an owner holding
/// this channel behind a lock can release it before calling out.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use thiserror::Error;

use crate::crdt::limits::{MAX_MISSING_TRACKED, REPLAY_CACHE_CAPACITY};
use crate::crypto::hashing::{content_digest, payload_hash};
use crate::network::listeners::{Listeners, Subscription};
use crate::network::replay_cache::ReplayCache;
use crate::network::transport::{Transport, TransportError, TransportEvent};
use crate::protocol::{now_ms, CodecError, Message, MessageId, MessageKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Encode failed: {0}")]
    Codec(#[from] CodecError),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
}

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Acknowledged,
    /// Retry-able; the registration stays active.
    TransientError(String),
    /// Terminal; the registration is removed and the caller decides on resubmission.
    IrrecoverableError(String),
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Acknowledged | DeliveryStatus::IrrecoverableError(_)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub message_id: MessageId,
    pub delivery_id: String,
    pub kind: MessageKind,
    pub status: DeliveryStatus,
}

pub type StatusCallback = Arc<dyn Fn(&DeliveryEvent) + Send + Sync>;

/// A status callback ready to be fired outside any lock.
pub struct QueuedCallback {
    callback: StatusCallback,
    event: DeliveryEvent,
}

impl QueuedCallback {
    pub fn event(&self) -> &DeliveryEvent {
        &self.event
    }

    pub fn fire(self) {
        (self.callback)(&self.event);
    }
}

// ---------------------------------------------------------------------------
// Logical channels
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub sent: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub received: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    /// Decoded but dropped by the owner, e.g. a failed signature check.
    pub rejected: u64,
    /// Next outbound sequence number on this channel.
    pub next_sequence: u64,
}

struct LogicalChannel {
    kind: MessageKind,
    id: String,
    stats: ChannelStats,
    replay: ReplayCache,
    /// Ids received or sent on this channel, for gap detection.
    known_ids: LruCache<MessageId, ()>,
    /// Ids referenced by causal history but never received.
    missing: BTreeSet<MessageId>,
}

impl LogicalChannel {
    fn new(kind: MessageKind, id: String, replay_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(replay_capacity).unwrap_or(NonZeroUsize::MIN);
        LogicalChannel {
            kind,
            id,
            stats: ChannelStats::default(),
            replay: ReplayCache::new(replay_capacity),
            known_ids: LruCache::new(capacity),
            missing: BTreeSet::new(),
        }
    }

    fn mark_known(&mut self, id: &MessageId) {
        self.known_ids.put(id.clone(), ());
        if self.missing.remove(id) {
            log::debug!("Missing message {} resolved on {}", id, self.id);
        }
    }

    fn track_gaps(&mut self, message: &Message) {
        let meta = match message.causal_metadata() {
            Some(meta) => meta,
            None => return,
        };
        for ancestor in &meta.causal_history {
            if self.known_ids.contains(ancestor) || self.missing.contains(ancestor) {
                continue;
            }
            if self.missing.len() >= MAX_MISSING_TRACKED {
                log::debug!("Missing-message set full on {}; {} not tracked", self.id, ancestor);
                continue;
            }
            self.missing.insert(ancestor.clone());
        }
    }
}

struct Registration {
    message_id: MessageId,
    kind: MessageKind,
    callback: StatusCallback,
}

/// Logical channel id for a message kind.
pub fn channel_id_for(prefix: &str, kind: MessageKind) -> String {
    format!("{}/{}/json", prefix.trim_end_matches('/'), kind.as_str())
}

// ---------------------------------------------------------------------------
// ReliableChannel
// ---------------------------------------------------------------------------

pub struct ReliableChannel<T: Transport> {
    transport: T,
    channels: BTreeMap<MessageKind, LogicalChannel>,
    /// delivery_id → in-flight registration.
    registrations: HashMap<String, Registration>,
    queued: Vec<QueuedCallback>,
    listeners: Listeners<Message>,
}

impl<T: Transport> ReliableChannel<T> {
    pub fn new(transport: T, prefix: &str) -> Self {
        Self::with_replay_capacity(transport, prefix, REPLAY_CACHE_CAPACITY)
    }

    pub fn with_replay_capacity(transport: T, prefix: &str, replay_capacity: usize) -> Self {
        let channels = MessageKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    LogicalChannel::new(*kind, channel_id_for(prefix, *kind), replay_capacity),
                )
            })
            .collect();

        ReliableChannel {
            transport,
            channels,
            registrations: HashMap::new(),
            queued: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn channel_id(&self, kind: MessageKind) -> Option<&str> {
        self.channels.get(&kind).map(|c| c.id.as_str())
    }

    pub fn kind_for_channel(&self, channel_id: &str) -> Option<MessageKind> {
        self.channels
            .values()
            .find(|c| c.id == channel_id)
            .map(|c| c.kind)
    }

    /// Subscribe the transport to every logical channel.
    pub fn subscribe_all(&self) -> Result<(), TransportError> {
        for channel in self.channels.values() {
            self.transport.subscribe(&channel.id)?;
        }
        Ok(())
    }

    /// Encode and hand `message` to the transport on its kind's channel.
    ///
    /// Returns the delivery id. Transport refusals are reported through
    /// `callback`, never as an `Err`.
    pub fn send(&mut self, message: &Message, callback: StatusCallback) -> Result<String, DeliveryError> {
        let payload = message.encode()?;
        let kind = message.kind();
        let channel = self
            .channels
            .get_mut(&kind)
            .ok_or_else(|| DeliveryError::UnknownChannel(kind.as_str().to_string()))?;

        let delivery_id = content_digest(&channel.id, &payload);
        channel.stats.next_sequence += 1;
        channel.mark_known(&message.id);
        // Our own echo is a duplicate
        channel.replay.check_and_insert(payload_hash(&payload), now_ms());

        let event_for = |status: DeliveryStatus| DeliveryEvent {
            message_id: message.id.clone(),
            delivery_id: delivery_id.clone(),
            kind,
            status,
        };

        match self.transport.send(&channel.id, &delivery_id, &payload) {
            Ok(()) => {
                self.registrations.insert(
                    delivery_id.clone(),
                    Registration {
                        message_id: message.id.clone(),
                        kind,
                        callback,
                    },
                );
                log::debug!("Submitted {} on {} as {}", message.id, channel.id, &delivery_id[..12]);
            }
            Err(TransportError::Transient(reason)) => {
                log::warn!("Transport refused {} (transient): {}", message.id, reason);
                self.queued.push(QueuedCallback {
                    callback,
                    event: event_for(DeliveryStatus::TransientError(reason)),
                });
            }
            Err(TransportError::Irrecoverable(reason)) => {
                log::warn!("Transport refused {}: {}", message.id, reason);
                channel.stats.failed += 1;
                self.queued.push(QueuedCallback {
                    callback,
                    event: event_for(DeliveryStatus::IrrecoverableError(reason)),
                });
            }
        }

        Ok(delivery_id)
    }

    /// Feed one transport event in. Status events queue callbacks; a
    /// `Received` event returns the decoded, deduplicated message.
    pub fn process_event(&mut self, event: TransportEvent) -> Option<Message> {
        let (delivery_id, status) = match event {
            TransportEvent::Received {
                channel_id,
                payload,
            } => return self.receive(&channel_id, &payload),
            TransportEvent::Sent { delivery_id } => (delivery_id, DeliveryStatus::Sent),
            TransportEvent::Acknowledged { delivery_id } => {
                (delivery_id, DeliveryStatus::Acknowledged)
            }
            TransportEvent::TransientError {
                delivery_id,
                reason,
            } => (delivery_id, DeliveryStatus::TransientError(reason)),
            TransportEvent::IrrecoverableError {
                delivery_id,
                reason,
            } => (delivery_id, DeliveryStatus::IrrecoverableError(reason)),
        };

        self.resolve_status(delivery_id, status);
        None
    }

    fn resolve_status(&mut self, delivery_id: String, status: DeliveryStatus) {
        let registration = if status.is_terminal() {
            self.registrations.remove(&delivery_id)
        } else {
            self.registrations.get(&delivery_id).map(|r| Registration {
                message_id: r.message_id.clone(),
                kind: r.kind,
                callback: r.callback.clone(),
            })
        };

        let registration = match registration {
            Some(r) => r,
            None => {
                log::debug!("Status {:?} for unknown delivery {}", status, delivery_id);
                return;
            }
        };

        if let Some(channel) = self.channels.get_mut(&registration.kind) {
            match &status {
                DeliveryStatus::Sent => channel.stats.sent += 1,
                DeliveryStatus::Acknowledged => channel.stats.acknowledged += 1,
                DeliveryStatus::IrrecoverableError(_) => channel.stats.failed += 1,
                DeliveryStatus::TransientError(_) => {}
            }
        }

        self.queued.push(QueuedCallback {
            callback: registration.callback,
            event: DeliveryEvent {
                message_id: registration.message_id,
                delivery_id,
                kind: registration.kind,
                status,
            },
        });
    }

    /// Decode an inbound payload and record it in one step. Returns `None`
    /// for duplicates, unknown channels and malformed payloads; none of
    /// these are errors.
    pub fn receive(&mut self, channel_id: &str, payload: &[u8]) -> Option<Message> {
        let message = self.decode_inbound(channel_id, payload)?;
        self.accept(&message);
        Some(message)
    }

    /// Dedup and decode an inbound payload without recording it as received.
    ///
    /// The payload hash enters the replay window, so a repeat of the same
    /// bytes is a duplicate whether or not the message is later accepted.
    pub fn decode_inbound(&mut self, channel_id: &str, payload: &[u8]) -> Option<Message> {
        let kind = match self.kind_for_channel(channel_id) {
            Some(kind) => kind,
            None => {
                log::warn!("Dropping payload on unknown channel {}", channel_id);
                return None;
            }
        };
        let channel = self.channels.get_mut(&kind)?;

        if !channel.replay.check_and_insert(payload_hash(payload), now_ms()) {
            channel.stats.duplicates += 1;
            return None;
        }

        match Message::decode(payload).and_then(|m| {
            if m.kind() == kind {
                Ok(m)
            } else {
                Err(CodecError::KindMismatch {
                    expected: kind,
                    actual: m.kind(),
                })
            }
        }) {
            Ok(message) => Some(message),
            Err(e) => {
                channel.stats.decode_errors += 1;
                log::warn!("Dropping malformed payload on {}: {}", channel_id, e);
                None
            }
        }
    }

    /// Record a decoded inbound message: count it, resolve or open gaps in
    /// its kind's missing set, and notify `on_message` subscribers.
    pub fn accept(&mut self, message: &Message) {
        if let Some(channel) = self.channels.get_mut(&message.kind()) {
            channel.stats.received += 1;
            channel.mark_known(&message.id);
            channel.track_gaps(message);
        }
        self.listeners.notify(message);
    }

    /// Count an inbound message dropped after decoding.
    pub fn reject(&mut self, message: &Message) {
        if let Some(channel) = self.channels.get_mut(&message.kind()) {
            channel.stats.rejected += 1;
        }
    }

    /// Mark `id` as held locally on `kind`'s channel without counting or
    /// announcing it. Used when rehydrating from storage.
    pub fn mark_known(&mut self, kind: MessageKind, id: &MessageId) {
        if let Some(channel) = self.channels.get_mut(&kind) {
            channel.mark_known(id);
        }
    }

    /// Subscribe to every decoded inbound message, across all channels.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Drain queued status callbacks without firing them.
    pub fn take_callbacks(&mut self) -> Vec<QueuedCallback> {
        std::mem::take(&mut self.queued)
    }

    /// Fire every queued status callback.
    pub fn flush_callbacks(&mut self) {
        for queued in self.take_callbacks() {
            queued.fire();
        }
    }

    /// Ids referenced by causal history that never arrived, across channels.
    pub fn missing_messages(&self) -> Vec<MessageId> {
        let mut all: Vec<MessageId> = self
            .channels
            .values()
            .flat_map(|c| c.missing.iter().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    pub fn missing_count(&self) -> usize {
        self.channels.values().map(|c| c.missing.len()).sum()
    }

    pub fn stats(&self, kind: MessageKind) -> ChannelStats {
        self.channels
            .get(&kind)
            .map(|c| c.stats.clone())
            .unwrap_or_default()
    }

    /// Outbound payloads awaiting a terminal status.
    pub fn in_flight(&self) -> usize {
        self.registrations.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
