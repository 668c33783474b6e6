/// Causal clock for vote messages.
///
/// Each logical channel carries its own Lamport counter and a bounded FIFO of
/// recently seen message ids. Outgoing votes are stamped with the next
/// counter value plus the last few ids as a cheap ancestor hint; incoming
/// votes pull the local counter forward with the usual catch-up rule.
///
/// **Ordering**: `(lamport, id, timestamp)` when both votes carry metadata,
/// `(timestamp, id)` otherwise. The id tiebreak is what lets every peer pick
/// the same winner for concurrent re-votes without a total Lamport order.
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use crate::crdt::limits::{CAUSAL_HISTORY_LEN, CHANNEL_HISTORY_CAPACITY};
use crate::protocol::{CausalMetadata, Message, MessageBody, MessageId, MessageKind};

// ---------------------------------------------------------------------------
// ChannelClock
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct ChannelClock {
    lamport: u64,
    /// Oldest first.
    history: VecDeque<MessageId>,
}

impl ChannelClock {
    fn record(&mut self, id: &MessageId, capacity: usize) {
        if self.history.contains(id) {
            return;
        }
        self.history.push_back(id.clone());
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    fn recent(&self, n: usize) -> Vec<MessageId> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// CausalClock
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CausalClock {
    history_len: usize,
    history_capacity: usize,
    channels: HashMap<String, ChannelClock>,
}

impl Default for CausalClock {
    fn default() -> Self {
        Self::new(CAUSAL_HISTORY_LEN, CHANNEL_HISTORY_CAPACITY)
    }
}

impl CausalClock {
    pub fn new(history_len: usize, history_capacity: usize) -> Self {
        CausalClock {
            history_len,
            history_capacity: history_capacity.max(history_len),
            channels: HashMap::new(),
        }
    }

    /// Stamp a locally authored vote with its position on `channel_id`.
    ///
    /// Every other kind passes through unchanged.
    pub fn enhance(&mut self, mut message: Message, channel_id: &str) -> Message {
        if message.kind() != MessageKind::Vote {
            return message;
        }

        let clock = self.channels.entry(channel_id.to_string()).or_default();
        clock.lamport += 1;
        let meta = CausalMetadata {
            channel_id: channel_id.to_string(),
            lamport: clock.lamport,
            causal_history: clock.recent(self.history_len),
        };
        clock.record(&message.id, self.history_capacity);
        if let MessageBody::Vote(vote) = &mut message.body {
            vote.sds = Some(meta);
        }

        log::debug!(
            "Stamped vote {} on {} at lamport {}",
            message.id,
            channel_id,
            clock.lamport
        );
        message
    }

    /// Advance the channel clock on receipt of a remote vote.
    ///
    /// Messages without causal metadata are ignored.
    pub fn observe(&mut self, message: &Message) {
        let meta = match message.causal_metadata() {
            Some(meta) => meta,
            None => return,
        };

        let clock = self.channels.entry(meta.channel_id.clone()).or_default();
        clock.lamport = clock.lamport.max(meta.lamport) + 1;
        clock.record(&message.id, self.history_capacity);
    }

    /// Current Lamport value of a channel (0 if never used).
    pub fn lamport(&self, channel_id: &str) -> u64 {
        self.channels.get(channel_id).map(|c| c.lamport).unwrap_or(0)
    }

    /// Remembered message ids of a channel, oldest first.
    pub fn history(&self, channel_id: &str) -> Vec<MessageId> {
        self.channels
            .get(channel_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Total order over two votes; `Greater` means `a` supersedes `b`.
pub fn causal_cmp(a: &Message, b: &Message) -> Ordering {
    match (a.causal_metadata(), b.causal_metadata()) {
        (Some(ma), Some(mb)) => ma
            .lamport
            .cmp(&mb.lamport)
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| a.timestamp.cmp(&b.timestamp)),
        // Legacy peers: wall-clock fallback
        _ => a
            .timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id)),
    }
}

/// Whether `a` is causally newer than `b`.
pub fn is_newer(a: &Message, b: &Message) -> bool {
    causal_cmp(a, b) == Ordering::Greater
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
