/// Outbox: durable record of messages this client authored but that have
/// not yet been acknowledged, and the pending-id set behind the UI's
/// "syncing…" indicator.
///
/// Every entry is written to the store *before* the message is handed to the
/// transport, so a crash mid-send leaves a recoverable record. Entries move
/// `Pending → Confirmed` on acknowledgment or `Pending → Failed` on an
/// irrecoverable error. Failed entries are never deleted automatically; the
/// caller resubmits them through `retry`.
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::protocol::{Message, MessageId, MessageKind};
use crate::storage::{KvStore, StorageError};

const OUTBOX_PREFIX: &str = "outbox/";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Entry serialization failed: {0}")]
    Serialize(String),

    #[error("Outbox entry not found: {0}")]
    NotFound(MessageId),
}

// ---------------------------------------------------------------------------
// OutboxEntry
// ---------------------------------------------------------------------------

/// Delivery phase of one outgoing message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed { reason: String },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub message_id: MessageId,
    pub message_kind: MessageKind,
    pub payload: Message,
    /// Milliseconds since Unix epoch.
    pub enqueued_at: u64,
    pub acknowledged: bool,
    pub state: DeliveryState,
    /// Times the message was handed to the transport.
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

pub struct Outbox<S: KvStore> {
    store: S,
    entries: HashMap<MessageId, OutboxEntry>,
    pending: HashSet<MessageId>,
}

impl<S: KvStore> Outbox<S> {
    /// Open the outbox, rehydrating every persisted entry.
    ///
    /// Unacknowledged entries come back as `Pending`: they are about to be
    /// resubmitted by startup reconciliation.
    pub fn open(store: S) -> Result<Self, OutboxError> {
        let mut entries = HashMap::new();
        let mut pending = HashSet::new();

        for (key, bytes) in store.iterate(OUTBOX_PREFIX)? {
            let mut entry: OutboxEntry = match serde_json::from_slice(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    log::error!("Skipping corrupt outbox record {}: {}", key, e);
                    continue;
                }
            };
            if !entry.acknowledged {
                entry.state = DeliveryState::Pending;
                pending.insert(entry.message_id.clone());
            }
            entries.insert(entry.message_id.clone(), entry);
        }

        log::info!(
            "Outbox rehydrated: {} entries, {} unacknowledged",
            entries.len(),
            pending.len()
        );
        Ok(Outbox {
            store,
            entries,
            pending,
        })
    }

    /// Persist `message` as pending. Re-enqueueing a known id is a no-op.
    pub fn enqueue(&mut self, message: &Message, now_ms: u64) -> Result<(), OutboxError> {
        if self.entries.contains_key(&message.id) {
            return Ok(());
        }

        let entry = OutboxEntry {
            message_id: message.id.clone(),
            message_kind: message.kind(),
            payload: message.clone(),
            enqueued_at: now_ms,
            acknowledged: false,
            state: DeliveryState::Pending,
            attempts: 1,
        };
        self.persist(&entry)?;

        self.pending.insert(entry.message_id.clone());
        self.entries.insert(entry.message_id.clone(), entry);
        log::debug!("Outbox enqueued {}", message.id);
        Ok(())
    }

    /// Confirm delivery. Returns `false` if the id was unknown or already confirmed.
    pub fn mark_acknowledged(&mut self, id: &MessageId) -> Result<bool, OutboxError> {
        self.pending.remove(id);
        let entry = match self.entries.get_mut(id) {
            Some(entry) if !entry.acknowledged => entry,
            _ => return Ok(false),
        };
        entry.acknowledged = true;
        entry.state = DeliveryState::Confirmed;

        let snapshot = entry.clone();
        self.persist(&snapshot)?;
        log::info!("Outbox acknowledged {}", id);
        Ok(true)
    }

    /// Record an irrecoverable delivery failure. The entry stays
    /// unacknowledged until `retry` succeeds.
    pub fn mark_failed(&mut self, id: &MessageId, reason: &str) -> Result<bool, OutboxError> {
        let entry = match self.entries.get_mut(id) {
            Some(entry) if !entry.acknowledged => entry,
            _ => return Ok(false),
        };
        entry.state = DeliveryState::Failed {
            reason: reason.to_string(),
        };
        self.pending.remove(id);

        let snapshot = entry.clone();
        self.persist(&snapshot)?;
        log::warn!("Outbox delivery failed for {}: {}", id, reason);
        Ok(true)
    }

    /// Move an unacknowledged entry back to `Pending` for resubmission and
    /// return its message. `None` if it was already acknowledged.
    pub fn retry(&mut self, id: &MessageId) -> Result<Option<Message>, OutboxError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.clone()))?;
        if entry.acknowledged {
            return Ok(None);
        }
        entry.state = DeliveryState::Pending;
        entry.attempts += 1;

        let snapshot = entry.clone();
        self.persist(&snapshot)?;
        self.pending.insert(id.clone());
        Ok(Some(snapshot.payload))
    }

    /// Delete confirmed entries. Returns how many were removed.
    pub fn collect_garbage(&mut self) -> Result<usize, OutboxError> {
        let confirmed: Vec<MessageId> = self
            .entries
            .values()
            .filter(|e| e.acknowledged)
            .map(|e| e.message_id.clone())
            .collect();

        for id in &confirmed {
            self.store.delete(&entry_key(id))?;
            self.entries.remove(id);
        }
        Ok(confirmed.len())
    }

    /// O(1) "still syncing" check.
    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.pending.contains(id)
    }

    pub fn status(&self, id: &MessageId) -> Option<&DeliveryState> {
        self.entries.get(id).map(|e| &e.state)
    }

    pub fn entry(&self, id: &MessageId) -> Option<&OutboxEntry> {
        self.entries.get(id)
    }

    /// Pending ids, sorted.
    pub fn pending_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<_> = self.pending.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Unacknowledged entries in enqueue order.
    pub fn unacknowledged(&self) -> Vec<&OutboxEntry> {
        let mut entries: Vec<_> = self.entries.values().filter(|e| !e.acknowledged).collect();
        entries.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let bytes = serde_json::to_vec(entry).map_err(|e| OutboxError::Serialize(e.to_string()))?;
        self.store.put(&entry_key(&entry.message_id), &bytes)?;
        Ok(())
    }
}

fn entry_key(id: &MessageId) -> String {
    format!("{}{}", OUTBOX_PREFIX, id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
