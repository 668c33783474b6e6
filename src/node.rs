/// Forum sync node: wires the clock, merge cache, outbox and delivery
/// channel into one service with a start/stop lifecycle.
///
/// All mutable state sits behind a single mutex, so `publish`,
/// `handle_inbound` and `handle_transport_event` are serialized. Status
/// callbacks and `on_message` subscribers always run after that lock has
/// been released; they may call back into the node.
///
/// Outgoing:  sign → size check → apply to cache → outbox (write-ahead) → channel send
/// Incoming:  decode/dedup → verify → accept on channel → clock observe → apply → notify
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::config::{ConfigError, SyncConfig};
use crate::crdt::{ApplyOutcome, CausalClock, ForumCache};
use crate::crypto::signing::{sign_message, IdentityProvider, SigningError};
use crate::network::delivery::{
    ChannelStats, DeliveryError, DeliveryEvent, DeliveryStatus, QueuedCallback, ReliableChannel,
    StatusCallback,
};
use crate::network::listeners::{Listeners, Subscription};
use crate::network::transport::{Transport, TransportError, TransportEvent};
use crate::protocol::{now_ms, Author, CodecError, Message, MessageBody, MessageId, MessageKind};
use crate::relevance::{self, EntityRef, RelevanceBreakdown};
use crate::storage::{DeliveryState, KvStore, Outbox, OutboxError, StorageError};

const CACHE_PREFIX: &str = "cache/";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node not started")]
    NotStarted,

    #[error("Node state lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, NodeError>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct NodeState<T: Transport, S: KvStore> {
    running: bool,
    clock: CausalClock,
    cache: ForumCache,
    outbox: Option<Outbox<Arc<S>>>,
    channel: ReliableChannel<T>,
}

impl<T: Transport, S: KvStore> NodeState<T, S> {
    fn outbox(&mut self) -> Result<&mut Outbox<Arc<S>>> {
        self.outbox.as_mut().ok_or(NodeError::NotStarted)
    }

    /// Drain queued status callbacks, folding each terminal status into the
    /// outbox first. The callbacks are returned unfired.
    fn drain_statuses(&mut self) -> Vec<QueuedCallback> {
        let queued = self.channel.take_callbacks();
        let outbox = match self.outbox.as_mut() {
            Some(outbox) => outbox,
            None => return queued,
        };

        for q in &queued {
            let event = q.event();
            let result = match &event.status {
                DeliveryStatus::Acknowledged => outbox.mark_acknowledged(&event.message_id),
                DeliveryStatus::IrrecoverableError(reason) => {
                    outbox.mark_failed(&event.message_id, reason)
                }
                DeliveryStatus::TransientError(reason) => {
                    log::debug!("Delivery of {} stalled: {}", event.message_id, reason);
                    Ok(false)
                }
                DeliveryStatus::Sent => Ok(false),
            };
            if let Err(e) = result {
                log::error!("Outbox update for {} failed: {}", event.message_id, e);
            }
        }
        queued
    }
}

fn fire(callbacks: Vec<QueuedCallback>) {
    for callback in callbacks {
        callback.fire();
    }
}

fn noop_callback() -> StatusCallback {
    Arc::new(|_: &DeliveryEvent| {})
}

// ---------------------------------------------------------------------------
// ForumNode
// ---------------------------------------------------------------------------

pub struct ForumNode<T: Transport, I: IdentityProvider, S: KvStore> {
    config: SyncConfig,
    identity: I,
    store: Arc<S>,
    state: Mutex<NodeState<T, S>>,
    listeners: Listeners<Message>,
}

impl<T: Transport, I: IdentityProvider, S: KvStore> ForumNode<T, I, S> {
    pub fn new(config: SyncConfig, transport: T, identity: I, store: S) -> Result<Self> {
        config.validate()?;

        let state = NodeState {
            running: false,
            clock: CausalClock::new(config.causal_history_len, config.channel_history_capacity),
            cache: ForumCache::new(),
            outbox: None,
            channel: ReliableChannel::with_replay_capacity(
                transport,
                &config.channel_prefix,
                config.replay_cache_capacity,
            ),
        };

        Ok(ForumNode {
            config,
            identity,
            store: Arc::new(store),
            state: Mutex::new(state),
            listeners: Listeners::new(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, NodeState<T, S>>> {
        self.state.lock().map_err(|_| NodeError::LockPoisoned)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn identity(&self) -> &I {
        &self.identity
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Rehydrate the cache and outbox from the store, subscribe to every
    /// logical channel, then resubmit each unacknowledged outbox entry once.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.running {
            return Ok(());
        }

        let mut restored = 0usize;
        for (key, bytes) in self.store.iterate(CACHE_PREFIX)? {
            let message: Message = match serde_json::from_slice(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    log::error!("Skipping corrupt cache record {}: {}", key, e);
                    continue;
                }
            };
            state.clock.observe(&message);
            state.cache.apply(&message);
            state.channel.mark_known(message.kind(), &message.id);
            restored += 1;
        }

        state.outbox = Some(Outbox::open(self.store.clone())?);
        state.channel.subscribe_all()?;

        let unacked: Vec<MessageId> = state
            .outbox()?
            .unacknowledged()
            .iter()
            .map(|e| e.message_id.clone())
            .collect();
        let mut resubmitted = 0usize;
        for id in &unacked {
            let message = match state.outbox()?.retry(id)? {
                Some(message) => message,
                None => continue,
            };
            // One bad entry must not keep the node from starting
            if let Err(e) = state.channel.send(&message, noop_callback()) {
                log::error!("Resubmission of {} failed: {}", id, e);
                state.outbox()?.mark_failed(id, &e.to_string())?;
                continue;
            }
            state.cache.apply(&message);
            resubmitted += 1;
        }

        state.running = true;
        let callbacks = state.drain_statuses();
        drop(state);

        log::info!(
            "Forum node started: {} cached messages restored, {} of {} unacknowledged resubmitted",
            restored,
            resubmitted,
            unacked.len()
        );
        fire(callbacks);
        Ok(())
    }

    /// Stop accepting work. Persisted state is untouched; `start` resumes.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.running {
            state.running = false;
            log::info!("Forum node stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().map(|s| s.running).unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Outgoing
    // -----------------------------------------------------------------------

    /// Author, sign, apply and send a new message. Returns the signed
    /// message as applied locally.
    ///
    /// Transport refusals do not fail the call; they arrive through
    /// `callback` and leave the message in the outbox for `retry`.
    pub fn publish(
        &self,
        author: Author,
        body: MessageBody,
        callback: Option<StatusCallback>,
    ) -> Result<Message> {
        let message = Message::new(author, now_ms(), body);

        let message = {
            let mut state = self.lock()?;
            if !state.running {
                return Err(NodeError::NotStarted);
            }
            let channel_id = state
                .channel
                .channel_id(message.kind())
                .map(str::to_string)
                .ok_or_else(|| {
                    DeliveryError::UnknownChannel(message.kind().as_str().to_string())
                })?;
            state.clock.enhance(message, &channel_id)
        };

        let message = sign_message(&self.identity, message)?;
        message.validate()?;
        // Size-check the wire form before anything is applied or persisted
        message.encode()?;

        let (outcome, callbacks) = {
            let mut state = self.lock()?;
            if !state.running {
                return Err(NodeError::NotStarted);
            }
            let outcome = state.cache.apply(&message);
            if outcome.changed() {
                self.persist_message(&message)?;
            }
            state.outbox()?.enqueue(&message, now_ms())?;
            state
                .channel
                .send(&message, callback.unwrap_or_else(noop_callback))?;
            (outcome, state.drain_statuses())
        };

        log::info!("Published {:?} {}", message.kind(), message.id);
        if outcome.changed() {
            self.listeners.notify(&message);
        }
        fire(callbacks);
        Ok(message)
    }

    /// Resubmit an unacknowledged message. `Ok(false)` if it was already
    /// acknowledged.
    pub fn retry(&self, id: &MessageId, callback: Option<StatusCallback>) -> Result<bool> {
        let callbacks = {
            let mut state = self.lock()?;
            if !state.running {
                return Err(NodeError::NotStarted);
            }
            let message = match state.outbox()?.retry(id)? {
                Some(message) => message,
                None => return Ok(false),
            };
            state
                .channel
                .send(&message, callback.unwrap_or_else(noop_callback))?;
            state.drain_statuses()
        };

        log::info!("Resubmitted {}", id);
        fire(callbacks);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Incoming
    // -----------------------------------------------------------------------

    /// Feed one transport event in. Returns the inbound message if it
    /// changed the cache.
    pub fn handle_transport_event(&self, event: TransportEvent) -> Result<Option<Message>> {
        match event {
            TransportEvent::Received {
                channel_id,
                payload,
            } => self.handle_inbound(&channel_id, &payload),
            status => {
                let callbacks = {
                    let mut state = self.lock()?;
                    state.channel.process_event(status);
                    state.drain_statuses()
                };
                fire(callbacks);
                Ok(None)
            }
        }
    }

    /// Decode, verify and merge one inbound payload. Malformed, duplicate,
    /// unverifiable and stale messages yield `Ok(None)`.
    pub fn handle_inbound(&self, channel_id: &str, payload: &[u8]) -> Result<Option<Message>> {
        let applied = {
            let mut state = self.lock()?;
            if !state.running {
                return Err(NodeError::NotStarted);
            }

            let message = match state.channel.decode_inbound(channel_id, payload) {
                Some(message) => message,
                None => return Ok(None),
            };

            if self.config.verify_inbound && !self.identity.verify(&message) {
                log::warn!(
                    "Dropping {:?} {} from {}: signature did not verify",
                    message.kind(),
                    message.id,
                    message.author
                );
                state.channel.reject(&message);
                return Ok(None);
            }
            state.channel.accept(&message);

            state.clock.observe(&message);
            let outcome = state.cache.apply(&message);
            if outcome.changed() {
                self.persist_message(&message)?;
            }
            match outcome {
                ApplyOutcome::Inserted | ApplyOutcome::Replaced => Some(message),
                ApplyOutcome::Duplicate | ApplyOutcome::Stale => None,
            }
        };

        if let Some(message) = &applied {
            self.listeners.notify(message);
        }
        Ok(applied)
    }

    /// Subscribe to every message that changes the cache, local or remote.
    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether `id` is still awaiting acknowledgment.
    pub fn is_pending(&self, id: &MessageId) -> Result<bool> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .as_ref()
            .map(|o| o.is_pending(id))
            .unwrap_or(false))
    }

    pub fn delivery_state(&self, id: &MessageId) -> Result<Option<DeliveryState>> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .as_ref()
            .and_then(|o| o.status(id).cloned()))
    }

    pub fn pending_ids(&self) -> Result<Vec<MessageId>> {
        let state = self.lock()?;
        Ok(state
            .outbox
            .as_ref()
            .map(|o| o.pending_ids())
            .unwrap_or_default())
    }

    /// Delete acknowledged outbox entries.
    pub fn collect_garbage(&self) -> Result<usize> {
        let mut state = self.lock()?;
        Ok(state.outbox()?.collect_garbage()?)
    }

    /// Clone of the current cache.
    pub fn snapshot(&self) -> Result<ForumCache> {
        Ok(self.lock()?.cache.clone())
    }

    pub fn score(&self, entity: &EntityRef, now_ms: u64) -> Result<Option<RelevanceBreakdown>> {
        let state = self.lock()?;
        Ok(relevance::score(
            &state.cache,
            entity,
            &self.identity,
            &self.config.scoring,
            now_ms,
        ))
    }

    pub fn rank(&self, kind: MessageKind, now_ms: u64) -> Result<Vec<(EntityRef, RelevanceBreakdown)>> {
        let state = self.lock()?;
        Ok(relevance::rank(
            &state.cache,
            kind,
            &self.identity,
            &self.config.scoring,
            now_ms,
        ))
    }

    pub fn missing_messages(&self) -> Result<Vec<MessageId>> {
        Ok(self.lock()?.channel.missing_messages())
    }

    pub fn channel_stats(&self, kind: MessageKind) -> Result<ChannelStats> {
        Ok(self.lock()?.channel.stats(kind))
    }

    /// Current Lamport value of the vote channel.
    pub fn vote_lamport(&self) -> Result<u64> {
        let state = self.lock()?;
        Ok(state
            .channel
            .channel_id(MessageKind::Vote)
            .map(|ch| state.clock.lamport(ch))
            .unwrap_or(0))
    }

    /// Wipe the cache, the clocks and the persisted cache records. The
    /// outbox is kept.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.cache.clear();
        state.clock.clear();
        for (key, _) in self.store.iterate(CACHE_PREFIX)? {
            self.store.delete(&key)?;
        }
        log::info!("Local forum cache wiped");
        Ok(())
    }

    fn persist_message(&self, message: &Message) -> Result<()> {
        let bytes =
            serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.store
            .put(&format!("{}{}", CACHE_PREFIX, message.id), &bytes)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event pump (native)
// ---------------------------------------------------------------------------

/// Drive a node from a stream of transport events on a tokio task.
///
/// The task ends when every sender is dropped.
#[cfg(feature = "native")]
pub fn spawn_event_pump<T, I, S>(
    node: Arc<ForumNode<T, I, S>>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
) -> tokio::task::JoinHandle<()>
where
    T: Transport + 'static,
    I: IdentityProvider + 'static,
    S: KvStore + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(e) = node.handle_transport_event(event) {
                log::warn!("Transport event not handled: {}", e);
            }
        }
        log::info!("Transport event stream closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Identity;
    use crate::protocol::{ReplyPayload, ThreadPayload, VotePayload, VoteValue};
    use crate::storage::MemoryStore;

    #[derive(Default)]
    struct NullTransport;

    impl Transport for NullTransport {
        fn send(&self, _: &str, _: &str, _: &[u8]) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn subscribe(&self, _: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn node() -> ForumNode<NullTransport, Ed25519Identity, MemoryStore> {
        ForumNode::new(
            SyncConfig::default(),
            NullTransport,
            Ed25519Identity::generate(),
            MemoryStore::new(),
        )
        .unwrap()
    }

    fn thread_body() -> MessageBody {
        MessageBody::Thread(ThreadPayload {
            community_id: "c1".into(),
            title: "Hello".into(),
            content: "First".into(),
        })
    }

    fn vote_body(target: &MessageId, value: VoteValue) -> MessageBody {
        MessageBody::Vote(VotePayload {
            target_id: target.clone(),
            value,
            sds: None,
        })
    }

    #[test]
    fn test_publish_requires_start() {
        let node = node();
        let author = Author::new(node.identity().address());
        assert!(matches!(
            node.publish(author, thread_body(), None),
            Err(NodeError::NotStarted)
        ));
    }

    #[test]
    fn test_publish_applies_and_marks_pending() {
        let node = node();
        node.start().unwrap();
        let author = Author::new(node.identity().address());

        let msg = node.publish(author, thread_body(), None).unwrap();
        assert!(msg.is_signed());
        assert!(node.is_pending(&msg.id).unwrap());
        assert_eq!(node.snapshot().unwrap().threads().len(), 1);
        assert_eq!(node.delivery_state(&msg.id).unwrap(), Some(DeliveryState::Pending));
    }

    #[test]
    fn test_oversized_publish_leaves_no_state() {
        let node = node();
        node.start().unwrap();
        let author = Author::new(node.identity().address());
        let body = MessageBody::Reply(ReplyPayload {
            thread_id: "t1".into(),
            content: "x".repeat(70_000),
        });

        assert!(matches!(
            node.publish(author, body, None),
            Err(NodeError::Codec(CodecError::TooLarge { .. }))
        ));
        assert!(node.pending_ids().unwrap().is_empty());
        assert!(node.snapshot().unwrap().is_empty());
        assert!(node.store.iterate(CACHE_PREFIX).unwrap().is_empty());
        assert!(node.store.iterate("outbox/").unwrap().is_empty());

        // A restart has nothing to resubmit
        node.stop().unwrap();
        node.start().unwrap();
        assert!(node.is_running());
    }

    #[test]
    fn test_local_votes_advance_clock() {
        let node = node();
        node.start().unwrap();
        let author = Author::new(node.identity().address());
        let thread = node.publish(author.clone(), thread_body(), None).unwrap();

        let up = node
            .publish(author.clone(), vote_body(&thread.id, VoteValue::Up), None)
            .unwrap();
        let down = node
            .publish(author.clone(), vote_body(&thread.id, VoteValue::Down), None)
            .unwrap();

        assert_eq!(up.causal_metadata().unwrap().lamport, 1);
        let meta = down.causal_metadata().unwrap();
        assert_eq!(meta.lamport, 2);
        assert_eq!(meta.causal_history, vec![up.id.clone()]);
        assert_eq!(node.vote_lamport().unwrap(), 2);

        let cache = node.snapshot().unwrap();
        let tally = cache.tally(&thread.id);
        assert_eq!(tally.upvotes(), 0);
        assert_eq!(tally.downvotes(), 1);
    }

    #[test]
    fn test_stop_rejects_work() {
        let node = node();
        node.start().unwrap();
        node.stop().unwrap();
        assert!(!node.is_running());
        assert!(matches!(
            node.handle_inbound("/forum/1/thread/json", b"{}"),
            Err(NodeError::NotStarted)
        ));
    }

    #[test]
    fn test_clear_wipes_persisted_cache() {
        let node = node();
        node.start().unwrap();
        let author = Author::new(node.identity().address());
        let msg = node.publish(author, thread_body(), None).unwrap();

        node.clear().unwrap();
        assert!(node.snapshot().unwrap().is_empty());
        assert!(node.store.iterate(CACHE_PREFIX).unwrap().is_empty());
        // Outbox survives the wipe
        assert!(node.is_pending(&msg.id).unwrap());
    }
}
