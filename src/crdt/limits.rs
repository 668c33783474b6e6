/// Sync guardrails.
///
/// These constants bound causal-history growth, inbound dedup memory and
/// message size so that a noisy channel cannot exhaust a client.

/// Max encoded size of a single message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024; // 64 KB

/// Number of preceding message ids attached to an outgoing vote.
pub const CAUSAL_HISTORY_LEN: usize = 3;

/// Message ids remembered per logical channel (FIFO eviction).
pub const CHANNEL_HISTORY_CAPACITY: usize = 100;

/// Inbound payload hashes remembered per channel for duplicate suppression.
pub const REPLAY_CACHE_CAPACITY: usize = 10_000;

/// Max unresolved missing-message ids tracked per channel.
pub const MAX_MISSING_TRACKED: usize = 1_000;

/// Milliseconds per day, for relevance time decay.
pub const MS_PER_DAY: f64 = 86_400_000.0;
