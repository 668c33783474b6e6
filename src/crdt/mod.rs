//! Convergent forum state: causal ordering for votes and the merge cache.
//!
//! Forum content is an append-only multiset of signed messages. Every client
//! folds whatever subset it has received into the same projection, in any
//! order and with any duplication.
//!
//! # Module structure
//! - `limits`: Guardrail constants
//! - `clock`: Per-channel Lamport clock and the vote comparator
//! - `cache`: Merge engine (ForumCache, apply, tally, state_hash)
pub mod cache;
pub mod clock;
pub mod limits;

pub use cache::{ApplyOutcome, ForumCache, VoteTally};
pub use clock::{causal_cmp, is_newer, CausalClock};
