/// Sync engine configuration.
///
/// Every field has a default, so an empty JSON object (or no file at all)
/// yields a working configuration. `validate` rejects values that would make
/// the clock, dedup window or scoring function misbehave.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::crdt::limits::{CAUSAL_HISTORY_LEN, CHANNEL_HISTORY_CAPACITY, REPLAY_CACHE_CAPACITY};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Config parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// ScoringConfig
// ---------------------------------------------------------------------------

/// Weights of the relevance score.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringConfig {
    pub community_base: f64,
    pub thread_base: f64,
    pub reply_base: f64,

    pub upvote_weight: f64,
    /// Subtracted per downvote.
    pub downvote_weight: f64,
    pub comment_weight: f64,

    pub verified_author_bonus: f64,
    pub verified_upvoter_bonus: f64,
    pub verified_upvoter_cap: f64,
    pub verified_commenter_bonus: f64,
    pub verified_commenter_cap: f64,

    /// Per-day exponential decay rate.
    pub decay_rate: f64,
    /// Multiplier the decay approaches but never reaches.
    pub decay_floor: f64,

    pub moderation_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        ScoringConfig {
            community_base: 15.0,
            thread_base: 10.0,
            reply_base: 5.0,
            upvote_weight: 1.0,
            downvote_weight: 0.5,
            comment_weight: 0.5,
            verified_author_bonus: 2.0,
            verified_upvoter_bonus: 0.1,
            verified_upvoter_cap: 3.0,
            verified_commenter_bonus: 0.5,
            verified_commenter_cap: 3.0,
            decay_rate: 0.1,
            decay_floor: 0.1,
            moderation_penalty: 0.5,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [
            ("communityBase", self.community_base),
            ("threadBase", self.thread_base),
            ("replyBase", self.reply_base),
            ("upvoteWeight", self.upvote_weight),
            ("downvoteWeight", self.downvote_weight),
            ("commentWeight", self.comment_weight),
            ("verifiedAuthorBonus", self.verified_author_bonus),
            ("verifiedUpvoterBonus", self.verified_upvoter_bonus),
            ("verifiedUpvoterCap", self.verified_upvoter_cap),
            ("verifiedCommenterBonus", self.verified_commenter_bonus),
            ("verifiedCommenterCap", self.verified_commenter_cap),
            ("decayRate", self.decay_rate),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if !(self.decay_floor > 0.0 && self.decay_floor <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "decayFloor must be in (0, 1], got {}",
                self.decay_floor
            )));
        }
        if !(self.moderation_penalty >= 0.0 && self.moderation_penalty <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "moderationPenalty must be in [0, 1], got {}",
                self.moderation_penalty
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Logical channel ids are `{channel_prefix}/{kind}/json`.
    pub channel_prefix: String,
    pub causal_history_len: usize,
    pub channel_history_capacity: usize,
    pub replay_cache_capacity: usize,
    /// Drop inbound messages whose signature does not verify.
    pub verify_inbound: bool,
    pub scoring: ScoringConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            channel_prefix: "/forum/1".to_string(),
            causal_history_len: CAUSAL_HISTORY_LEN,
            channel_history_capacity: CHANNEL_HISTORY_CAPACITY,
            replay_cache_capacity: REPLAY_CACHE_CAPACITY,
            verify_inbound: true,
            scoring: ScoringConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading sync config {}", path.display()))?;
        let config = Self::from_json_str(&raw)
            .with_context(|| format!("loading sync config {}", path.display()))?;
        log::info!("Loaded sync config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("channelPrefix must not be empty".into()));
        }
        if self.causal_history_len == 0 {
            return Err(ConfigError::Invalid("causalHistoryLen must be at least 1".into()));
        }
        if self.channel_history_capacity < self.causal_history_len {
            return Err(ConfigError::Invalid(format!(
                "channelHistoryCapacity ({}) must be >= causalHistoryLen ({})",
                self.channel_history_capacity, self.causal_history_len
            )));
        }
        if self.replay_cache_capacity == 0 {
            return Err(ConfigError::Invalid("replayCacheCapacity must be at least 1".into()));
        }
        self.scoring.validate()
    }
}
