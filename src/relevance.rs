/// Relevance scoring over the merge cache.
///
/// `score` is a pure function of the cache snapshot, the verification lookup,
/// the weights and an explicit `now_ms`. It never reads the wall clock.
///
/// ```text
/// total = max(0, base + engagement + author + upvoters + commenters)
///         × time_decay × moderation_penalty
/// ```
use std::collections::BTreeSet;

use crate::config::ScoringConfig;
use crate::crdt::limits::MS_PER_DAY;
use crate::crdt::ForumCache;
use crate::crypto::VerificationSource;
use crate::protocol::{Author, Message, MessageId, MessageKind, ModerationTarget};

/// A scoreable cache entity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    Community(MessageId),
    Thread(MessageId),
    Reply(MessageId),
}

impl EntityRef {
    pub fn id(&self) -> &MessageId {
        match self {
            EntityRef::Community(id) | EntityRef::Thread(id) | EntityRef::Reply(id) => id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            EntityRef::Community(_) => MessageKind::Community,
            EntityRef::Thread(_) => MessageKind::Thread,
            EntityRef::Reply(_) => MessageKind::Reply,
        }
    }

    /// `None` for votes and moderation actions.
    pub fn for_kind(kind: MessageKind, id: MessageId) -> Option<Self> {
        match kind {
            MessageKind::Community => Some(EntityRef::Community(id)),
            MessageKind::Thread => Some(EntityRef::Thread(id)),
            MessageKind::Reply => Some(EntityRef::Reply(id)),
            MessageKind::Vote | MessageKind::Moderation => None,
        }
    }
}

/// Every term of a score, for display and debugging.
#[derive(Clone, Debug, PartialEq)]
pub struct RelevanceBreakdown {
    pub base: f64,
    pub upvotes: usize,
    pub downvotes: usize,
    pub comments: usize,
    pub engagement: f64,
    pub author_verification_bonus: f64,
    pub verified_upvote_bonus: f64,
    pub verified_commenter_bonus: f64,
    pub age_days: f64,
    pub time_decay_multiplier: f64,
    pub moderated: bool,
    pub moderation_penalty_multiplier: f64,
    pub total: f64,
}

/// Score one entity. `None` if it is not in the cache.
pub fn score<V: VerificationSource + ?Sized>(
    cache: &ForumCache,
    entity: &EntityRef,
    verification: &V,
    config: &ScoringConfig,
    now_ms: u64,
) -> Option<RelevanceBreakdown> {
    let (message, base) = match entity {
        EntityRef::Community(id) => (cache.communities().get(id)?, config.community_base),
        EntityRef::Thread(id) => (cache.threads().get(id)?, config.thread_base),
        EntityRef::Reply(id) => (cache.replies().get(id)?, config.reply_base),
    };

    let tally = cache.tally(&message.id);
    let comments = comments_of(cache, entity);

    let engagement = tally.upvotes() as f64 * config.upvote_weight
        - tally.downvotes() as f64 * config.downvote_weight
        + comments.len() as f64 * config.comment_weight;

    let author_verification_bonus = if verification.is_verified(message.author.as_str()) {
        config.verified_author_bonus
    } else {
        0.0
    };

    let verified_upvoters = tally
        .upvoters
        .iter()
        .filter(|a| verification.is_verified(a.as_str()))
        .count();
    let verified_upvote_bonus =
        (verified_upvoters as f64 * config.verified_upvoter_bonus).min(config.verified_upvoter_cap);

    let commenters: BTreeSet<&Author> = comments.iter().map(|m| &m.author).collect();
    let verified_commenters = commenters
        .iter()
        .filter(|a| verification.is_verified(a.as_str()))
        .count();
    let verified_commenter_bonus = (verified_commenters as f64 * config.verified_commenter_bonus)
        .min(config.verified_commenter_cap);

    let age_days = now_ms.saturating_sub(message.timestamp) as f64 / MS_PER_DAY;
    let time_decay_multiplier = time_decay(age_days, config);

    let moderated = is_moderated(cache, entity, message);
    let moderation_penalty_multiplier = if moderated {
        config.moderation_penalty
    } else {
        1.0
    };

    let additive = (base
        + engagement
        + author_verification_bonus
        + verified_upvote_bonus
        + verified_commenter_bonus)
        .max(0.0);
    let total = additive * time_decay_multiplier * moderation_penalty_multiplier;

    Some(RelevanceBreakdown {
        base,
        upvotes: tally.upvotes(),
        downvotes: tally.downvotes(),
        comments: comments.len(),
        engagement,
        author_verification_bonus,
        verified_upvote_bonus,
        verified_commenter_bonus,
        age_days,
        time_decay_multiplier,
        moderated,
        moderation_penalty_multiplier,
        total,
    })
}

/// All cached entities of `kind`, highest score first; ties broken by id.
/// Empty for votes and moderation actions.
pub fn rank<V: VerificationSource + ?Sized>(
    cache: &ForumCache,
    kind: MessageKind,
    verification: &V,
    config: &ScoringConfig,
    now_ms: u64,
) -> Vec<(EntityRef, RelevanceBreakdown)> {
    let ids: Vec<MessageId> = match kind {
        MessageKind::Community => cache.communities().keys().cloned().collect(),
        MessageKind::Thread => cache.threads().keys().cloned().collect(),
        MessageKind::Reply => cache.replies().keys().cloned().collect(),
        MessageKind::Vote | MessageKind::Moderation => return Vec::new(),
    };

    let mut ranked: Vec<(EntityRef, RelevanceBreakdown)> = ids
        .into_iter()
        .filter_map(|id| EntityRef::for_kind(kind, id))
        .filter_map(|entity| {
            let breakdown = score(cache, &entity, verification, config, now_ms)?;
            Some((entity, breakdown))
        })
        .collect();

    ranked.sort_by(|(ea, a), (eb, b)| b.total.total_cmp(&a.total).then_with(|| ea.cmp(eb)));
    ranked
}

/// `floor + (1 - floor) * e^(-rate * days)`. Strictly decreasing toward `floor`.
pub fn time_decay(age_days: f64, config: &ScoringConfig) -> f64 {
    let days = age_days.max(0.0);
    config.decay_floor + (1.0 - config.decay_floor) * (-config.decay_rate * days).exp()
}

// Thread → its replies; community → its threads; replies have none.
fn comments_of<'a>(cache: &'a ForumCache, entity: &EntityRef) -> Vec<&'a Message> {
    match entity {
        EntityRef::Community(id) => cache.threads_in(id),
        EntityRef::Thread(id) => cache.replies_to(id),
        EntityRef::Reply(_) => Vec::new(),
    }
}

fn community_of(cache: &ForumCache, entity: &EntityRef, message: &Message) -> Option<MessageId> {
    match entity {
        EntityRef::Community(id) => Some(id.clone()),
        EntityRef::Thread(_) => message.as_thread().map(|t| t.community_id.clone()),
        EntityRef::Reply(_) => {
            let thread_id = &message.as_reply()?.thread_id;
            let thread = cache.threads().get(thread_id)?;
            thread.as_thread().map(|t| t.community_id.clone())
        }
    }
}

fn is_moderated(cache: &ForumCache, entity: &EntityRef, message: &Message) -> bool {
    if cache.moderation_for(entity.id().as_str()).is_some() {
        return true;
    }

    let community = match community_of(cache, entity, message) {
        Some(c) => c,
        None => return false,
    };
    cache
        .moderation_for(message.author.as_str())
        .and_then(|m| m.as_moderation())
        .map(|m| m.target_type == ModerationTarget::User && m.community_id == community)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        CausalMetadata, CommunityPayload, MessageBody, ModerationPayload, ReplyPayload,
        ThreadPayload, VotePayload, VoteValue,
    };
    use std::collections::HashSet;

    const DAY: u64 = 86_400_000;
    const T0: u64 = 1_700_000_000_000;

    fn community(id: &str, author: &str) -> Message {
        Message::with_id(
            id.into(),
            author.into(),
            T0,
            MessageBody::Community(CommunityPayload {
                name: "rust".into(),
                description: String::new(),
                is_public: true,
            }),
        )
    }

    fn thread(id: &str, community: &str, author: &str) -> Message {
        Message::with_id(
            id.into(),
            author.into(),
            T0,
            MessageBody::Thread(ThreadPayload {
                community_id: community.into(),
                title: "title".into(),
                content: "body".into(),
            }),
        )
    }

    fn reply(id: &str, thread: &str, author: &str) -> Message {
        Message::with_id(
            id.into(),
            author.into(),
            T0,
            MessageBody::Reply(ReplyPayload {
                thread_id: thread.into(),
                content: "reply".into(),
            }),
        )
    }

    fn vote(id: &str, target: &str, author: &str, value: VoteValue) -> Message {
        Message::with_id(
            id.into(),
            author.into(),
            T0,
            MessageBody::Vote(VotePayload {
                target_id: target.into(),
                value,
                sds: Some(CausalMetadata {
                    channel_id: "/forum/1/vote/json".into(),
                    lamport: 1,
                    causal_history: vec![],
                }),
            }),
        )
    }

    fn moderation(id: &str, community: &str, target_type: ModerationTarget, target: &str) -> Message {
        Message::with_id(
            id.into(),
            "0xmod".into(),
            T0,
            MessageBody::Moderation(ModerationPayload {
                community_id: community.into(),
                target_type,
                target_id: target.into(),
                reason: Some("spam".into()),
            }),
        )
    }

    fn nobody() -> HashSet<String> {
        HashSet::new()
    }

    fn thread_score(cache: &ForumCache, verified: &HashSet<String>, now: u64) -> f64 {
        score(
            cache,
            &EntityRef::Thread("t1".into()),
            verified,
            &ScoringConfig::default(),
            now,
        )
        .unwrap()
        .total
    }

    #[test]
    fn test_fresh_thread_scores_base() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        let b = score(
            &cache,
            &EntityRef::Thread("t1".into()),
            &nobody(),
            &ScoringConfig::default(),
            T0,
        )
        .unwrap();
        assert_eq!(b.base, 10.0);
        assert_eq!(b.time_decay_multiplier, 1.0);
        assert_eq!(b.total, 10.0);
    }

    #[test]
    fn test_unknown_entity() {
        let cache = ForumCache::new();
        assert!(score(
            &cache,
            &EntityRef::Reply("nope".into()),
            &nobody(),
            &ScoringConfig::default(),
            T0
        )
        .is_none());
    }

    #[test]
    fn test_engagement_terms() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        cache.apply(&vote("v1", "t1", "0xb", VoteValue::Up));
        cache.apply(&vote("v2", "t1", "0xc", VoteValue::Up));
        cache.apply(&vote("v3", "t1", "0xd", VoteValue::Down));
        cache.apply(&reply("r1", "t1", "0xb"));

        let b = score(
            &cache,
            &EntityRef::Thread("t1".into()),
            &nobody(),
            &ScoringConfig::default(),
            T0,
        )
        .unwrap();
        assert_eq!(b.upvotes, 2);
        assert_eq!(b.downvotes, 1);
        assert_eq!(b.comments, 1);
        // 2*1 - 0.5 + 0.5
        assert!((b.engagement - 2.0).abs() < 1e-9);
        assert!((b.total - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_verification_bonuses_capped() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        let mut verified: HashSet<String> = HashSet::new();
        verified.insert("0xa".into());
        for i in 0..40 {
            let voter = format!("0xv{}", i);
            cache.apply(&vote(&format!("v{}", i), "t1", &voter, VoteValue::Up));
            verified.insert(voter);
        }
        for i in 0..10 {
            let commenter = format!("0xc{}", i);
            cache.apply(&reply(&format!("r{}", i), "t1", &commenter));
            verified.insert(commenter);
        }
        // Same commenter twice counts once
        cache.apply(&reply("r-extra", "t1", "0xc0"));

        let b = score(
            &cache,
            &EntityRef::Thread("t1".into()),
            &verified,
            &ScoringConfig::default(),
            T0,
        )
        .unwrap();
        assert_eq!(b.author_verification_bonus, 2.0);
        assert!((b.verified_upvote_bonus - 3.0).abs() < 1e-9);
        assert!((b.verified_commenter_bonus - 3.0).abs() < 1e-9);
        assert_eq!(b.comments, 11);
    }

    #[test]
    fn test_decay_approaches_floor() {
        let config = ScoringConfig::default();
        assert_eq!(time_decay(0.0, &config), 1.0);
        let a = time_decay(10.0, &config);
        let b = time_decay(100.0, &config);
        let c = time_decay(10_000.0, &config);
        assert!(a > b && b > c);
        assert!(c > 0.0);
        assert!((c - config.decay_floor).abs() < 1e-9);
    }

    #[test]
    fn test_future_timestamp_treated_as_fresh() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        assert_eq!(thread_score(&cache, &nobody(), T0 - DAY), 10.0);
    }

    #[test]
    fn test_upvotes_never_decrease_score() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        for i in 0..5 {
            cache.apply(&vote(&format!("d{}", i), "t1", &format!("0xd{}", i), VoteValue::Down));
        }
        let mut last = thread_score(&cache, &nobody(), T0 + 3 * DAY);
        for i in 0..30 {
            cache.apply(&vote(&format!("u{}", i), "t1", &format!("0xu{}", i), VoteValue::Up));
            let next = thread_score(&cache, &nobody(), T0 + 3 * DAY);
            assert!(next >= last);
            last = next;
        }
    }

    #[test]
    fn test_age_never_increases_score() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        for i in 0..30 {
            cache.apply(&vote(&format!("d{}", i), "t1", &format!("0xd{}", i), VoteValue::Down));
        }
        // Heavily downvoted: additive sum clamps at zero
        assert_eq!(thread_score(&cache, &nobody(), T0), 0.0);

        for i in 0..10 {
            cache.apply(&vote(&format!("u{}", i), "t1", &format!("0xu{}", i), VoteValue::Up));
        }
        assert!(thread_score(&cache, &nobody(), T0) > 0.0);
        let mut last = f64::INFINITY;
        for day in 0..60 {
            let s = thread_score(&cache, &nobody(), T0 + day * DAY);
            assert!(s <= last);
            last = s;
        }
    }

    #[test]
    fn test_moderation_penalty() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        cache.apply(&moderation("m1", "c1", ModerationTarget::Thread, "t1"));
        let b = score(
            &cache,
            &EntityRef::Thread("t1".into()),
            &nobody(),
            &ScoringConfig::default(),
            T0,
        )
        .unwrap();
        assert!(b.moderated);
        assert_eq!(b.total, 5.0);
    }

    #[test]
    fn test_user_moderation_scoped_to_community() {
        let mut cache = ForumCache::new();
        cache.apply(&thread("t1", "c1", "0xa"));
        cache.apply(&thread("t2", "c2", "0xa"));
        cache.apply(&reply("r1", "t1", "0xa"));
        cache.apply(&moderation("m1", "c1", ModerationTarget::User, "0xa"));

        let config = ScoringConfig::default();
        let moderated = |entity: EntityRef| {
            score(&cache, &entity, &nobody(), &config, T0).unwrap().moderated
        };
        assert!(moderated(EntityRef::Thread("t1".into())));
        assert!(moderated(EntityRef::Reply("r1".into())));
        assert!(!moderated(EntityRef::Thread("t2".into())));
    }

    #[test]
    fn test_rank_orders_by_score_then_id() {
        let mut cache = ForumCache::new();
        cache.apply(&community("c1", "0xa"));
        cache.apply(&thread("ta", "c1", "0xa"));
        cache.apply(&thread("tb", "c1", "0xa"));
        cache.apply(&thread("tc", "c1", "0xa"));
        cache.apply(&vote("v1", "tc", "0xb", VoteValue::Up));

        let ranked = rank(&cache, MessageKind::Thread, &nobody(), &ScoringConfig::default(), T0);
        let ids: Vec<&str> = ranked.iter().map(|(e, _)| e.id().as_str()).collect();
        assert_eq!(ids, vec!["tc", "ta", "tb"]);

        assert!(rank(&cache, MessageKind::Vote, &nobody(), &ScoringConfig::default(), T0).is_empty());

        // Community counts its threads as comments
        let c = &rank(&cache, MessageKind::Community, &nobody(), &ScoringConfig::default(), T0)[0].1;
        assert_eq!(c.comments, 3);
    }
}
