//! Time-based decay and expiry of a single item.

use chrono::{DateTime, Utc};
use synapse_state::MemoryItem;

use crate::config::TierPolicy;

/// What a decay pass does to one item.
#[derive(Debug, Clone, PartialEq)]
pub enum DecayOutcome {
    /// Nothing to write back.
    Unchanged,
    /// Score lowered; the item must be written back.
    Decayed(MemoryItem),
    /// Below the tier's threshold or past its retention window.
    Expired,
}

/// Apply `policy` to `item` as of `now`.
///
/// The elapsed time is measured from the later of `created_at` and the last
/// decay (`decayed_at`), so consecutive passes compose to
/// `exp(-age / half_life)` and a repeated pass at the same instant changes
/// nothing.
pub fn apply_decay(item: &MemoryItem, policy: &TierPolicy, now: DateTime<Utc>) -> DecayOutcome {
    let age_secs = seconds_between(item.created_at, now);
    if age_secs > policy.retention_secs as f64 {
        return DecayOutcome::Expired;
    }

    let anchor = match item.decayed_at {
        Some(decayed_at) if decayed_at > item.created_at => decayed_at,
        _ => item.created_at,
    };
    let elapsed = seconds_between(anchor, now);

    if elapsed <= 0.0 {
        return if item.decay_score < policy.expiry_threshold {
            DecayOutcome::Expired
        } else {
            DecayOutcome::Unchanged
        };
    }

    let half_life = policy.half_life_secs.max(1) as f64;
    let factor = (-elapsed / half_life).exp();
    let score = (item.decay_score * factor).clamp(0.0, 1.0);

    if score < policy.expiry_threshold {
        return DecayOutcome::Expired;
    }

    let mut decayed = item.clone();
    decayed.decay_score = score;
    decayed.decayed_at = Some(now);
    DecayOutcome::Decayed(decayed)
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1_000.0
}
