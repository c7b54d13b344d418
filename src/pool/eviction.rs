//! Eviction scoring
//!
//! Pure functions over context metadata. Higher score means more evictable;
//! in-use and protected contexts score negative infinity and are never
//! picked. Ties go to the oldest context so the outcome is deterministic.

use std::collections::HashSet;
use std::sync::Arc;

use super::context::{ContextSlot, PROTECTED_TAG};

/// Weights applied by [`eviction_score`].
#[derive(Debug, Clone, Copy)]
pub struct EvictionWeights {
    pub idle: f64,
    pub error: f64,
    pub age: f64,
}

/// Eviction priority for one context.
///
/// `w_idle * idle_seconds + w_error * error_rate * 100 + w_age * age_seconds`,
/// where idle time falls back to the age for never-used contexts.
#[must_use]
pub fn eviction_score(ctx: &ContextSlot, weights: &EvictionWeights) -> f64 {
    let state = ctx.state();
    if state.in_use || state.tags.contains(PROTECTED_TAG) {
        return f64::NEG_INFINITY;
    }

    let idle_seconds = match state.last_used_at {
        Some(last_used) => last_used.elapsed().as_secs_f64(),
        None => ctx.created_at().elapsed().as_secs_f64(),
    };
    let error_rate = if state.total_requests > 0 {
        state.error_count as f64 / state.total_requests as f64
    } else {
        0.0
    };
    let age_seconds = ctx.created_at().elapsed().as_secs_f64();

    weights.idle * idle_seconds + weights.error * error_rate * 100.0 + weights.age * age_seconds
}

/// Pick the context with the highest finite eviction score.
///
/// Contexts carrying any of `exclude_tags` are skipped, as are retiring
/// ones (their replacement is already on the way). Returns `None` when
/// nothing is evictable.
#[must_use]
pub fn find_eviction_candidate<'a>(
    contexts: impl IntoIterator<Item = &'a Arc<ContextSlot>>,
    weights: &EvictionWeights,
    exclude_tags: Option<&HashSet<String>>,
) -> Option<Arc<ContextSlot>> {
    let mut best: Option<(f64, Arc<ContextSlot>)> = None;

    for ctx in contexts {
        {
            let state = ctx.state();
            if state.retiring {
                continue;
            }
            if let Some(excluded) = exclude_tags
                && !state.tags.is_disjoint(excluded)
            {
                continue;
            }
        }

        let score = eviction_score(ctx, weights);
        if score == f64::NEG_INFINITY {
            continue;
        }

        let replace = match &best {
            None => true,
            Some((best_score, best_ctx)) => {
                score > *best_score
                    || (score == *best_score && ctx.created_at() < best_ctx.created_at())
            }
        };
        if replace {
            best = Some((score, Arc::clone(ctx)));
        }
    }

    best.map(|(_, ctx)| ctx)
}

/// Whether the context crossed the consecutive-error threshold and should
/// be replaced by a fresh one with the same proxy and tags.
#[must_use]
pub fn should_recreate(ctx: &ContextSlot, max_consecutive_errors: u32) -> bool {
    ctx.state().consecutive_errors >= max_consecutive_errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverContext;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    const WEIGHTS: EvictionWeights = EvictionWeights {
        idle: 1.0,
        error: 2.0,
        age: 0.1,
    };

    fn slot(tags: &[&str]) -> ContextSlot {
        ContextSlot::new(
            Uuid::new_v4(),
            DriverContext::new(1),
            None,
            false,
            None,
            None,
            tags.iter().map(|t| t.to_string()).collect::<HashSet<_>>(),
        )
    }

    #[test]
    fn protected_context_never_evicted() {
        let ctx = slot(&["protected"]);
        assert_eq!(eviction_score(&ctx, &WEIGHTS), f64::NEG_INFINITY);
    }

    #[test]
    fn in_use_context_never_evicted() {
        let ctx = slot(&[]);
        ctx.state().in_use = true;
        assert_eq!(eviction_score(&ctx, &WEIGHTS), f64::NEG_INFINITY);
    }

    #[test]
    fn idle_context_scores_higher() {
        let fresh = slot(&[]);
        fresh.state().last_used_at = Some(Instant::now());
        let idle = slot(&[]);
        idle.state().last_used_at = Some(Instant::now() - Duration::from_secs(3600));

        assert!(eviction_score(&idle, &WEIGHTS) > eviction_score(&fresh, &WEIGHTS));
    }

    #[test]
    fn error_rate_increases_score() {
        let clean = slot(&[]);
        clean.state().total_requests = 100;

        let dirty = slot(&[]);
        {
            let mut state = dirty.state();
            state.total_requests = 100;
            state.error_count = 50;
        }

        assert!(eviction_score(&dirty, &WEIGHTS) > eviction_score(&clean, &WEIGHTS));
    }

    #[test]
    fn age_increases_score() {
        let mut old = slot(&[]);
        old.backdate_created_at(Duration::from_secs(86_400));
        let old_score = eviction_score(&old, &WEIGHTS);

        let young = slot(&[]);
        assert!(old_score > eviction_score(&young, &WEIGHTS));
    }

    #[test]
    fn candidate_is_highest_scoring() {
        let mut old = slot(&[]);
        old.backdate_created_at(Duration::from_secs(7200));
        let old = Arc::new(old);
        let new = Arc::new(slot(&[]));

        let contexts = [Arc::clone(&old), Arc::clone(&new)];
        let victim = find_eviction_candidate(contexts.iter(), &WEIGHTS, None).expect("candidate");
        assert_eq!(victim.id(), old.id());
    }

    #[test]
    fn candidate_skips_excluded_tags() {
        let mut premium = slot(&["premium"]);
        premium.backdate_created_at(Duration::from_secs(7200));
        let premium = Arc::new(premium);
        let basic = Arc::new(slot(&["basic"]));

        let exclude: HashSet<String> = ["premium".to_string()].into_iter().collect();
        let contexts = [Arc::clone(&premium), Arc::clone(&basic)];
        let victim = find_eviction_candidate(contexts.iter(), &WEIGHTS, Some(&exclude))
            .expect("candidate");
        assert_eq!(victim.id(), basic.id());
    }

    #[test]
    fn no_candidate_when_all_shielded() {
        let protected = Arc::new(slot(&["protected"]));
        let busy = Arc::new(slot(&[]));
        busy.state().in_use = true;

        let contexts = [protected, busy];
        assert!(find_eviction_candidate(contexts.iter(), &WEIGHTS, None).is_none());
    }

    #[test]
    fn recreate_threshold() {
        let ctx = slot(&[]);
        ctx.state().consecutive_errors = 2;
        assert!(!should_recreate(&ctx, 5));

        ctx.state().consecutive_errors = 5;
        assert!(should_recreate(&ctx, 5));

        ctx.state().consecutive_errors = 10;
        assert!(should_recreate(&ctx, 5));
    }
}
