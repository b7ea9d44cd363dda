//! Context assembly - one pure function from snapshots to a package
//!
//! Selection algorithm:
//! 1. Filter each tier by the profile (preferred/excluded kinds, min
//!    importance), score by importance desc then recency desc
//! 2. Pin the head (top-N importance) and tail (most-recent-N) per tier;
//!    pinned cost is deducted from the TOTAL budget before tier shares
//! 3. Split the remaining budget into tier shares (floor, remainder to the
//!    highest-weight tier), then fill each tier greedily in score order,
//!    stopping at the first item that would overflow the share
//! 4. Concatenate task → project → global, record cost and the
//!    selected/available compression ratio, fingerprint the result

use sha2::{Digest, Sha256};

use crate::memory::{ContextItem, Tier, TierSnapshots};

use super::{ContextFingerprint, ContextPackage, ContextProfile};

/// Assemble a package for one node invocation.
///
/// Pure: identical inputs yield byte-identical packages. Degraded-tier
/// handling (a `None` snapshot) happens upstream; here a missing tier is
/// simply empty.
pub fn assemble(
    profile_id: &str,
    profile: &ContextProfile,
    snapshots: &TierSnapshots,
    mode: &str,
) -> ContextPackage {
    let tiers = [
        (Tier::Task, snapshots.task.as_deref()),
        (Tier::Project, snapshots.project.as_deref()),
        (Tier::Global, snapshots.global.as_deref()),
    ];

    // Per-tier filtered + scored candidates
    let mut candidates: Vec<Vec<ContextItem>> = Vec::with_capacity(3);
    let mut available_cost: u64 = 0;
    for (_, items) in &tiers {
        let mut filtered: Vec<ContextItem> = items
            .unwrap_or_default()
            .iter()
            .filter(|item| admits(profile, item))
            .cloned()
            .collect();
        score_sort(&mut filtered);
        available_cost += filtered.iter().map(|i| u64::from(i.token_cost)).sum::<u64>();
        candidates.push(filtered);
    }

    // Pin per tier: head by importance (candidates are score-sorted, so the
    // head is a prefix), tail by recency
    let mut pinned: Vec<Vec<bool>> = Vec::with_capacity(3);
    let mut pinned_cost: u64 = 0;
    for tier_items in &candidates {
        let mut flags = vec![false; tier_items.len()];
        for flag in flags.iter_mut().take(profile.head_preserve) {
            *flag = true;
        }
        if profile.tail_preserve > 0 {
            let mut by_recency: Vec<usize> = (0..tier_items.len()).collect();
            by_recency.sort_by(|&a, &b| {
                tier_items[b]
                    .timestamp
                    .cmp(&tier_items[a].timestamp)
                    .then_with(|| tier_items[a].id.cmp(&tier_items[b].id))
            });
            for &idx in by_recency.iter().take(profile.tail_preserve) {
                flags[idx] = true;
            }
        }
        pinned_cost += tier_items
            .iter()
            .zip(&flags)
            .filter(|(_, &p)| p)
            .map(|(i, _)| u64::from(i.token_cost))
            .sum::<u64>();
        pinned.push(flags);
    }

    // Tier shares over what the pins left behind
    let remaining = u64::from(profile.budget).saturating_sub(pinned_cost);
    let weights = [
        profile.tier_weights.task,
        profile.tier_weights.project,
        profile.tier_weights.global,
    ];
    let mut shares: [u64; 3] = [0; 3];
    for (i, w) in weights.iter().enumerate() {
        shares[i] = (remaining as f64 * f64::from(*w)).floor() as u64;
    }
    let distributed: u64 = shares.iter().sum();
    let top_weight = weights
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);
    shares[top_weight] += remaining.saturating_sub(distributed);

    // Greedy fill per tier; pinned items ride along outside the share
    let mut selected: Vec<ContextItem> = Vec::new();
    let mut tier_counts = [0usize; 3];
    let mut total_cost: u64 = 0;
    for (tier_idx, tier_items) in candidates.iter().enumerate() {
        let mut share_spent: u64 = 0;
        let mut share_closed = false;
        for (item_idx, item) in tier_items.iter().enumerate() {
            let cost = u64::from(item.token_cost);
            if pinned[tier_idx][item_idx] {
                selected.push(item.clone());
                tier_counts[tier_idx] += 1;
                total_cost += cost;
                continue;
            }
            // Selection stops at the first overflow; later pins still land
            if share_closed || share_spent + cost > shares[tier_idx] {
                share_closed = true;
                continue;
            }
            share_spent += cost;
            selected.push(item.clone());
            tier_counts[tier_idx] += 1;
            total_cost += cost;
        }
    }

    let compression_ratio = if available_cost == 0 {
        1.0
    } else {
        total_cost as f32 / available_cost as f32
    };

    let mut sources: Vec<&str> = selected
        .iter()
        .map(|i| i.source.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    sources.sort_unstable();
    sources.dedup();

    let fingerprint = fingerprint(mode, &sources, profile_id, tier_counts);

    ContextPackage {
        items: selected,
        total_tokens: total_cost.min(u64::from(u32::MAX)) as u32,
        compression_ratio,
        fingerprint,
    }
}

/// Profile admission: preferred kinds (when declared), exclusions, floor
fn admits(profile: &ContextProfile, item: &ContextItem) -> bool {
    if !profile.preferred_kinds.is_empty() && !profile.preferred_kinds.contains(&item.kind) {
        return false;
    }
    if profile.excluded_kinds.contains(&item.kind) {
        return false;
    }
    item.importance >= profile.min_importance
}

/// Primary key importance desc, secondary recency desc, id for stability
fn score_sort(items: &mut [ContextItem]) {
    items.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// sha256(mode || sorted mentioned-sources || profile_id || sorted tier counts)
pub(super) fn fingerprint(
    mode: &str,
    sorted_sources: &[&str],
    profile_id: &str,
    tier_counts: [usize; 3],
) -> ContextFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(mode.as_bytes());
    hasher.update([0u8]);
    for source in sorted_sources {
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(profile_id.as_bytes());
    hasher.update([0u8]);
    let mut counts = tier_counts;
    counts.sort_unstable();
    for count in counts {
        hasher.update(count.to_le_bytes());
    }

    let hash = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();

    ContextFingerprint { hash, tier_counts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TierWeights;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn item(id: &str, kind: &str, importance: f32, cost: u32, minute: u32) -> ContextItem {
        ContextItem::new(id, Tier::Task, kind, json!({"id": id}))
            .with_importance(importance)
            .with_token_cost(cost)
            .with_source(format!("src_{id}"))
            .with_timestamp(Utc.with_ymd_and_hms(2026, 7, 1, 12, minute, 0).unwrap())
    }

    fn profile(budget: u32, head: usize, tail: usize) -> ContextProfile {
        ContextProfile {
            budget,
            tier_weights: TierWeights {
                task: 0.5,
                project: 0.3,
                global: 0.2,
            },
            preferred_kinds: Vec::new(),
            excluded_kinds: Vec::new(),
            min_importance: 0.0,
            head_preserve: head,
            tail_preserve: tail,
            compression: 1.0,
        }
    }

    /// Budget 100, weights .5/.3/.2, five task items of cost 30 with
    /// importance .9..=.5, head_preserve=1: the .9 item is pinned (its 30
    /// comes off the top), share = 35, so .8 fits and .7 does not.
    #[test]
    fn budget_scenario_head_pin_overflows_share() {
        let snapshots = TierSnapshots {
            task: Some(vec![
                item("a", "code", 0.9, 30, 1),
                item("b", "code", 0.8, 30, 2),
                item("c", "code", 0.7, 30, 3),
                item("d", "code", 0.6, 30, 4),
                item("e", "code", 0.5, 30, 5),
            ]),
            project: Some(Vec::new()),
            global: Some(Vec::new()),
        };

        let package = assemble("p", &profile(100, 1, 0), &snapshots, "run");

        let ids: Vec<&str> = package.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(package.total_tokens, 60);
        assert!((package.compression_ratio - 60.0 / 150.0).abs() < 1e-6);
        assert_eq!(package.fingerprint.tier_counts, [2, 0, 0]);
    }

    #[test]
    fn tiers_concatenate_in_order() {
        let snapshots = TierSnapshots {
            task: Some(vec![item("t", "code", 0.5, 10, 1)]),
            project: Some(vec![item("p", "code", 0.9, 10, 1)]),
            global: Some(vec![item("g", "code", 0.7, 10, 1)]),
        };

        let package = assemble("p", &profile(100, 0, 0), &snapshots, "run");
        let ids: Vec<&str> = package.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["t", "p", "g"]);
    }

    #[test]
    fn preferred_and_excluded_kinds_filter() {
        let snapshots = TierSnapshots {
            task: Some(vec![
                item("code1", "code", 0.9, 10, 1),
                item("chat1", "chat", 0.9, 10, 2),
                item("dec1", "decision", 0.9, 10, 3),
            ]),
            project: Some(Vec::new()),
            global: Some(Vec::new()),
        };

        let mut prof = profile(100, 0, 0);
        prof.preferred_kinds = vec!["code".to_string(), "decision".to_string()];
        prof.excluded_kinds = vec!["decision".to_string()];

        let package = assemble("p", &prof, &snapshots, "run");
        let ids: Vec<&str> = package.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["code1"]);
    }

    #[test]
    fn min_importance_floor() {
        let snapshots = TierSnapshots {
            task: Some(vec![
                item("keep", "code", 0.8, 10, 1),
                item("drop", "code", 0.1, 10, 2),
            ]),
            project: Some(Vec::new()),
            global: Some(Vec::new()),
        };

        let mut prof = profile(100, 0, 0);
        prof.min_importance = 0.5;
        let package = assemble("p", &prof, &snapshots, "run");
        assert_eq!(package.items.len(), 1);
        assert_eq!(package.items[0].id, "keep");
    }

    #[test]
    fn tail_preserve_pins_most_recent() {
        // Low-importance but most recent item survives thanks to the tail pin
        let snapshots = TierSnapshots {
            task: Some(vec![
                item("big", "code", 0.9, 40, 1),
                item("mid", "code", 0.8, 40, 2),
                item("fresh", "code", 0.1, 10, 9),
            ]),
            project: Some(Vec::new()),
            global: Some(Vec::new()),
        };

        let package = assemble("p", &profile(50, 0, 1), &snapshots, "run");
        let ids: Vec<&str> = package.items.iter().map(|i| i.id.as_str()).collect();
        // fresh pinned (10 off the top), remaining 40 → task share 20: big (40) overflows
        assert!(ids.contains(&"fresh"));
        assert!(!ids.contains(&"big"));
    }

    #[test]
    fn empty_snapshots_yield_ratio_one() {
        let snapshots = TierSnapshots {
            task: Some(Vec::new()),
            project: Some(Vec::new()),
            global: Some(Vec::new()),
        };
        let package = assemble("p", &profile(100, 0, 0), &snapshots, "run");
        assert!(package.is_empty());
        assert!((package.compression_ratio - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn fingerprint_is_deterministic_and_input_sensitive() {
        let snapshots = TierSnapshots {
            task: Some(vec![item("a", "code", 0.9, 10, 1)]),
            project: Some(Vec::new()),
            global: Some(Vec::new()),
        };
        let prof = profile(100, 0, 0);

        let one = assemble("p", &prof, &snapshots, "run");
        let two = assemble("p", &prof, &snapshots, "run");
        assert_eq!(one.fingerprint, two.fingerprint);

        let other_mode = assemble("p", &prof, &snapshots, "review");
        assert_ne!(one.fingerprint.hash, other_mode.fingerprint.hash);

        let other_profile = assemble("q", &prof, &snapshots, "run");
        assert_ne!(one.fingerprint.hash, other_profile.fingerprint.hash);
    }

    #[test]
    fn pinned_cost_beyond_budget_still_places_pins() {
        let snapshots = TierSnapshots {
            task: Some(vec![
                item("huge", "code", 0.9, 500, 1),
                item("small", "code", 0.8, 10, 2),
            ]),
            project: Some(Vec::new()),
            global: Some(Vec::new()),
        };

        let package = assemble("p", &profile(100, 1, 0), &snapshots, "run");
        let ids: Vec<&str> = package.items.iter().map(|i| i.id.as_str()).collect();
        // The pin lands even though it alone busts the budget; nothing else fits
        assert_eq!(ids, vec!["huge"]);
    }
}
