use pik_contracts::{CacheType, Difficulty, Rarity};

/// Operator-tunable progression parameters, read from the config store on
/// every ingest so updates take effect on the next request.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunables {
    pub xp_per_session_normal: i64,
    pub xp_per_session_hard: i64,
    pub xp_boss_tier_pct: f64,
    pub xp_node_completion: f64,
    pub event_xp_multiplier: f64,
    pub xp_base_threshold: i64,
    pub xp_level_multiplier: f64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            xp_per_session_normal: 100,
            xp_per_session_hard: 150,
            xp_boss_tier_pct: 0.5,
            xp_node_completion: 15.0,
            event_xp_multiplier: 1.0,
            xp_base_threshold: 200,
            xp_level_multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBreakdown {
    pub session_xp: i64,
    pub boss_bonus_xp: i64,
    pub node_xp: i64,
    pub total_xp: i64,
}

pub fn session_breakdown(
    t: &Tunables,
    difficulty: Difficulty,
    nodes_completed: u32,
    boss_damage_pct: f64,
) -> SessionBreakdown {
    let session_xp = match difficulty {
        Difficulty::Normal => t.xp_per_session_normal,
        Difficulty::Hard => t.xp_per_session_hard,
    };
    let boss_bonus_xp =
        ((boss_damage_pct / 100.0) * t.xp_boss_tier_pct * session_xp as f64).floor() as i64;
    let node_xp = (nodes_completed as f64 * t.xp_node_completion).floor() as i64;
    let total_xp = ((session_xp + boss_bonus_xp + node_xp) as f64 * t.event_xp_multiplier).floor()
        as i64;

    SessionBreakdown {
        session_xp,
        boss_bonus_xp,
        node_xp,
        total_xp,
    }
}

pub fn scaled_xp(t: &Tunables, xp: f64) -> i64 {
    (xp * t.event_xp_multiplier).floor() as i64
}

pub fn node_completion_xp(t: &Tunables) -> i64 {
    (t.xp_node_completion * t.event_xp_multiplier).floor() as i64
}

/// XP the step from `level` to `level + 1` costs on its own.
pub fn level_threshold(t: &Tunables, level: i64) -> i64 {
    (t.xp_base_threshold as f64 * t.xp_level_multiplier.powi((level - 1) as i32)).floor() as i64
}

/// Total XP required to advance past `level`: the per-level costs summed
/// from level 1. `fate_xp` is a monotone lifetime total, so cascades compare
/// against this running sum.
pub fn cumulative_threshold(t: &Tunables, level: i64) -> i64 {
    (1..=level).map(|k| level_threshold(t, k)).sum()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub xp: i64,
    pub level: i64,
    /// Every level reached during this application, in ascending order.
    pub levels_gained: Vec<i64>,
}

impl CascadeOutcome {
    pub fn leveled_up(&self) -> bool {
        !self.levels_gained.is_empty()
    }
}

/// Applies an XP delta and cascades the level upward while the lifetime
/// total clears each successive cumulative threshold. Multi-level cascades
/// from a single delta resolve in one call.
pub fn apply_xp(t: &Tunables, current_xp: i64, current_level: i64, delta: i64) -> CascadeOutcome {
    let xp = current_xp + delta.max(0);
    let mut level = current_level.max(1);
    let mut needed = cumulative_threshold(t, level);
    let mut levels_gained = Vec::new();

    while xp >= needed {
        level += 1;
        levels_gained.push(level);
        needed += level_threshold(t, level);
    }

    CascadeOutcome {
        xp,
        level,
        levels_gained,
    }
}

pub const LEVEL_TITLES: &[(i64, &str)] = &[
    (2, "title_fate_awakened"),
    (5, "title_fate_burning"),
    (10, "title_fate_ascendant"),
];

pub fn level_title(level: i64) -> Option<&'static str> {
    LEVEL_TITLES
        .iter()
        .find(|(l, _)| *l == level)
        .map(|(_, t)| *t)
}

/// Boss title tiers, highest first; the first threshold at or below the dealt
/// damage wins.
pub const BOSS_TITLE_TIERS: &[(f64, &str)] = &[
    (100.0, "title_veilbreaker_100"),
    (75.0, "title_veilbreaker_75"),
    (50.0, "title_veilbreaker_50"),
];

pub fn boss_title(boss_damage_pct: f64) -> Option<&'static str> {
    BOSS_TITLE_TIERS
        .iter()
        .find(|(threshold, _)| boss_damage_pct >= *threshold)
        .map(|(_, title)| *title)
}

/// Rarity policy for cache grants. `roll` is uniform in `[0, 100)`;
/// `boss_damage_pct` is only meaningful for boss-kill caches.
pub fn roll_rarity(
    level: i64,
    cache_type: CacheType,
    boss_damage_pct: Option<f64>,
    roll: f64,
) -> Rarity {
    let boss = boss_damage_pct.unwrap_or(0.0);
    let full_boss_kill = cache_type == CacheType::BossKill && boss >= 100.0;

    if level >= 10 && full_boss_kill && roll < 5.0 {
        Rarity::Legendary
    } else if level >= 7 && boss >= 75.0 && roll < 12.0 {
        Rarity::Epic
    } else if level >= 4 && roll < 20.0 {
        Rarity::Rare
    } else if level >= 2 && roll < 45.0 {
        Rarity::Uncommon
    } else {
        Rarity::Common
    }
}

/// Walks `weights` accumulating until the running sum exceeds `roll`,
/// returning that index. `roll` must be in `[0, total)`; returns `None` for an
/// empty pool or an out-of-range roll.
pub fn weighted_index(weights: &[i64], roll: i64) -> Option<usize> {
    if roll < 0 {
        return None;
    }
    let mut acc = 0i64;
    for (idx, weight) in weights.iter().enumerate() {
        acc += (*weight).max(0);
        if roll < acc {
            return Some(idx);
        }
    }
    None
}

pub fn total_weight(weights: &[i64]) -> i64 {
    weights.iter().map(|w| (*w).max(0)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn default_session_formula_matches_reference_values() {
        let t = Tunables::default();
        let breakdown = session_breakdown(&t, Difficulty::Hard, 6, 72.0);
        assert_eq!(breakdown.session_xp, 150);
        assert_eq!(breakdown.boss_bonus_xp, 54);
        assert_eq!(breakdown.node_xp, 90);
        assert_eq!(breakdown.total_xp, 294);
    }

    #[test]
    fn normal_session_without_nodes_or_boss_is_base_xp_only() {
        let t = Tunables::default();
        let breakdown = session_breakdown(&t, Difficulty::Normal, 0, 0.0);
        assert_eq!(breakdown.session_xp, 100);
        assert_eq!(breakdown.boss_bonus_xp, 0);
        assert_eq!(breakdown.node_xp, 0);
        assert_eq!(breakdown.total_xp, 100);
    }

    #[test]
    fn event_multiplier_scales_and_floors_the_total() {
        let t = Tunables {
            event_xp_multiplier: 1.5,
            ..Tunables::default()
        };
        let breakdown = session_breakdown(&t, Difficulty::Normal, 1, 0.0);
        // (100 + 0 + 15) * 1.5 = 172.5, floored
        assert_eq!(breakdown.total_xp, 172);
    }

    #[test]
    fn single_level_up_at_default_thresholds() {
        let t = Tunables::default();
        let outcome = apply_xp(&t, 195, 1, 100);
        assert_eq!(outcome.xp, 295);
        assert_eq!(outcome.level, 2);
        assert_eq!(outcome.levels_gained, vec![2]);
    }

    #[test]
    fn below_threshold_keeps_the_level() {
        let t = Tunables::default();
        let outcome = apply_xp(&t, 0, 1, 199);
        assert_eq!(outcome.level, 1);
        assert!(!outcome.leveled_up());
    }

    #[test]
    fn multi_level_cascade_resolves_in_one_application() {
        let t = Tunables::default();
        // Steps cost 200, 300, 450; a single 500 XP delta clears two levels.
        let outcome = apply_xp(&t, 0, 1, 500);
        assert_eq!(outcome.level, 3);
        assert_eq!(outcome.levels_gained, vec![2, 3]);
    }

    #[test]
    fn cascade_matches_closed_form_across_configs() {
        for (base, mult) in [(50i64, 1.0f64), (100, 1.25), (200, 1.5), (300, 2.0)] {
            let t = Tunables {
                xp_base_threshold: base,
                xp_level_multiplier: mult,
                ..Tunables::default()
            };
            for delta in [0i64, 1, 49, 120, 450, 999, 5_000, 50_000] {
                let outcome = apply_xp(&t, 0, 1, delta);

                // Largest L whose cumulative cost through L-1 fits in the total.
                let mut expected = 1i64;
                while outcome.xp >= cumulative_threshold(&t, expected) {
                    expected += 1;
                }
                assert_eq!(
                    outcome.level, expected,
                    "base={} mult={} delta={}",
                    base, mult, delta
                );
                assert_eq!(
                    outcome.levels_gained,
                    (2..=expected).collect::<Vec<_>>(),
                    "base={} mult={} delta={}",
                    base, mult, delta
                );
            }
        }
    }

    #[test]
    fn flat_multiplier_still_terminates_and_levels_linearly() {
        let t = Tunables {
            xp_base_threshold: 50,
            xp_level_multiplier: 1.0,
            ..Tunables::default()
        };
        let outcome = apply_xp(&t, 0, 1, 500);
        // Every step costs 50, so 500 XP clears exactly ten of them.
        assert_eq!(outcome.level, 11);
    }

    #[test]
    fn level_titles_cover_the_milestone_levels() {
        assert_eq!(level_title(2), Some("title_fate_awakened"));
        assert_eq!(level_title(5), Some("title_fate_burning"));
        assert_eq!(level_title(10), Some("title_fate_ascendant"));
        assert_eq!(level_title(3), None);
    }

    #[test]
    fn boss_title_picks_highest_matching_tier() {
        assert_eq!(boss_title(100.0), Some("title_veilbreaker_100"));
        assert_eq!(boss_title(82.5), Some("title_veilbreaker_75"));
        assert_eq!(boss_title(50.0), Some("title_veilbreaker_50"));
        assert_eq!(boss_title(49.9), None);
    }

    #[test]
    fn rarity_policy_tiers() {
        // Legendary requires level 10, a full boss kill and roll < 5.
        assert_eq!(
            roll_rarity(10, CacheType::BossKill, Some(100.0), 4.9),
            Rarity::Legendary
        );
        assert_eq!(
            roll_rarity(10, CacheType::BossKill, Some(99.0), 4.9),
            Rarity::Epic
        );
        assert_eq!(
            roll_rarity(9, CacheType::BossKill, Some(100.0), 4.9),
            Rarity::Epic
        );
        assert_eq!(
            roll_rarity(7, CacheType::BossKill, Some(75.0), 11.0),
            Rarity::Epic
        );
        assert_eq!(roll_rarity(4, CacheType::LevelUp, None, 19.0), Rarity::Rare);
        assert_eq!(
            roll_rarity(2, CacheType::LevelUp, None, 44.0),
            Rarity::Uncommon
        );
        assert_eq!(roll_rarity(1, CacheType::LevelUp, None, 0.0), Rarity::Common);
        assert_eq!(
            roll_rarity(4, CacheType::LevelUp, None, 20.0),
            Rarity::Uncommon
        );
    }

    #[test]
    fn weighted_index_walks_cumulative_weights() {
        let weights = [10i64, 20, 70];
        assert_eq!(weighted_index(&weights, 0), Some(0));
        assert_eq!(weighted_index(&weights, 9), Some(0));
        assert_eq!(weighted_index(&weights, 10), Some(1));
        assert_eq!(weighted_index(&weights, 29), Some(1));
        assert_eq!(weighted_index(&weights, 30), Some(2));
        assert_eq!(weighted_index(&weights, 99), Some(2));
        assert_eq!(weighted_index(&weights, 100), None);
        assert_eq!(weighted_index(&[], 0), None);
    }

    #[test]
    fn weighted_pick_is_fair_over_a_million_draws() {
        let weights = [10i64, 20, 70];
        let total = total_weight(&weights);
        let mut counts = [0u64; 3];
        let mut rng = rand::thread_rng();

        const DRAWS: u64 = 1_000_000;
        for _ in 0..DRAWS {
            let roll = rng.gen_range(0..total);
            let idx = weighted_index(&weights, roll).expect("roll in range");
            counts[idx] += 1;
        }

        for (idx, weight) in weights.iter().enumerate() {
            let expected = *weight as f64 / total as f64;
            let observed = counts[idx] as f64 / DRAWS as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "entry {} observed {:.4}, expected {:.4}",
                idx,
                observed,
                expected
            );
        }
    }
}
