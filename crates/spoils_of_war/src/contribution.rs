//! Turns per-battle contribution rows into normalized per-player weights.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use spoils_of_war_proto::{
    BattleContribution, BattleRecord, ContributionEvent, ContributionKind, PlayerId,
};
use tracing::warn;

use crate::store::BattleRepository;
use crate::util::{truncate_at, unit_at};
use crate::{ContributionPolicy, SpoilsError};

/// Fractional digits kept for normalized weights.
pub const WEIGHT_SCALE: u32 = 18;

const CONTRIBUTION_KINDS: [ContributionKind; 4] = [
    ContributionKind::Damage,
    ContributionKind::Kill,
    ContributionKind::Vote,
    ContributionKind::AbilitySpend,
];

struct RemainderEntry {
    player_id: PlayerId,
    fractional: Decimal,
}

#[derive(Clone)]
pub struct ContributionAggregator {
    battles: Arc<dyn BattleRepository>,
    policy: ContributionPolicy,
}

impl ContributionAggregator {
    pub fn new(
        battles: Arc<dyn BattleRepository>,
        policy: ContributionPolicy,
    ) -> Result<Self, SpoilsError> {
        policy.validate()?;
        Ok(Self { battles, policy })
    }

    pub fn policy(&self) -> &ContributionPolicy {
        &self.policy
    }

    pub fn record_event(&self, event: &ContributionEvent) -> Result<BattleContribution, SpoilsError> {
        self.battles.record_contribution(event)
    }

    /// Raw score of one row; negative metrics count as zero.
    pub fn score(&self, row: &BattleContribution) -> Decimal {
        CONTRIBUTION_KINDS
            .iter()
            .fold(Decimal::ZERO, |score, kind| {
                let mut metric = row.metric(*kind);
                if metric < Decimal::ZERO {
                    warn!(
                        battle_id = %row.battle_id,
                        player_id = %row.player_id,
                        kind = kind.as_str(),
                        metric = %metric,
                        "negative contribution metric clamped to zero"
                    );
                    metric = Decimal::ZERO;
                }
                score.saturating_add(metric.saturating_mul(self.policy.coefficient(*kind)))
            })
    }

    /// Loads a battle and requires it to have ended.
    pub fn ended_battle(&self, battle_id: &str) -> Result<BattleRecord, SpoilsError> {
        let battle = self
            .battles
            .battle(battle_id)?
            .ok_or_else(|| SpoilsError::BattleNotFound {
                battle_id: battle_id.to_string(),
            })?;
        if !battle.has_ended() {
            return Err(SpoilsError::BattleNotEnded {
                battle_id: battle_id.to_string(),
            });
        }
        Ok(battle)
    }

    /// Normalized weights for an ended battle. Weights sum to exactly one, or
    /// the map is empty when nobody qualifies.
    pub fn aggregate(&self, battle_id: &str) -> Result<BTreeMap<PlayerId, Decimal>, SpoilsError> {
        self.ended_battle(battle_id)?;

        let mut scores = BTreeMap::new();
        for row in self.battles.contributions(battle_id)? {
            if self.policy.excluded_player_ids.contains(&row.player_id) {
                continue;
            }
            let score = self.score(&row);
            if score <= Decimal::ZERO || score < self.policy.min_player_score {
                continue;
            }
            scores.insert(row.player_id.clone(), score);
        }
        Ok(normalize_scores(&scores))
    }
}

/// Largest-remainder normalization at [`WEIGHT_SCALE`]; ties go to the
/// lexicographically smaller player id.
pub fn normalize_scores(scores: &BTreeMap<PlayerId, Decimal>) -> BTreeMap<PlayerId, Decimal> {
    let total = scores
        .values()
        .filter(|score| **score > Decimal::ZERO)
        .fold(Decimal::ZERO, |acc, score| acc.saturating_add(*score));
    if total <= Decimal::ZERO {
        return BTreeMap::new();
    }

    let mut weights = BTreeMap::new();
    let mut remainders = Vec::with_capacity(scores.len());
    let mut distributed = Decimal::ZERO;
    for (player_id, score) in scores {
        if *score <= Decimal::ZERO {
            continue;
        }
        let exact = *score / total;
        let floor = truncate_at(exact, WEIGHT_SCALE);
        distributed += floor;
        weights.insert(player_id.clone(), floor);
        remainders.push(RemainderEntry {
            player_id: player_id.clone(),
            fractional: exact - floor,
        });
    }

    remainders.sort_by(|left, right| {
        right
            .fractional
            .cmp(&left.fractional)
            .then_with(|| left.player_id.cmp(&right.player_id))
    });

    let unit = unit_at(WEIGHT_SCALE);
    let mut remaining = Decimal::ONE - distributed;
    for entry in remainders.iter().cycle().take(remainders.len() * 2) {
        if remaining < unit {
            break;
        }
        if let Some(weight) = weights.get_mut(&entry.player_id) {
            *weight += unit;
            remaining -= unit;
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySpoilsStore;

    fn battle(ended_at_ms: Option<i64>) -> BattleRecord {
        BattleRecord {
            battle_id: "battle-1".to_string(),
            battle_number: 1,
            started_at_ms: 0,
            ended_at_ms,
        }
    }

    fn store_with_battle() -> Arc<InMemorySpoilsStore> {
        let store = Arc::new(InMemorySpoilsStore::new());
        store.upsert_battle(&battle(None)).expect("battle");
        store
    }

    fn end_battle(store: &InMemorySpoilsStore) {
        store.upsert_battle(&battle(Some(100))).expect("end battle");
    }

    fn record(store: &InMemorySpoilsStore, player: &str, kind: ContributionKind, amount: i64) {
        store
            .record_contribution(&ContributionEvent {
                battle_id: "battle-1".to_string(),
                player_id: player.to_string(),
                kind,
                amount: Decimal::new(amount, 0),
                recorded_at_ms: 50,
            })
            .expect("record");
    }

    fn aggregator(store: Arc<InMemorySpoilsStore>, policy: ContributionPolicy) -> ContributionAggregator {
        ContributionAggregator::new(store, policy).expect("aggregator")
    }

    #[test]
    fn weights_follow_scores() {
        let store = store_with_battle();
        record(&store, "player-a", ContributionKind::Damage, 60);
        record(&store, "player-b", ContributionKind::Damage, 40);
        end_battle(&store);
        let weights = aggregator(store, ContributionPolicy::default())
            .aggregate("battle-1")
            .expect("aggregate");
        assert_eq!(weights["player-a"], Decimal::new(6, 1));
        assert_eq!(weights["player-b"], Decimal::new(4, 1));
    }

    #[test]
    fn thirds_sum_to_exactly_one() {
        let store = store_with_battle();
        for player in ["player-a", "player-b", "player-c"] {
            record(&store, player, ContributionKind::Kill, 1);
        }
        end_battle(&store);
        let weights = aggregator(store, ContributionPolicy::default())
            .aggregate("battle-1")
            .expect("aggregate");
        let sum: Decimal = weights.values().copied().sum();
        assert_eq!(sum, Decimal::ONE);
        assert!(weights["player-a"] > weights["player-b"]);
        assert_eq!(weights["player-b"], weights["player-c"]);
    }

    #[test]
    fn largest_fraction_takes_the_spare_unit() {
        let scores: BTreeMap<PlayerId, Decimal> = [
            ("player-a".to_string(), Decimal::ONE),
            ("player-b".to_string(), Decimal::new(2, 0)),
        ]
        .into_iter()
        .collect();
        let weights = normalize_scores(&scores);
        assert_eq!(weights["player-a"], Decimal::new(333_333_333_333_333_333, 18));
        assert_eq!(weights["player-b"], Decimal::new(666_666_666_666_666_667, 18));
        assert_eq!(weights.values().copied().sum::<Decimal>(), Decimal::ONE);
    }

    #[test]
    fn empty_battle_yields_no_weights() {
        let store = store_with_battle();
        end_battle(&store);
        let weights = aggregator(store, ContributionPolicy::default())
            .aggregate("battle-1")
            .expect("aggregate");
        assert!(weights.is_empty());
    }

    #[test]
    fn unfinished_or_unknown_battles_are_rejected() {
        let store = store_with_battle();
        let aggregator = aggregator(store, ContributionPolicy::default());
        assert!(matches!(
            aggregator.aggregate("battle-1"),
            Err(SpoilsError::BattleNotEnded { .. })
        ));
        assert!(matches!(
            aggregator.aggregate("battle-9"),
            Err(SpoilsError::BattleNotFound { .. })
        ));
    }

    #[test]
    fn policy_filters_and_weighs_kinds() {
        let store = store_with_battle();
        record(&store, "player-a", ContributionKind::Kill, 1);
        record(&store, "player-b", ContributionKind::Damage, 1);
        record(&store, "treasury", ContributionKind::AbilitySpend, 100);
        record(&store, "player-c", ContributionKind::Vote, 2);
        let policy = ContributionPolicy {
            kill_coefficient: Decimal::new(3, 0),
            min_player_score: Decimal::new(3, 0),
            excluded_player_ids: ["treasury".to_string()].into_iter().collect(),
            ..ContributionPolicy::default()
        };
        end_battle(&store);
        let weights = aggregator(store, policy).aggregate("battle-1").expect("aggregate");
        assert_eq!(weights.len(), 1);
        assert_eq!(weights["player-a"], Decimal::ONE);
    }

    #[test]
    fn negative_metrics_do_not_reduce_score() {
        let store = store_with_battle();
        record(&store, "player-a", ContributionKind::Damage, 10);
        record(&store, "player-a", ContributionKind::Vote, -5);
        end_battle(&store);
        let aggregator = aggregator(store.clone(), ContributionPolicy::default());
        let rows = store.contributions("battle-1").expect("rows");
        assert_eq!(aggregator.score(&rows[0]), Decimal::new(10, 0));
    }
}
