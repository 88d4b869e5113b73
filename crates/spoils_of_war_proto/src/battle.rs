use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BattleId, PlayerId};

/// A battle as seen by the distribution engine. Aggregation is only valid
/// once `ended_at_ms` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleRecord {
    pub battle_id: BattleId,
    pub battle_number: u64,
    pub started_at_ms: i64,
    #[serde(default)]
    pub ended_at_ms: Option<i64>,
}

impl BattleRecord {
    pub fn has_ended(&self) -> bool {
        self.ended_at_ms.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionKind {
    Damage,
    Kill,
    Vote,
    AbilitySpend,
}

impl ContributionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContributionKind::Damage => "damage",
            ContributionKind::Kill => "kill",
            ContributionKind::Vote => "vote",
            ContributionKind::AbilitySpend => "ability_spend",
        }
    }
}

/// One raw in-battle event reported by the battle collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionEvent {
    pub battle_id: BattleId,
    pub player_id: PlayerId,
    pub kind: ContributionKind,
    pub amount: Decimal,
    pub recorded_at_ms: i64,
}

/// Per-player roll-up of contribution events, keyed by `(battle_id, player_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleContribution {
    pub battle_id: BattleId,
    pub player_id: PlayerId,
    #[serde(default)]
    pub damage_dealt: Decimal,
    #[serde(default)]
    pub kills: Decimal,
    #[serde(default)]
    pub vote_weight: Decimal,
    #[serde(default)]
    pub ability_spend: Decimal,
    pub updated_at_ms: i64,
}

impl BattleContribution {
    pub fn empty(battle_id: &str, player_id: &str, now_ms: i64) -> Self {
        Self {
            battle_id: battle_id.to_string(),
            player_id: player_id.to_string(),
            damage_dealt: Decimal::ZERO,
            kills: Decimal::ZERO,
            vote_weight: Decimal::ZERO,
            ability_spend: Decimal::ZERO,
            updated_at_ms: now_ms,
        }
    }

    pub fn metric(&self, kind: ContributionKind) -> Decimal {
        match kind {
            ContributionKind::Damage => self.damage_dealt,
            ContributionKind::Kill => self.kills,
            ContributionKind::Vote => self.vote_weight,
            ContributionKind::AbilitySpend => self.ability_spend,
        }
    }

    /// Folds one event into the row. Events for another battle or player are ignored.
    pub fn apply_event(&mut self, event: &ContributionEvent) -> bool {
        if event.battle_id != self.battle_id || event.player_id != self.player_id {
            return false;
        }
        let slot = match event.kind {
            ContributionKind::Damage => &mut self.damage_dealt,
            ContributionKind::Kill => &mut self.kills,
            ContributionKind::Vote => &mut self.vote_weight,
            ContributionKind::AbilitySpend => &mut self.ability_spend,
        };
        *slot = slot.saturating_add(event.amount);
        self.updated_at_ms = self.updated_at_ms.max(event.recorded_at_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ContributionKind, amount: i64) -> ContributionEvent {
        ContributionEvent {
            battle_id: "battle-1".to_string(),
            player_id: "player-a".to_string(),
            kind,
            amount: Decimal::new(amount, 0),
            recorded_at_ms: 42,
        }
    }

    #[test]
    fn apply_event_accumulates_per_kind() {
        let mut row = BattleContribution::empty("battle-1", "player-a", 0);
        assert!(row.apply_event(&event(ContributionKind::Damage, 10)));
        assert!(row.apply_event(&event(ContributionKind::Damage, 5)));
        assert!(row.apply_event(&event(ContributionKind::Kill, 1)));
        assert_eq!(row.metric(ContributionKind::Damage), Decimal::new(15, 0));
        assert_eq!(row.metric(ContributionKind::Kill), Decimal::ONE);
        assert_eq!(row.metric(ContributionKind::Vote), Decimal::ZERO);
        assert_eq!(row.updated_at_ms, 42);
    }

    #[test]
    fn apply_event_rejects_foreign_player() {
        let mut row = BattleContribution::empty("battle-1", "player-b", 0);
        assert!(!row.apply_event(&event(ContributionKind::Damage, 10)));
        assert_eq!(row.damage_dealt, Decimal::ZERO);
    }
}
