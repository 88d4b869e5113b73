use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::PlayerId;

/// Multiplier definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Multiplier {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub description: String,
    pub value: Decimal,
    pub is_multiplicative: bool,
    #[serde(default)]
    pub must_be_online: bool,
    pub for_games: u64,
}

/// A grant of a multiplier to one player, effective from `from_battle_number`
/// for the definition's `for_games` battles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMultiplier {
    pub player_id: PlayerId,
    pub multiplier_id: String,
    pub from_battle_number: u64,
    pub granted_at_ms: i64,
}

impl UserMultiplier {
    pub fn key(&self) -> (String, String, u64) {
        (
            self.player_id.clone(),
            self.multiplier_id.clone(),
            self.from_battle_number,
        )
    }

    pub fn until_battle_number(&self, multiplier: &Multiplier) -> u64 {
        self.from_battle_number.saturating_add(multiplier.for_games)
    }

    pub fn is_active_for(&self, multiplier: &Multiplier, battle_number: u64) -> bool {
        self.from_battle_number <= battle_number
            && battle_number < self.until_battle_number(multiplier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(for_games: u64) -> Multiplier {
        Multiplier {
            id: "m-citizen".to_string(),
            key: "citizen".to_string(),
            description: String::new(),
            value: Decimal::ONE,
            is_multiplicative: false,
            must_be_online: false,
            for_games,
        }
    }

    fn grant(from: u64) -> UserMultiplier {
        UserMultiplier {
            player_id: "player-a".to_string(),
            multiplier_id: "m-citizen".to_string(),
            from_battle_number: from,
            granted_at_ms: 0,
        }
    }

    #[test]
    fn grant_window_is_half_open() {
        let multiplier = definition(3);
        let grant = grant(10);
        assert!(!grant.is_active_for(&multiplier, 9));
        assert!(grant.is_active_for(&multiplier, 10));
        assert!(grant.is_active_for(&multiplier, 12));
        assert!(!grant.is_active_for(&multiplier, 13));
    }

    #[test]
    fn zero_game_window_is_never_active() {
        assert!(!grant(10).is_active_for(&definition(0), 10));
    }
}
