//! Resolves each player's effective multiplier for a payout.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spoils_of_war_proto::{CollaboratorError, PlayerId};
use tracing::debug;

use crate::store::MultiplierRepository;
use crate::{MultiplierCombineMode, MultiplierPolicy, SpoilsError};

/// Answers whether a player was online at a point in time.
pub trait PresenceOracle: Send + Sync {
    fn is_online(&self, player_id: &str, at_ms: i64) -> Result<bool, CollaboratorError>;
}

/// Presence table held in memory; unknown players use `default_online`.
#[derive(Debug)]
pub struct StaticPresenceOracle {
    default_online: bool,
    players: Mutex<BTreeMap<PlayerId, bool>>,
}

impl StaticPresenceOracle {
    pub fn new(default_online: bool) -> Self {
        Self {
            default_online,
            players: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_online(&self, player_id: &str, online: bool) {
        let mut players = self
            .players
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        players.insert(player_id.to_string(), online);
    }
}

impl PresenceOracle for StaticPresenceOracle {
    fn is_online(&self, player_id: &str, _at_ms: i64) -> Result<bool, CollaboratorError> {
        let players = self.players.lock().map_err(|_| CollaboratorError::Unavailable {
            reason: "presence table lock poisoned".to_string(),
        })?;
        Ok(players.get(player_id).copied().unwrap_or(self.default_online))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMultiplier {
    pub multiplier_id: String,
    pub key: String,
    pub value: Decimal,
    pub is_multiplicative: bool,
    pub from_battle_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PlayerOffline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedMultiplier {
    pub multiplier_id: String,
    pub key: String,
    pub reason: SkipReason,
}

/// How a player's final multiplier was assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierBreakdown {
    pub player_id: PlayerId,
    pub battle_number: u64,
    pub online: Option<bool>,
    pub applied: Vec<AppliedMultiplier>,
    pub skipped: Vec<SkippedMultiplier>,
    pub value: Decimal,
}

#[derive(Clone)]
pub struct MultiplierResolver {
    multipliers: Arc<dyn MultiplierRepository>,
    presence: Arc<dyn PresenceOracle>,
    policy: MultiplierPolicy,
}

impl MultiplierResolver {
    pub fn new(
        multipliers: Arc<dyn MultiplierRepository>,
        presence: Arc<dyn PresenceOracle>,
        policy: MultiplierPolicy,
    ) -> Self {
        Self {
            multipliers,
            presence,
            policy,
        }
    }

    pub fn policy(&self) -> &MultiplierPolicy {
        &self.policy
    }

    pub fn resolve(
        &self,
        player_id: &str,
        battle_number: u64,
        at_ms: i64,
    ) -> Result<Decimal, SpoilsError> {
        Ok(self.resolve_breakdown(player_id, battle_number, at_ms)?.value)
    }

    pub fn resolve_breakdown(
        &self,
        player_id: &str,
        battle_number: u64,
        at_ms: i64,
    ) -> Result<MultiplierBreakdown, SpoilsError> {
        let grants = self.multipliers.active_grants(player_id, battle_number)?;
        let needs_presence = self.policy.require_online_for_payout
            || grants.iter().any(|(_, multiplier)| multiplier.must_be_online);
        let online = if needs_presence {
            Some(self.presence.is_online(player_id, at_ms).map_err(|source| {
                SpoilsError::PresenceUnavailable {
                    player_id: player_id.to_string(),
                    source,
                }
            })?)
        } else {
            None
        };

        let mut breakdown = MultiplierBreakdown {
            player_id: player_id.to_string(),
            battle_number,
            online,
            applied: Vec::new(),
            skipped: Vec::new(),
            value: Decimal::ZERO,
        };
        for (grant, multiplier) in grants {
            if multiplier.must_be_online && online == Some(false) {
                breakdown.skipped.push(SkippedMultiplier {
                    multiplier_id: multiplier.id,
                    key: multiplier.key,
                    reason: SkipReason::PlayerOffline,
                });
                continue;
            }
            breakdown.applied.push(AppliedMultiplier {
                multiplier_id: multiplier.id,
                key: multiplier.key,
                value: multiplier.value,
                is_multiplicative: multiplier.is_multiplicative,
                from_battle_number: grant.from_battle_number,
            });
        }

        breakdown.value = if self.policy.require_online_for_payout && online == Some(false) {
            Decimal::ZERO
        } else {
            combine(self.policy.combine_mode, &breakdown.applied)
        };
        debug!(
            player_id,
            battle_number,
            applied = breakdown.applied.len(),
            skipped = breakdown.skipped.len(),
            value = %breakdown.value,
            "resolved multiplier"
        );
        Ok(breakdown)
    }

    pub fn resolve_many<'a>(
        &self,
        player_ids: impl IntoIterator<Item = &'a str>,
        battle_number: u64,
        at_ms: i64,
    ) -> Result<BTreeMap<PlayerId, Decimal>, SpoilsError> {
        let mut resolved = BTreeMap::new();
        for player_id in player_ids {
            let value = self.resolve(player_id, battle_number, at_ms)?;
            resolved.insert(player_id.to_string(), value);
        }
        Ok(resolved)
    }
}

/// Combines applied grants into one non-negative value. No grants means `1`.
pub fn combine(mode: MultiplierCombineMode, applied: &[AppliedMultiplier]) -> Decimal {
    if applied.is_empty() {
        return Decimal::ONE;
    }
    let additive_sum = applied
        .iter()
        .filter(|entry| !entry.is_multiplicative)
        .fold(Decimal::ZERO, |acc, entry| acc.saturating_add(entry.value));
    let multiplicative: Vec<Decimal> = applied
        .iter()
        .filter(|entry| entry.is_multiplicative)
        .map(|entry| entry.value)
        .collect();

    let value = match mode {
        MultiplierCombineMode::ProductPlusSum => multiplicative
            .iter()
            .fold(Decimal::ONE, |acc, value| acc.saturating_mul(*value))
            .saturating_add(additive_sum),
        MultiplierCombineMode::AdditiveScaled => {
            let scale = multiplicative
                .iter()
                .fold(Decimal::ZERO, |acc, value| acc.saturating_add(*value));
            if scale.is_zero() {
                additive_sum
            } else {
                additive_sum.saturating_mul(scale)
            }
        }
    };
    value.max(Decimal::ZERO)
}
