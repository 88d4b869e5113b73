use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spoils_of_war_proto::ContributionKind;

use crate::SpoilsError;

pub const DEFAULT_AMOUNT_SCALE: u32 = 18;
pub const MAX_AMOUNT_SCALE: u32 = 24;
pub const DEFAULT_MAX_TICKS_LIMIT: u32 = 10_000;
pub const DEFAULT_LEASE_TTL_MS: i64 = 30_000;
pub const DEFAULT_TRANSFER_GROUP: &str = "spoil of war";

/// Accounts and accounting precision used by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub pool_account_id: String,
    pub holding_account_id: String,
    pub amount_scale: u32,
    pub max_ticks_limit: u32,
    pub lease_ttl_ms: i64,
    pub lease_holder_id: String,
    pub transfer_group: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            pool_account_id: "spoils-pool".to_string(),
            holding_account_id: "spoils-holding".to_string(),
            amount_scale: DEFAULT_AMOUNT_SCALE,
            max_ticks_limit: DEFAULT_MAX_TICKS_LIMIT,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            lease_holder_id: "spoils-ledger".to_string(),
            transfer_group: DEFAULT_TRANSFER_GROUP.to_string(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), SpoilsError> {
        if self.pool_account_id.trim().is_empty() {
            return Err(invalid("pool_account_id cannot be empty"));
        }
        if self.holding_account_id.trim().is_empty() {
            return Err(invalid("holding_account_id cannot be empty"));
        }
        if self.pool_account_id == self.holding_account_id {
            return Err(invalid("pool and holding accounts must differ"));
        }
        if self.amount_scale > MAX_AMOUNT_SCALE {
            return Err(SpoilsError::Validation {
                reason: format!(
                    "amount_scale {} exceeds maximum {MAX_AMOUNT_SCALE}",
                    self.amount_scale
                ),
            });
        }
        if self.max_ticks_limit == 0 {
            return Err(invalid("max_ticks_limit must be positive"));
        }
        if self.lease_ttl_ms <= 0 {
            return Err(invalid("lease_ttl_ms must be positive"));
        }
        if self.lease_holder_id.trim().is_empty() {
            return Err(invalid("lease_holder_id cannot be empty"));
        }
        Ok(())
    }

    pub fn with_accounts(
        mut self,
        pool_account_id: impl Into<String>,
        holding_account_id: impl Into<String>,
    ) -> Self {
        self.pool_account_id = pool_account_id.into();
        self.holding_account_id = holding_account_id.into();
        self
    }

    pub fn with_amount_scale(mut self, amount_scale: u32) -> Self {
        self.amount_scale = amount_scale;
        self
    }

    pub fn with_lease_ttl_ms(mut self, lease_ttl_ms: i64) -> Self {
        self.lease_ttl_ms = lease_ttl_ms;
        self
    }
}

/// How raw contribution metrics turn into one score per player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContributionPolicy {
    pub damage_coefficient: Decimal,
    pub kill_coefficient: Decimal,
    pub vote_coefficient: Decimal,
    pub ability_spend_coefficient: Decimal,
    pub min_player_score: Decimal,
    pub excluded_player_ids: BTreeSet<String>,
}

impl Default for ContributionPolicy {
    fn default() -> Self {
        Self {
            damage_coefficient: Decimal::ONE,
            kill_coefficient: Decimal::ONE,
            vote_coefficient: Decimal::ONE,
            ability_spend_coefficient: Decimal::ONE,
            min_player_score: Decimal::ZERO,
            excluded_player_ids: BTreeSet::new(),
        }
    }
}

impl ContributionPolicy {
    pub fn coefficient(&self, kind: ContributionKind) -> Decimal {
        match kind {
            ContributionKind::Damage => self.damage_coefficient,
            ContributionKind::Kill => self.kill_coefficient,
            ContributionKind::Vote => self.vote_coefficient,
            ContributionKind::AbilitySpend => self.ability_spend_coefficient,
        }
    }

    pub fn validate(&self) -> Result<(), SpoilsError> {
        for kind in [
            ContributionKind::Damage,
            ContributionKind::Kill,
            ContributionKind::Vote,
            ContributionKind::AbilitySpend,
        ] {
            if self.coefficient(kind) < Decimal::ZERO {
                return Err(SpoilsError::Validation {
                    reason: format!("{} coefficient cannot be negative", kind.as_str()),
                });
            }
        }
        if self.min_player_score < Decimal::ZERO {
            return Err(invalid("min_player_score cannot be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplierCombineMode {
    /// `Π multiplicative + Σ additive`, empty product is 1.
    #[default]
    ProductPlusSum,
    /// `Σ additive × (Σ multiplicative or 1)`.
    AdditiveScaled,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplierPolicy {
    pub combine_mode: MultiplierCombineMode,
    pub require_online_for_payout: bool,
}

fn invalid(reason: &str) -> SpoilsError {
    SpoilsError::Validation {
        reason: reason.to_string(),
    }
}
