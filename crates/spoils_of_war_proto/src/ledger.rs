use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{blake3_hex, to_canonical_cbor, BattleId, PlayerId, TransactionId};

const SPOILS_ID_PREFIX: &str = "sow-";
const SPOILS_ID_HASH_LEN: usize = 24;

/// Deterministic ledger id for a battle; creation is idempotent on `battle_id`.
pub fn spoils_id_for_battle(battle_id: &str) -> String {
    let digest = blake3_hex(battle_id.as_bytes());
    format!("{SPOILS_ID_PREFIX}{}", &digest[..SPOILS_ID_HASH_LEN])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Pending,
    Distributing,
    Finalizing,
    Closed,
}

impl LedgerState {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerState::Pending => "pending",
            LedgerState::Distributing => "distributing",
            LedgerState::Finalizing => "finalizing",
            LedgerState::Closed => "closed",
        }
    }

    pub fn accepts_ticks(self) -> bool {
        matches!(self, LedgerState::Pending | LedgerState::Distributing)
    }
}

impl fmt::Display for LedgerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The per-battle prize pool ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoilsOfWar {
    pub id: String,
    pub battle_id: BattleId,
    pub battle_number: u64,
    pub amount: Decimal,
    pub amount_sent: Decimal,
    pub current_tick: u32,
    pub max_ticks: u32,
    #[serde(default)]
    pub leftover_amount: Option<Decimal>,
    #[serde(default)]
    pub leftovers_transaction_id: Option<TransactionId>,
    #[serde(default)]
    pub cancelled_at_ms: Option<i64>,
    #[serde(default)]
    pub closed_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl SpoilsOfWar {
    pub fn new(
        battle_id: &str,
        battle_number: u64,
        amount: Decimal,
        max_ticks: u32,
        now_ms: i64,
    ) -> Self {
        Self {
            id: spoils_id_for_battle(battle_id),
            battle_id: battle_id.to_string(),
            battle_number,
            amount,
            amount_sent: Decimal::ZERO,
            current_tick: 0,
            max_ticks,
            leftover_amount: None,
            leftovers_transaction_id: None,
            cancelled_at_ms: None,
            closed_at_ms: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn state(&self) -> LedgerState {
        if self.closed_at_ms.is_some() {
            LedgerState::Closed
        } else if self.cancelled_at_ms.is_some() || self.current_tick >= self.max_ticks {
            LedgerState::Finalizing
        } else if self.current_tick == 0 {
            LedgerState::Pending
        } else {
            LedgerState::Distributing
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.amount - self.amount_sent
    }

    pub fn ticks_left(&self) -> u32 {
        self.max_ticks.saturating_sub(self.current_tick)
    }

    /// Checks the record-level accounting invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.amount_sent < Decimal::ZERO {
            return Err(format!("amount_sent {} is negative", self.amount_sent));
        }
        if self.amount_sent > self.amount {
            return Err(format!(
                "amount_sent {} exceeds amount {}",
                self.amount_sent, self.amount
            ));
        }
        if self.current_tick > self.max_ticks {
            return Err(format!(
                "current_tick {} exceeds max_ticks {}",
                self.current_tick, self.max_ticks
            ));
        }
        if let Some(leftover) = self.leftover_amount {
            if leftover + self.amount_sent != self.amount {
                return Err(format!(
                    "leftover {} + amount_sent {} != amount {}",
                    leftover, self.amount_sent, self.amount
                ));
            }
        }
        if self.leftovers_transaction_id.is_some() && self.leftover_amount.is_none() {
            return Err("leftovers_transaction_id set without leftover_amount".to_string());
        }
        Ok(())
    }

    /// Checks that `next` is a legal forward successor of `self`.
    pub fn check_transition(&self, next: &SpoilsOfWar) -> Result<(), String> {
        if next.id != self.id || next.battle_id != self.battle_id {
            return Err("ledger identity changed".to_string());
        }
        if next.amount != self.amount || next.max_ticks != self.max_ticks {
            return Err("ledger pool parameters changed".to_string());
        }
        if next.amount_sent < self.amount_sent {
            return Err(format!(
                "amount_sent decreased {} -> {}",
                self.amount_sent, next.amount_sent
            ));
        }
        if next.current_tick < self.current_tick {
            return Err(format!(
                "current_tick decreased {} -> {}",
                self.current_tick, next.current_tick
            ));
        }
        if self.leftover_amount.is_some() && next.leftover_amount != self.leftover_amount {
            return Err("leftover_amount is immutable once computed".to_string());
        }
        if next.state() < self.state() {
            return Err(format!(
                "state moved backwards {} -> {}",
                self.state(),
                next.state()
            ));
        }
        next.check_invariants()
    }
}

/// Read-only projection exposed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub spoils_id: String,
    pub battle_id: BattleId,
    pub battle_number: u64,
    pub state: LedgerState,
    pub amount: Decimal,
    pub amount_sent: Decimal,
    pub remaining: Decimal,
    pub current_tick: u32,
    pub max_ticks: u32,
    pub leftover_amount: Option<Decimal>,
    pub leftovers_transaction_id: Option<TransactionId>,
    pub cancelled: bool,
    pub pending_tick: Option<u32>,
    pub updated_at_ms: i64,
}

impl LedgerStatus {
    pub fn from_record(record: &SpoilsOfWar, pending_tick: Option<u32>) -> Self {
        Self {
            spoils_id: record.id.clone(),
            battle_id: record.battle_id.clone(),
            battle_number: record.battle_number,
            state: record.state(),
            amount: record.amount,
            amount_sent: record.amount_sent,
            remaining: record.remaining(),
            current_tick: record.current_tick,
            max_ticks: record.max_ticks,
            leftover_amount: record.leftover_amount,
            leftovers_transaction_id: record.leftovers_transaction_id.clone(),
            cancelled: record.cancelled_at_ms.is_some(),
            pending_tick,
            updated_at_ms: record.updated_at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedPayout {
    pub player_id: PlayerId,
    pub weight: Decimal,
    pub multiplier: Decimal,
    pub amount: Decimal,
}

/// Deterministic disbursement plan for one tick of one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPlan {
    pub spoils_id: String,
    pub battle_id: BattleId,
    pub tick_index: u32,
    pub budget: Decimal,
    pub payouts: Vec<PlannedPayout>,
    pub total: Decimal,
    pub residue: Decimal,
    pub planned_at_ms: i64,
}

impl TickPlan {
    pub fn is_empty(&self) -> bool {
        self.payouts.iter().all(|payout| payout.amount.is_zero())
    }

    /// Digest over the plan content, excluding the planning timestamp.
    pub fn digest(&self) -> Result<String, String> {
        #[derive(Serialize)]
        struct DigestPayload<'a> {
            spoils_id: &'a str,
            battle_id: &'a str,
            tick_index: u32,
            budget: String,
            payouts: Vec<(&'a str, String)>,
        }
        let payload = DigestPayload {
            spoils_id: self.spoils_id.as_str(),
            battle_id: self.battle_id.as_str(),
            tick_index: self.tick_index,
            budget: self.budget.normalize().to_string(),
            payouts: self
                .payouts
                .iter()
                .map(|payout| (payout.player_id.as_str(), payout.amount.normalize().to_string()))
                .collect(),
        };
        Ok(blake3_hex(&to_canonical_cbor(&payload)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisbursementKind {
    Tick,
    Leftover,
}

/// Append-only audit row, one per executed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisbursementRecord {
    pub spoils_id: String,
    pub battle_id: BattleId,
    pub kind: DisbursementKind,
    pub tick_index: Option<u32>,
    pub to_account: String,
    pub amount: Decimal,
    pub transaction_id: TransactionId,
    pub idempotency_key: String,
    pub reference: String,
    #[serde(default)]
    pub plan_digest: Option<String>,
    pub issued_at_ms: i64,
}
