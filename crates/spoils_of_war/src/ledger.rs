//! The spoils-of-war ledger: owns the lifecycle of every per-battle pool and
//! is the only writer of ledger state.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spoils_of_war_proto::{
    leftover_idempotency_key, tick_idempotency_key, DisbursementKind, DisbursementRecord,
    LedgerState, LedgerStatus, PlannedPayout, SpoilsOfWar, TickPlan, TransactionId,
    TransferRequest,
};
use tracing::{error, info, warn};

use crate::contribution::ContributionAggregator;
use crate::issuer::TransactionIssuer;
use crate::lease::{LedgerLeaseGuard, LedgerLeases};
use crate::multiplier::MultiplierResolver;
use crate::planner::PayoutPlanner;
use crate::store::LedgerRepository;
use crate::util::effective_scale;
use crate::{LedgerConfig, SpoilsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLedgerOutcome {
    pub record: SpoilsOfWar,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub battle_id: String,
    pub tick_index: u32,
    pub plan_digest: String,
    pub budget: Decimal,
    pub total: Decimal,
    pub residue: Decimal,
    pub transfers: usize,
    pub resumed: bool,
    pub record: SpoilsOfWar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub record: SpoilsOfWar,
    pub leftover_amount: Decimal,
    pub transaction_id: Option<TransactionId>,
    pub already_closed: bool,
}

/// Totals across ledgers that still hold undistributed funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoilsPoolSummary {
    pub open_ledgers: usize,
    pub latest_battle_number: Option<u64>,
    pub latest_remaining: Decimal,
    pub earlier_remaining: Decimal,
}

pub struct DistributionLedger {
    config: LedgerConfig,
    ledgers: Arc<dyn LedgerRepository>,
    aggregator: ContributionAggregator,
    resolver: MultiplierResolver,
    planner: PayoutPlanner,
    issuer: Arc<dyn TransactionIssuer>,
    leases: LedgerLeases,
}

impl DistributionLedger {
    pub fn new(
        config: LedgerConfig,
        ledgers: Arc<dyn LedgerRepository>,
        aggregator: ContributionAggregator,
        resolver: MultiplierResolver,
        issuer: Arc<dyn TransactionIssuer>,
    ) -> Result<Self, SpoilsError> {
        config.validate()?;
        let planner = PayoutPlanner::new(config.amount_scale);
        let leases = LedgerLeases::new(config.lease_holder_id.clone(), config.lease_ttl_ms);
        Ok(Self {
            config,
            ledgers,
            aggregator,
            resolver,
            planner,
            issuer,
            leases,
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Opens the pool for an ended battle. Repeating the call with the same
    /// parameters returns the existing ledger.
    pub fn create_ledger(
        &self,
        battle_id: &str,
        battle_number: u64,
        amount: Decimal,
        max_ticks: u32,
        now_ms: i64,
    ) -> Result<CreateLedgerOutcome, SpoilsError> {
        self.validate_create(battle_id, amount, max_ticks)?;
        if let Some(existing) = self.ledgers.ledger_by_battle(battle_id)? {
            return same_parameters(existing, battle_number, amount, max_ticks);
        }
        let battle = self.aggregator.ended_battle(battle_id)?;
        if battle.battle_number != battle_number {
            return Err(SpoilsError::Validation {
                reason: format!(
                    "battle {battle_id} is number {}, not {battle_number}",
                    battle.battle_number
                ),
            });
        }

        let record = SpoilsOfWar::new(battle_id, battle_number, amount, max_ticks, now_ms);
        match self.ledgers.insert_ledger(&record) {
            Ok(()) => {}
            Err(SpoilsError::AlreadyExists { .. }) => {
                let existing = self.load(battle_id)?;
                return same_parameters(existing, battle_number, amount, max_ticks);
            }
            Err(err) => return Err(err),
        }
        info!(
            battle_id,
            battle_number,
            spoils_id = %record.id,
            amount = %amount,
            max_ticks,
            "spoils ledger created"
        );
        Ok(CreateLedgerOutcome {
            record,
            created: true,
        })
    }

    /// Pays out the next tick. A failed transfer leaves the ledger untouched
    /// and the stored plan is reused by the next call.
    pub fn advance_tick(&self, battle_id: &str, now_ms: i64) -> Result<TickOutcome, SpoilsError> {
        let lease = self.leases.acquire(battle_id, now_ms)?;
        let record = self.load(battle_id)?;
        if !record.state().accepts_ticks() {
            return Err(SpoilsError::AlreadyFinalized {
                battle_id: battle_id.to_string(),
            });
        }

        let (plan, resumed) = match self.ledgers.pending_tick(battle_id)? {
            Some(plan) if plan.tick_index == record.current_tick => (plan, true),
            _ => (self.plan_tick(&record, now_ms)?, false),
        };
        self.execute_plan(&lease, record, plan, resumed, now_ms)
    }

    /// Closes a ledger whose ticks are exhausted, sweeping any leftover to the
    /// holding account. Already closed ledgers are returned unchanged.
    pub fn finalize(&self, battle_id: &str, now_ms: i64) -> Result<FinalizeOutcome, SpoilsError> {
        let _lease = self.leases.acquire(battle_id, now_ms)?;
        let record = self.load(battle_id)?;
        self.finalize_locked(record, now_ms)
    }

    /// Stops further ticks and finalizes immediately. A tick whose transfers
    /// were already started is completed first.
    pub fn cancel(&self, battle_id: &str, now_ms: i64) -> Result<FinalizeOutcome, SpoilsError> {
        let lease = self.leases.acquire(battle_id, now_ms)?;
        let mut record = self.load(battle_id)?;
        if !record.state().accepts_ticks() {
            return Err(SpoilsError::AlreadyFinalized {
                battle_id: battle_id.to_string(),
            });
        }

        if let Some(plan) = self.ledgers.pending_tick(battle_id)? {
            if plan.tick_index == record.current_tick {
                record = self.execute_plan(&lease, record, plan, true, now_ms)?.record;
            }
        }

        let mut next = record.clone();
        next.cancelled_at_ms = Some(now_ms);
        next.updated_at_ms = now_ms;
        self.ledgers.update_ledger(&record, &next, &[])?;
        info!(
            battle_id,
            current_tick = next.current_tick,
            max_ticks = next.max_ticks,
            "spoils ledger cancelled"
        );
        self.finalize_locked(next, now_ms)
    }

    pub fn ledger_status(&self, battle_id: &str) -> Result<LedgerStatus, SpoilsError> {
        let record = self.load(battle_id)?;
        let pending_tick = self
            .ledgers
            .pending_tick(battle_id)?
            .filter(|plan| plan.tick_index == record.current_tick)
            .map(|plan| plan.tick_index);
        Ok(LedgerStatus::from_record(&record, pending_tick))
    }

    pub fn disbursements(&self, battle_id: &str) -> Result<Vec<DisbursementRecord>, SpoilsError> {
        self.load(battle_id)?;
        self.ledgers.disbursements(battle_id)
    }

    pub fn open_ledgers(&self) -> Result<Vec<SpoilsOfWar>, SpoilsError> {
        self.ledgers.open_ledgers()
    }

    /// Undistributed funds of the most recent open ledger and of all earlier
    /// open ledgers.
    pub fn pool_summary(&self) -> Result<SpoilsPoolSummary, SpoilsError> {
        let open = self.ledgers.open_ledgers()?;
        let latest = open.iter().max_by_key(|ledger| ledger.battle_number);
        let latest_battle_number = latest.map(|ledger| ledger.battle_number);
        let latest_remaining = latest
            .map(SpoilsOfWar::remaining)
            .unwrap_or(Decimal::ZERO);
        let earlier_remaining = open
            .iter()
            .filter(|ledger| Some(ledger.id.as_str()) != latest.map(|l| l.id.as_str()))
            .fold(Decimal::ZERO, |acc, ledger| acc + ledger.remaining());
        Ok(SpoilsPoolSummary {
            open_ledgers: open.len(),
            latest_battle_number,
            latest_remaining,
            earlier_remaining,
        })
    }

    fn plan_tick(&self, record: &SpoilsOfWar, now_ms: i64) -> Result<TickPlan, SpoilsError> {
        let weights = self.aggregator.aggregate(&record.battle_id)?;
        let multipliers = self.resolver.resolve_many(
            weights.keys().map(String::as_str),
            record.battle_number,
            now_ms,
        )?;
        self.planner
            .plan_tick(record, &weights, &multipliers, now_ms)
    }

    /// Issues the plan's transfers in order and commits the tick. The lease is
    /// renewed before every transfer; once it is lost the tick stops and stays
    /// pending for whoever holds the ledger now.
    fn execute_plan(
        &self,
        lease: &LedgerLeaseGuard,
        record: SpoilsOfWar,
        plan: TickPlan,
        resumed: bool,
        now_ms: i64,
    ) -> Result<TickOutcome, SpoilsError> {
        if let Err(reason) = check_plan(&record, &plan) {
            error!(
                battle_id = %record.battle_id,
                tick = plan.tick_index,
                reason = %reason,
                "tick plan violates ledger invariants"
            );
            return Err(SpoilsError::InvariantViolation {
                battle_id: record.battle_id.clone(),
                reason,
            });
        }
        let plan_digest = plan.digest().map_err(SpoilsError::Serde)?;
        if !resumed {
            self.ledgers.save_pending_tick(&plan)?;
        }

        let mut disbursements = Vec::with_capacity(plan.payouts.len());
        for payout in plan.payouts.iter().filter(|payout| payout.amount > Decimal::ZERO) {
            if let Err(err) = lease.renew() {
                warn!(
                    battle_id = %record.battle_id,
                    tick = plan.tick_index,
                    issued = disbursements.len(),
                    error = %err,
                    "ledger lease lost mid-tick, tick left pending"
                );
                return Err(err);
            }
            let request = self.tick_request(&record, plan.tick_index, payout);
            let transaction_id = self.issuer.transfer(&request).map_err(|source| {
                warn!(
                    battle_id = %record.battle_id,
                    tick = plan.tick_index,
                    player_id = %payout.player_id,
                    error = %source,
                    "spoils transfer failed, tick left pending"
                );
                SpoilsError::NoProgress {
                    battle_id: record.battle_id.clone(),
                    tick_index: Some(plan.tick_index),
                    source,
                }
            })?;
            disbursements.push(DisbursementRecord {
                spoils_id: record.id.clone(),
                battle_id: record.battle_id.clone(),
                kind: DisbursementKind::Tick,
                tick_index: Some(plan.tick_index),
                to_account: request.to_account,
                amount: request.amount,
                transaction_id,
                idempotency_key: request.idempotency_key,
                reference: request.reference,
                plan_digest: Some(plan_digest.clone()),
                issued_at_ms: now_ms,
            });
        }

        let mut next = record.clone();
        next.amount_sent += plan.total;
        next.current_tick += 1;
        next.updated_at_ms = now_ms;
        self.ledgers.update_ledger(&record, &next, &disbursements)?;
        info!(
            battle_id = %next.battle_id,
            tick = plan.tick_index,
            total = %plan.total,
            residue = %plan.residue,
            transfers = disbursements.len(),
            amount_sent = %next.amount_sent,
            resumed,
            "spoils tick committed"
        );

        Ok(TickOutcome {
            battle_id: next.battle_id.clone(),
            tick_index: plan.tick_index,
            plan_digest,
            budget: plan.budget,
            total: plan.total,
            residue: plan.residue,
            transfers: disbursements.len(),
            resumed,
            record: next,
        })
    }

    fn finalize_locked(
        &self,
        record: SpoilsOfWar,
        now_ms: i64,
    ) -> Result<FinalizeOutcome, SpoilsError> {
        match record.state() {
            LedgerState::Closed => {
                return Ok(FinalizeOutcome {
                    leftover_amount: record.leftover_amount.unwrap_or(Decimal::ZERO),
                    transaction_id: record.leftovers_transaction_id.clone(),
                    record,
                    already_closed: true,
                });
            }
            LedgerState::Pending | LedgerState::Distributing => {
                return Err(SpoilsError::TicksRemaining {
                    battle_id: record.battle_id.clone(),
                    current_tick: record.current_tick,
                    max_ticks: record.max_ticks,
                });
            }
            LedgerState::Finalizing => {}
        }

        let (record, leftover) = match record.leftover_amount {
            Some(leftover) => (record, leftover),
            None => {
                let leftover = record.remaining();
                let mut next = record.clone();
                next.leftover_amount = Some(leftover);
                next.updated_at_ms = now_ms;
                self.ledgers.update_ledger(&record, &next, &[])?;
                (next, leftover)
            }
        };

        let mut next = record.clone();
        let mut disbursements = Vec::new();
        if leftover > Decimal::ZERO && record.leftovers_transaction_id.is_none() {
            let request = self.leftover_request(&record, leftover);
            let transaction_id = self.issuer.transfer(&request).map_err(|source| {
                warn!(
                    battle_id = %record.battle_id,
                    leftover = %leftover,
                    error = %source,
                    "leftover sweep failed"
                );
                SpoilsError::NoProgress {
                    battle_id: record.battle_id.clone(),
                    tick_index: None,
                    source,
                }
            })?;
            next.leftovers_transaction_id = Some(transaction_id.clone());
            disbursements.push(DisbursementRecord {
                spoils_id: record.id.clone(),
                battle_id: record.battle_id.clone(),
                kind: DisbursementKind::Leftover,
                tick_index: None,
                to_account: request.to_account,
                amount: request.amount,
                transaction_id,
                idempotency_key: request.idempotency_key,
                reference: request.reference,
                plan_digest: None,
                issued_at_ms: now_ms,
            });
        }
        next.closed_at_ms = Some(now_ms);
        next.updated_at_ms = now_ms;
        self.ledgers.update_ledger(&record, &next, &disbursements)?;
        info!(
            battle_id = %next.battle_id,
            amount_sent = %next.amount_sent,
            leftover = %leftover,
            cancelled = next.cancelled_at_ms.is_some(),
            "spoils ledger closed"
        );

        Ok(FinalizeOutcome {
            leftover_amount: leftover,
            transaction_id: next.leftovers_transaction_id.clone(),
            record: next,
            already_closed: false,
        })
    }

    fn tick_request(
        &self,
        record: &SpoilsOfWar,
        tick_index: u32,
        payout: &PlannedPayout,
    ) -> TransferRequest {
        TransferRequest {
            idempotency_key: tick_idempotency_key(&record.id, tick_index, &payout.player_id),
            from_account: self.config.pool_account_id.clone(),
            to_account: payout.player_id.clone(),
            amount: payout.amount,
            reference: format!(
                "spoils_of_war|{}|{}|{}",
                record.battle_id, tick_index, payout.player_id
            ),
            group: self.config.transfer_group.clone(),
            subgroup: battle_subgroup(record),
            description: format!(
                "Spoils of war tick {}/{} for battle #{}",
                tick_index + 1,
                record.max_ticks,
                record.battle_number
            ),
        }
    }

    fn leftover_request(&self, record: &SpoilsOfWar, leftover: Decimal) -> TransferRequest {
        TransferRequest {
            idempotency_key: leftover_idempotency_key(&record.id),
            from_account: self.config.pool_account_id.clone(),
            to_account: self.config.holding_account_id.clone(),
            amount: leftover,
            reference: format!("spoils_of_war_leftover|{}", record.battle_id),
            group: self.config.transfer_group.clone(),
            subgroup: battle_subgroup(record),
            description: format!(
                "Spoils of war leftover for battle #{}",
                record.battle_number
            ),
        }
    }

    fn validate_create(
        &self,
        battle_id: &str,
        amount: Decimal,
        max_ticks: u32,
    ) -> Result<(), SpoilsError> {
        if battle_id.trim().is_empty() {
            return Err(SpoilsError::Validation {
                reason: "battle_id cannot be empty".to_string(),
            });
        }
        if amount <= Decimal::ZERO {
            return Err(SpoilsError::Validation {
                reason: format!("amount {amount} must be positive"),
            });
        }
        if effective_scale(amount) > self.config.amount_scale {
            return Err(SpoilsError::Validation {
                reason: format!(
                    "amount {amount} has more than {} fractional digits",
                    self.config.amount_scale
                ),
            });
        }
        if max_ticks == 0 || max_ticks > self.config.max_ticks_limit {
            return Err(SpoilsError::Validation {
                reason: format!(
                    "max_ticks {max_ticks} must be within 1..={}",
                    self.config.max_ticks_limit
                ),
            });
        }
        Ok(())
    }

    fn load(&self, battle_id: &str) -> Result<SpoilsOfWar, SpoilsError> {
        self.ledgers
            .ledger_by_battle(battle_id)?
            .ok_or_else(|| SpoilsError::LedgerNotFound {
                battle_id: battle_id.to_string(),
            })
    }
}

fn same_parameters(
    existing: SpoilsOfWar,
    battle_number: u64,
    amount: Decimal,
    max_ticks: u32,
) -> Result<CreateLedgerOutcome, SpoilsError> {
    if existing.battle_number == battle_number
        && existing.amount == amount
        && existing.max_ticks == max_ticks
    {
        return Ok(CreateLedgerOutcome {
            record: existing,
            created: false,
        });
    }
    Err(SpoilsError::AlreadyExists {
        battle_id: existing.battle_id,
    })
}

fn battle_subgroup(record: &SpoilsOfWar) -> String {
    format!("Spoils of War from Battle #{}", record.battle_number)
}

fn check_plan(record: &SpoilsOfWar, plan: &TickPlan) -> Result<(), String> {
    if plan.spoils_id != record.id || plan.battle_id != record.battle_id {
        return Err("plan belongs to another ledger".to_string());
    }
    if plan.tick_index != record.current_tick {
        return Err(format!(
            "plan tick {} does not match current tick {}",
            plan.tick_index, record.current_tick
        ));
    }
    if plan.payouts.iter().any(|payout| payout.amount < Decimal::ZERO) {
        return Err("plan contains a negative payout".to_string());
    }
    let total: Decimal = plan.payouts.iter().map(|payout| payout.amount).sum();
    if total != plan.total {
        return Err(format!("plan total {} != sum of payouts {}", plan.total, total));
    }
    if total > plan.budget {
        return Err(format!("plan total {} exceeds budget {}", total, plan.budget));
    }
    if record.amount_sent + total > record.amount {
        return Err(format!(
            "amount_sent {} + tick total {} exceeds amount {}",
            record.amount_sent, total, record.amount
        ));
    }
    Ok(())
}
