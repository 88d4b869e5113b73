//! Periodic driver that advances and finalizes every open spoils ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use spoils_of_war::proto::{LedgerState, SpoilsOfWar, TransactionId};
use spoils_of_war::{DistributionLedger, SpoilsError};
use tracing::{debug, error, info, warn};

use crate::{AlertSeverity, OperatorAlert, OperatorAlertSink, SchedulerConfig, SchedulerError};

pub const ALERT_CODE_RETRY_BUDGET: &str = "tick_retry_budget_exhausted";
pub const ALERT_CODE_INVARIANT: &str = "invariant_violation";
pub const ALERT_CODE_BATTLE_UNRESOLVED: &str = "battle_unresolved";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LedgerSweepAction {
    Ticked {
        tick_index: u32,
        total: Decimal,
        transfers: usize,
        /// Set when the tick exhausted the ledger and it was closed in the
        /// same sweep.
        leftover_amount: Option<Decimal>,
    },
    Finalized {
        leftover_amount: Decimal,
        transaction_id: Option<TransactionId>,
    },
    Retrying {
        tick_index: Option<u32>,
        consecutive_failures: u32,
        reason: String,
    },
    Quarantined {
        reason: String,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSweepResult {
    pub battle_id: String,
    pub battle_number: u64,
    pub action: LedgerSweepAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub sweep_index: u64,
    pub started_at_ms: i64,
    pub results: Vec<LedgerSweepResult>,
}

impl SweepReport {
    pub fn ticked_count(&self) -> usize {
        self.count(|action| matches!(action, LedgerSweepAction::Ticked { .. }))
    }

    /// Ledgers closed during this sweep, either by a dedicated finalize or
    /// right after their last tick.
    pub fn closed_count(&self) -> usize {
        self.count(|action| {
            matches!(
                action,
                LedgerSweepAction::Finalized { .. }
                    | LedgerSweepAction::Ticked {
                        leftover_amount: Some(_),
                        ..
                    }
            )
        })
    }

    pub fn retrying_count(&self) -> usize {
        self.count(|action| matches!(action, LedgerSweepAction::Retrying { .. }))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|action| {
            matches!(
                action,
                LedgerSweepAction::Failed { .. } | LedgerSweepAction::Quarantined { .. }
            )
        })
    }

    pub fn result_for(&self, battle_id: &str) -> Option<&LedgerSweepResult> {
        self.results
            .iter()
            .find(|result| result.battle_id == battle_id)
    }

    fn count(&self, predicate: impl Fn(&LedgerSweepAction) -> bool) -> usize {
        self.results
            .iter()
            .filter(|result| predicate(&result.action))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FailureStreak {
    tick_index: Option<u32>,
    consecutive: u32,
    alerted: bool,
}

#[derive(Debug, Default)]
struct SchedulerState {
    failures: BTreeMap<String, FailureStreak>,
    quarantined: BTreeSet<String>,
    sweeps: u64,
}

pub struct SpoilsScheduler {
    config: SchedulerConfig,
    ledger: Arc<DistributionLedger>,
    alerts: Arc<dyn OperatorAlertSink>,
    state: Mutex<SchedulerState>,
}

impl std::fmt::Debug for SpoilsScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoilsScheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SpoilsScheduler {
    pub fn new(
        config: SchedulerConfig,
        ledger: Arc<DistributionLedger>,
        alerts: Arc<dyn OperatorAlertSink>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            config,
            ledger,
            alerts,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<DistributionLedger> {
        &self.ledger
    }

    pub fn quarantined(&self) -> Vec<String> {
        self.lock_state().quarantined.iter().cloned().collect()
    }

    /// Consecutive failed sweeps recorded for the ledger's current tick.
    pub fn failure_count(&self, battle_id: &str) -> u32 {
        self.lock_state()
            .failures
            .get(battle_id)
            .map(|streak| streak.consecutive)
            .unwrap_or(0)
    }

    pub fn sweep_count(&self) -> u64 {
        self.lock_state().sweeps
    }

    /// Runs one pass over all open ledgers. Per-ledger failures are reported
    /// in the returned [`SweepReport`]; only a failure to list ledgers aborts
    /// the sweep.
    pub fn run_once(&self, now_ms: i64) -> Result<SweepReport, SchedulerError> {
        let open = self.ledger.open_ledgers()?;
        let quarantined = self.lock_state().quarantined.clone();
        let (held, active): (Vec<SpoilsOfWar>, Vec<SpoilsOfWar>) = open
            .into_iter()
            .partition(|record| quarantined.contains(&record.battle_id));

        let mut results = Vec::with_capacity(held.len() + active.len());
        for record in &held {
            results.push(LedgerSweepResult {
                battle_id: record.battle_id.clone(),
                battle_number: record.battle_number,
                action: LedgerSweepAction::Skipped {
                    reason: "ledger is quarantined".to_string(),
                },
            });
        }

        for chunk in active.chunks(self.config.max_parallel_ledgers) {
            let joined: Vec<_> = thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|record| scope.spawn(move || self.process_ledger(record, now_ms)))
                    .collect();
                handles.into_iter().map(|handle| handle.join()).collect()
            });
            for (record, outcome) in chunk.iter().zip(joined) {
                let action = outcome.unwrap_or_else(|_| {
                    error!(battle_id = %record.battle_id, "ledger worker panicked");
                    LedgerSweepAction::Failed {
                        reason: "ledger worker panicked".to_string(),
                    }
                });
                results.push(LedgerSweepResult {
                    battle_id: record.battle_id.clone(),
                    battle_number: record.battle_number,
                    action,
                });
            }
        }

        let sweep_index = {
            let mut state = self.lock_state();
            state.sweeps = state.sweeps.saturating_add(1);
            state.sweeps
        };
        let report = SweepReport {
            sweep_index,
            started_at_ms: now_ms,
            results,
        };
        info!(
            scheduler_id = %self.config.scheduler_id,
            sweep = sweep_index,
            ledgers = report.results.len(),
            ticked = report.ticked_count(),
            closed = report.closed_count(),
            retrying = report.retrying_count(),
            failed = report.failed_count(),
            "spoils sweep finished"
        );
        Ok(report)
    }

    fn process_ledger(&self, record: &SpoilsOfWar, now_ms: i64) -> LedgerSweepAction {
        let battle_id = record.battle_id.as_str();
        let outcome = match record.state() {
            LedgerState::Pending | LedgerState::Distributing => self.tick(battle_id, now_ms),
            LedgerState::Finalizing => self.finalize(battle_id, now_ms),
            LedgerState::Closed => Ok(LedgerSweepAction::Skipped {
                reason: "ledger is closed".to_string(),
            }),
        };
        match outcome {
            Ok(action) => {
                self.lock_state().failures.remove(battle_id);
                action
            }
            Err(err) => self.handle_failure(record, err, now_ms),
        }
    }

    fn tick(&self, battle_id: &str, now_ms: i64) -> Result<LedgerSweepAction, SpoilsError> {
        let outcome = self.ledger.advance_tick(battle_id, now_ms)?;
        debug!(
            battle_id,
            tick = outcome.tick_index,
            total = %outcome.total,
            resumed = outcome.resumed,
            "sweep advanced ledger"
        );
        let leftover_amount = if self.config.finalize_immediately
            && outcome.record.state() == LedgerState::Finalizing
        {
            Some(self.ledger.finalize(battle_id, now_ms)?.leftover_amount)
        } else {
            None
        };
        Ok(LedgerSweepAction::Ticked {
            tick_index: outcome.tick_index,
            total: outcome.total,
            transfers: outcome.transfers,
            leftover_amount,
        })
    }

    fn finalize(&self, battle_id: &str, now_ms: i64) -> Result<LedgerSweepAction, SpoilsError> {
        let outcome = self.ledger.finalize(battle_id, now_ms)?;
        Ok(LedgerSweepAction::Finalized {
            leftover_amount: outcome.leftover_amount,
            transaction_id: outcome.transaction_id,
        })
    }

    fn handle_failure(
        &self,
        record: &SpoilsOfWar,
        err: SpoilsError,
        now_ms: i64,
    ) -> LedgerSweepAction {
        let battle_id = record.battle_id.as_str();
        match &err {
            SpoilsError::NoProgress { .. }
            | SpoilsError::PresenceUnavailable { .. }
            | SpoilsError::BattleNotFound { .. }
            | SpoilsError::BattleNotEnded { .. } => {
                let tick_index = match &err {
                    SpoilsError::NoProgress { tick_index, .. } => *tick_index,
                    _ => record
                        .state()
                        .accepts_ticks()
                        .then_some(record.current_tick),
                };
                // A ledger whose battle went missing cannot recover on its own.
                let code = match &err {
                    SpoilsError::BattleNotFound { .. } | SpoilsError::BattleNotEnded { .. } => {
                        ALERT_CODE_BATTLE_UNRESOLVED
                    }
                    _ => ALERT_CODE_RETRY_BUDGET,
                };
                let (consecutive, escalate) = self.record_failure(battle_id, tick_index);
                warn!(
                    battle_id,
                    tick = ?tick_index,
                    consecutive_failures = consecutive,
                    error = %err,
                    "spoils ledger made no progress"
                );
                if escalate {
                    self.emit_alert(OperatorAlert {
                        scheduler_id: self.config.scheduler_id.clone(),
                        battle_id: battle_id.to_string(),
                        tick_index,
                        severity: AlertSeverity::Warn,
                        code: code.to_string(),
                        message: err.to_string(),
                        consecutive_failures: consecutive,
                        emitted_at_ms: now_ms,
                    });
                }
                LedgerSweepAction::Retrying {
                    tick_index,
                    consecutive_failures: consecutive,
                    reason: err.to_string(),
                }
            }
            SpoilsError::InvariantViolation { .. } => {
                error!(battle_id, error = %err, "quarantining spoils ledger");
                let consecutive = {
                    let mut state = self.lock_state();
                    state.quarantined.insert(battle_id.to_string());
                    state
                        .failures
                        .remove(battle_id)
                        .map(|streak| streak.consecutive)
                        .unwrap_or(0)
                };
                self.emit_alert(OperatorAlert {
                    scheduler_id: self.config.scheduler_id.clone(),
                    battle_id: battle_id.to_string(),
                    tick_index: record
                        .state()
                        .accepts_ticks()
                        .then_some(record.current_tick),
                    severity: AlertSeverity::Critical,
                    code: ALERT_CODE_INVARIANT.to_string(),
                    message: err.to_string(),
                    consecutive_failures: consecutive.saturating_add(1),
                    emitted_at_ms: now_ms,
                });
                LedgerSweepAction::Quarantined {
                    reason: err.to_string(),
                }
            }
            SpoilsError::Busy { .. }
            | SpoilsError::AlreadyFinalized { .. }
            | SpoilsError::TicksRemaining { .. } => {
                debug!(battle_id, reason = %err, "skipping spoils ledger this sweep");
                LedgerSweepAction::Skipped {
                    reason: err.to_string(),
                }
            }
            _ => {
                error!(battle_id, error = %err, "spoils ledger sweep failed");
                LedgerSweepAction::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Returns the streak length and whether this failure crosses the retry
    /// budget for the first time on this tick.
    fn record_failure(&self, battle_id: &str, tick_index: Option<u32>) -> (u32, bool) {
        let mut state = self.lock_state();
        let streak = state
            .failures
            .entry(battle_id.to_string())
            .or_insert(FailureStreak {
                tick_index,
                consecutive: 0,
                alerted: false,
            });
        if streak.tick_index != tick_index {
            *streak = FailureStreak {
                tick_index,
                consecutive: 0,
                alerted: false,
            };
        }
        streak.consecutive = streak.consecutive.saturating_add(1);
        let escalate = !streak.alerted && streak.consecutive >= self.config.max_tick_retries;
        if escalate {
            streak.alerted = true;
        }
        (streak.consecutive, escalate)
    }

    fn emit_alert(&self, alert: OperatorAlert) {
        if let Err(err) = self.alerts.emit(&alert) {
            error!(
                battle_id = %alert.battle_id,
                code = %alert.code,
                error = %err,
                "failed to emit operator alert"
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryOperatorAlertSink;
    use spoils_of_war::proto::{
        BattleRecord, CollaboratorError, ContributionEvent, ContributionKind, PlannedPayout,
        TickPlan,
    };
    use spoils_of_war::{
        BattleRepository, ContributionAggregator, ContributionPolicy, InMemorySpoilsStore,
        InMemoryTransactionIssuer, LedgerConfig, LedgerRepository, MultiplierPolicy,
        MultiplierResolver, StaticPresenceOracle,
    };

    struct Fixture {
        store: Arc<InMemorySpoilsStore>,
        issuer: Arc<InMemoryTransactionIssuer>,
        alerts: InMemoryOperatorAlertSink,
        scheduler: SpoilsScheduler,
    }

    fn fixture(config: SchedulerConfig) -> Fixture {
        let store = Arc::new(InMemorySpoilsStore::new());
        let issuer = Arc::new(InMemoryTransactionIssuer::new());
        let aggregator = ContributionAggregator::new(store.clone(), ContributionPolicy::default())
            .expect("aggregator");
        let resolver = MultiplierResolver::new(
            store.clone(),
            Arc::new(StaticPresenceOracle::new(true)),
            MultiplierPolicy::default(),
        );
        let ledger = DistributionLedger::new(
            LedgerConfig::default().with_amount_scale(2),
            store.clone(),
            aggregator,
            resolver,
            issuer.clone(),
        )
        .expect("ledger");
        let alerts = InMemoryOperatorAlertSink::new();
        let scheduler =
            SpoilsScheduler::new(config, Arc::new(ledger), Arc::new(alerts.clone()))
                .expect("scheduler");
        Fixture {
            store,
            issuer,
            alerts,
            scheduler,
        }
    }

    impl Fixture {
        fn open_battle(&self, battle_id: &str, battle_number: u64, amount: i64, max_ticks: u32) {
            let mut battle = BattleRecord {
                battle_id: battle_id.to_string(),
                battle_number,
                started_at_ms: 0,
                ended_at_ms: None,
            };
            self.store.upsert_battle(&battle).expect("battle");
            for (player_id, damage) in [("player-a", 3), ("player-b", 1)] {
                self.store
                    .record_contribution(&ContributionEvent {
                        battle_id: battle_id.to_string(),
                        player_id: player_id.to_string(),
                        kind: ContributionKind::Damage,
                        amount: Decimal::new(damage, 0),
                        recorded_at_ms: 50,
                    })
                    .expect("contribution");
            }
            battle.ended_at_ms = Some(100);
            self.store.upsert_battle(&battle).expect("end battle");
            self.scheduler
                .ledger()
                .create_ledger(battle_id, battle_number, Decimal::new(amount, 0), max_ticks, 200)
                .expect("create");
        }
    }

    fn unavailable() -> CollaboratorError {
        CollaboratorError::Unavailable {
            reason: "wallet returned 503".to_string(),
        }
    }

    #[test]
    fn sweeps_tick_every_open_ledger_and_close_exhausted_ones() {
        let fx = fixture(SchedulerConfig::default());
        fx.open_battle("battle-1", 1, 40, 2);
        fx.open_battle("battle-2", 2, 80, 1);

        let first = fx.scheduler.run_once(1_000).expect("sweep 1");
        assert_eq!(first.sweep_index, 1);
        assert_eq!(first.ticked_count(), 2);
        assert_eq!(first.closed_count(), 1);
        assert!(matches!(
            first.result_for("battle-2").expect("battle-2").action,
            LedgerSweepAction::Ticked {
                leftover_amount: Some(_),
                ..
            }
        ));

        let second = fx.scheduler.run_once(2_000).expect("sweep 2");
        assert_eq!(second.results.len(), 1);
        assert_eq!(second.closed_count(), 1);
        assert!(fx.scheduler.ledger().open_ledgers().expect("open").is_empty());
        assert_eq!(fx.issuer.balance("player-a"), Decimal::new(90, 0));
        assert_eq!(fx.issuer.balance("player-b"), Decimal::new(30, 0));
    }

    #[test]
    fn deferred_finalize_runs_on_next_sweep() {
        let mut config = SchedulerConfig::default();
        config.finalize_immediately = false;
        let fx = fixture(config);
        fx.open_battle("battle-1", 1, 10, 1);

        let first = fx.scheduler.run_once(1_000).expect("sweep 1");
        assert_eq!(first.closed_count(), 0);
        let second = fx.scheduler.run_once(2_000).expect("sweep 2");
        assert!(matches!(
            second.result_for("battle-1").expect("result").action,
            LedgerSweepAction::Finalized { .. }
        ));
    }

    #[test]
    fn retry_budget_alerts_once_per_tick_and_resets_on_success() {
        let config = SchedulerConfig::default()
            .with_max_tick_retries(2)
            .expect("retries");
        let fx = fixture(config);
        fx.open_battle("battle-1", 1, 40, 2);

        for sweep in 0..3 {
            fx.issuer.fail_next(unavailable());
            let report = fx.scheduler.run_once(1_000 + sweep).expect("sweep");
            assert_eq!(report.retrying_count(), 1);
        }
        assert_eq!(fx.scheduler.failure_count("battle-1"), 3);
        let alerts = fx.alerts.list().expect("alerts");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warn);
        assert_eq!(alerts[0].code, ALERT_CODE_RETRY_BUDGET);
        assert_eq!(alerts[0].tick_index, Some(0));
        assert_eq!(alerts[0].consecutive_failures, 2);

        let report = fx.scheduler.run_once(5_000).expect("recovered");
        assert_eq!(report.ticked_count(), 1);
        assert_eq!(fx.scheduler.failure_count("battle-1"), 0);
    }

    #[test]
    fn invariant_violation_quarantines_ledger() {
        let fx = fixture(SchedulerConfig::default());
        fx.open_battle("battle-1", 1, 10, 2);
        let record = fx
            .store
            .ledger_by_battle("battle-1")
            .expect("load")
            .expect("ledger");
        fx.store
            .save_pending_tick(&TickPlan {
                spoils_id: record.id.clone(),
                battle_id: record.battle_id.clone(),
                tick_index: 0,
                budget: Decimal::new(500, 0),
                payouts: vec![PlannedPayout {
                    player_id: "player-a".to_string(),
                    weight: Decimal::ONE,
                    multiplier: Decimal::ONE,
                    amount: Decimal::new(500, 0),
                }],
                total: Decimal::new(500, 0),
                residue: Decimal::ZERO,
                planned_at_ms: 300,
            })
            .expect("corrupt plan");

        let report = fx.scheduler.run_once(1_000).expect("sweep");
        assert!(matches!(
            report.result_for("battle-1").expect("result").action,
            LedgerSweepAction::Quarantined { .. }
        ));
        assert_eq!(fx.scheduler.quarantined(), vec!["battle-1".to_string()]);
        let alerts = fx.alerts.list().expect("alerts");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert_eq!(fx.issuer.call_count(), 0);

        let next = fx.scheduler.run_once(2_000).expect("sweep 2");
        assert!(matches!(
            next.result_for("battle-1").expect("result").action,
            LedgerSweepAction::Skipped { .. }
        ));
        assert_eq!(fx.issuer.call_count(), 0);
    }

    #[test]
    fn ledger_without_battle_counts_toward_retry_budget_and_alerts() {
        let config = SchedulerConfig::default()
            .with_max_tick_retries(2)
            .expect("retries");
        let fx = fixture(config);
        // Rows restored from elsewhere can reference a battle this store never saw.
        fx.store
            .insert_ledger(&SpoilsOfWar::new(
                "battle-orphan",
                9,
                Decimal::new(10, 0),
                2,
                100,
            ))
            .expect("orphan ledger");

        for sweep in 0..3 {
            let report = fx.scheduler.run_once(1_000 + sweep).expect("sweep");
            assert!(matches!(
                report.result_for("battle-orphan").expect("result").action,
                LedgerSweepAction::Retrying { .. }
            ));
        }
        assert_eq!(fx.scheduler.failure_count("battle-orphan"), 3);
        let alerts = fx.alerts.list().expect("alerts");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, ALERT_CODE_BATTLE_UNRESOLVED);
        assert_eq!(alerts[0].severity, AlertSeverity::Warn);
        assert_eq!(alerts[0].tick_index, Some(0));
        assert_eq!(fx.issuer.call_count(), 0);
    }

    #[test]
    fn ledger_for_unfinished_battle_cannot_be_created() {
        let fx = fixture(SchedulerConfig::default());
        fx.store
            .upsert_battle(&BattleRecord {
                battle_id: "battle-live".to_string(),
                battle_number: 9,
                started_at_ms: 0,
                ended_at_ms: None,
            })
            .expect("battle");
        let err = fx
            .scheduler
            .ledger()
            .create_ledger("battle-live", 9, Decimal::new(10, 0), 2, 100)
            .expect_err("battle still running");
        assert!(matches!(err, SpoilsError::BattleNotEnded { .. }));

        let report = fx.scheduler.run_once(1_000).expect("sweep");
        assert!(report.results.is_empty());
    }

    #[test]
    fn parallel_sweep_handles_more_ledgers_than_workers() {
        let config = SchedulerConfig::default()
            .with_max_parallel_ledgers(2)
            .expect("parallel");
        let fx = fixture(config);
        for battle_number in 1..=5 {
            fx.open_battle(&format!("battle-{battle_number}"), battle_number, 20, 1);
        }
        let report = fx.scheduler.run_once(1_000).expect("sweep");
        assert_eq!(report.results.len(), 5);
        assert_eq!(report.closed_count(), 5);
        assert_eq!(fx.issuer.balance("player-a"), Decimal::new(75, 0));
    }
}
