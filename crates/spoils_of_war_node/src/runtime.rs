use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use spoils_of_war::now_unix_ms;
use tracing::{error, info};

use crate::{SchedulerError, SpoilsScheduler, SweepReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub scheduler_id: String,
    pub running: bool,
    pub sweep_count: u64,
    pub last_sweep_unix_ms: Option<i64>,
    pub last_report: Option<SweepReport>,
    pub last_error: Option<String>,
    pub quarantined: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct RuntimeState {
    sweep_count: u64,
    last_sweep_unix_ms: Option<i64>,
    last_report: Option<SweepReport>,
    last_error: Option<String>,
}

/// Runs [`SpoilsScheduler::run_once`] on a background thread every
/// `tick_interval_ms` until stopped.
pub struct SchedulerRuntime {
    scheduler: Arc<SpoilsScheduler>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<RuntimeState>>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SchedulerRuntime {
    pub fn new(scheduler: Arc<SpoilsScheduler>) -> Self {
        Self {
            scheduler,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(RuntimeState::default())),
            stop_tx: None,
            worker: None,
        }
    }

    pub fn scheduler(&self) -> &Arc<SpoilsScheduler> {
        &self.scheduler
    }

    pub fn start(&mut self) -> Result<(), SchedulerError> {
        let scheduler_id = self.scheduler.config().scheduler_id.clone();
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning { scheduler_id });
        }

        {
            let mut state = lock_state(&self.state);
            *state = RuntimeState::default();
        }

        let tick_interval = self.scheduler.config().tick_interval();
        let worker_name = format!("spoils-scheduler-{scheduler_id}");
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let scheduler = Arc::clone(&self.scheduler);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name(worker_name)
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(tick_interval) {
                        Ok(()) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let now_ms = now_unix_ms();
                            let result = scheduler.run_once(now_ms);
                            let mut current = lock_state(&state);
                            current.sweep_count = current.sweep_count.saturating_add(1);
                            current.last_sweep_unix_ms = Some(now_ms);
                            match result {
                                Ok(report) => {
                                    current.last_report = Some(report);
                                    current.last_error = None;
                                }
                                Err(err) => {
                                    error!(error = %err, "spoils sweep aborted");
                                    current.last_error = Some(err.to_string());
                                }
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|err| {
                self.running.store(false, Ordering::SeqCst);
                SchedulerError::ThreadSpawnFailed {
                    reason: err.to_string(),
                }
            })?;

        info!(
            scheduler_id = %self.scheduler.config().scheduler_id,
            tick_interval_ms = self.scheduler.config().tick_interval_ms,
            "spoils scheduler started"
        );
        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), SchedulerError> {
        let scheduler_id = self.scheduler.config().scheduler_id.clone();
        if !self.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning { scheduler_id });
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| SchedulerError::ThreadJoinFailed {
                    scheduler_id: scheduler_id.clone(),
                })?;
        }
        self.running.store(false, Ordering::SeqCst);
        info!(scheduler_id = %scheduler_id, "spoils scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = lock_state(&self.state);
        SchedulerSnapshot {
            scheduler_id: self.scheduler.config().scheduler_id.clone(),
            running: self.running.load(Ordering::SeqCst),
            sweep_count: state.sweep_count,
            last_sweep_unix_ms: state.last_sweep_unix_ms,
            last_report: state.last_report.clone(),
            last_error: state.last_error.clone(),
            quarantined: self.scheduler.quarantined(),
        }
    }
}

impl Drop for SchedulerRuntime {
    fn drop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn lock_state(state: &Arc<Mutex<RuntimeState>>) -> MutexGuard<'_, RuntimeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryOperatorAlertSink, SchedulerConfig};
    use rust_decimal::Decimal;
    use spoils_of_war::proto::{BattleRecord, ContributionEvent, ContributionKind};
    use spoils_of_war::{
        BattleRepository, ContributionAggregator, ContributionPolicy, DistributionLedger,
        InMemorySpoilsStore, InMemoryTransactionIssuer, LedgerConfig, MultiplierPolicy,
        MultiplierResolver, StaticPresenceOracle,
    };
    use std::time::{Duration, Instant};

    fn runtime(tick_interval_ms: u64) -> (SchedulerRuntime, Arc<InMemoryTransactionIssuer>) {
        let store = Arc::new(InMemorySpoilsStore::new());
        let issuer = Arc::new(InMemoryTransactionIssuer::new());
        let mut battle = BattleRecord {
            battle_id: "battle-1".to_string(),
            battle_number: 1,
            started_at_ms: 0,
            ended_at_ms: None,
        };
        store.upsert_battle(&battle).expect("battle");
        store
            .record_contribution(&ContributionEvent {
                battle_id: "battle-1".to_string(),
                player_id: "player-a".to_string(),
                kind: ContributionKind::Kill,
                amount: Decimal::ONE,
                recorded_at_ms: 5,
            })
            .expect("contribution");
        battle.ended_at_ms = Some(10);
        store.upsert_battle(&battle).expect("end battle");
        let aggregator = ContributionAggregator::new(store.clone(), ContributionPolicy::default())
            .expect("aggregator");
        let resolver = MultiplierResolver::new(
            store.clone(),
            Arc::new(StaticPresenceOracle::new(true)),
            MultiplierPolicy::default(),
        );
        let ledger = DistributionLedger::new(
            LedgerConfig::default(),
            store,
            aggregator,
            resolver,
            issuer.clone(),
        )
        .expect("ledger");
        ledger
            .create_ledger("battle-1", 1, Decimal::new(30, 0), 3, 20)
            .expect("create");
        let config = SchedulerConfig::default()
            .with_tick_interval_ms(tick_interval_ms)
            .expect("interval");
        let scheduler = SpoilsScheduler::new(
            config,
            Arc::new(ledger),
            Arc::new(InMemoryOperatorAlertSink::new()),
        )
        .expect("scheduler");
        (SchedulerRuntime::new(Arc::new(scheduler)), issuer)
    }

    #[test]
    fn runtime_sweeps_until_ledger_closes() {
        let (mut runtime, issuer) = runtime(10);
        runtime.start().expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while issuer.balance("player-a") < Decimal::new(30, 0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        runtime.stop().expect("stop");

        let snapshot = runtime.snapshot();
        assert!(!snapshot.running);
        assert!(snapshot.sweep_count >= 3);
        assert!(snapshot.last_error.is_none());
        assert_eq!(issuer.balance("player-a"), Decimal::new(30, 0));
    }

    #[test]
    fn double_start_is_rejected() {
        let (mut runtime, _) = runtime(1_000);
        runtime.start().expect("start");
        let err = runtime.start().expect_err("second start");
        assert!(matches!(err, SchedulerError::AlreadyRunning { .. }));
        runtime.stop().expect("stop");
    }

    #[test]
    fn stop_without_start_is_rejected() {
        let (mut runtime, _) = runtime(1_000);
        let err = runtime.stop().expect_err("not running");
        assert!(matches!(err, SchedulerError::NotRunning { .. }));
        assert!(!runtime.is_running());
    }
}
