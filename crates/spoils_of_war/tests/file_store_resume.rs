use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use spoils_of_war::proto::{
    tick_idempotency_key, BattleRecord, CollaboratorError, ContributionEvent, ContributionKind,
    LedgerState,
};
use spoils_of_war::{
    BattleRepository, ContributionAggregator, ContributionPolicy, DistributionLedger,
    FileSpoilsStore, InMemoryTransactionIssuer, LedgerConfig, LedgerRepository, MultiplierPolicy,
    MultiplierResolver, SpoilsError, StaticPresenceOracle,
};

/// Removes the directory when the test ends, including on a failed assertion.
struct TempDirGuard {
    path: PathBuf,
}

impl TempDirGuard {
    fn new(prefix: &str) -> Self {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("duration")
            .as_nanos();
        Self {
            path: std::env::temp_dir().join(format!("spoils-of-war-it-{prefix}-{unique}")),
        }
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn open_ledger(
    dir: &PathBuf,
    issuer: Arc<InMemoryTransactionIssuer>,
) -> (Arc<FileSpoilsStore>, DistributionLedger) {
    let store = Arc::new(FileSpoilsStore::open(dir).expect("open store"));
    let aggregator = ContributionAggregator::new(store.clone(), ContributionPolicy::default())
        .expect("aggregator");
    let resolver = MultiplierResolver::new(
        store.clone(),
        Arc::new(StaticPresenceOracle::new(true)),
        MultiplierPolicy::default(),
    );
    let ledger = DistributionLedger::new(
        LedgerConfig::default().with_accounts("treasury", "holding"),
        store.clone(),
        aggregator,
        resolver,
        issuer,
    )
    .expect("ledger");
    (store, ledger)
}

fn seed_battle(store: &FileSpoilsStore) {
    let mut battle = BattleRecord {
        battle_id: "battle-42".to_string(),
        battle_number: 42,
        started_at_ms: 0,
        ended_at_ms: None,
    };
    store.upsert_battle(&battle).expect("battle");
    for (player_id, kills) in [("player-a", 3), ("player-b", 1)] {
        store
            .record_contribution(&ContributionEvent {
                battle_id: "battle-42".to_string(),
                player_id: player_id.to_string(),
                kind: ContributionKind::Kill,
                amount: Decimal::new(kills, 0),
                recorded_at_ms: 800,
            })
            .expect("contribution");
    }
    battle.ended_at_ms = Some(900);
    store.upsert_battle(&battle).expect("end battle");
}

#[test]
fn restart_resumes_pending_tick_with_identical_plan() {
    let guard = TempDirGuard::new("resume");
    let dir = guard.path.clone();
    let wallet = Arc::new(InMemoryTransactionIssuer::new());

    let pending_digest = {
        let (store, ledger) = open_ledger(&dir, wallet.clone());
        seed_battle(&store);
        let created = ledger
            .create_ledger("battle-42", 42, Decimal::new(4000, 2), 2, 1_000)
            .expect("create");
        wallet.fail_once_on_key(
            &tick_idempotency_key(&created.record.id, 0, "player-b"),
            CollaboratorError::Timeout {
                operation: "transfer".to_string(),
                timeout_ms: 5_000,
            },
        );
        let err = ledger
            .advance_tick("battle-42", 1_100)
            .expect_err("wallet timeout");
        assert!(matches!(err, SpoilsError::NoProgress { .. }));
        store
            .pending_tick("battle-42")
            .expect("load")
            .expect("pending plan")
            .digest()
            .expect("digest")
    };

    let (store, ledger) = open_ledger(&dir, wallet.clone());
    let status = ledger.ledger_status("battle-42").expect("status");
    assert_eq!(status.current_tick, 0);
    assert_eq!(status.pending_tick, Some(0));

    let resumed = ledger.advance_tick("battle-42", 5_000).expect("resume");
    assert!(resumed.resumed);
    assert_eq!(resumed.plan_digest, pending_digest);
    assert_eq!(wallet.balance("player-a"), Decimal::new(1500, 2));
    assert_eq!(wallet.balance("player-b"), Decimal::new(500, 2));

    ledger.advance_tick("battle-42", 5_100).expect("last tick");
    let closed = ledger.finalize("battle-42", 5_200).expect("finalize");
    assert_eq!(closed.record.state(), LedgerState::Closed);
    assert_eq!(closed.leftover_amount, Decimal::ZERO);
    assert_eq!(wallet.balance("treasury"), Decimal::new(-4000, 2));

    drop(ledger);
    drop(store);
    let (_, reopened) = open_ledger(&dir, wallet);
    let audit = reopened.disbursements("battle-42").expect("audit");
    assert_eq!(audit.len(), 4);
    assert!(reopened.open_ledgers().expect("open").is_empty());
}

#[test]
fn reopened_store_rejects_duplicate_ledger_with_other_pool() {
    let guard = TempDirGuard::new("duplicate");
    let dir = guard.path.clone();
    let wallet = Arc::new(InMemoryTransactionIssuer::new());
    {
        let (store, ledger) = open_ledger(&dir, wallet.clone());
        seed_battle(&store);
        ledger
            .create_ledger("battle-42", 42, Decimal::new(10, 0), 3, 1_000)
            .expect("create");
    }
    let (_, ledger) = open_ledger(&dir, wallet);
    let again = ledger
        .create_ledger("battle-42", 42, Decimal::new(10, 0), 3, 2_000)
        .expect("idempotent create");
    assert!(!again.created);
    let err = ledger
        .create_ledger("battle-42", 42, Decimal::new(10, 0), 4, 2_000)
        .expect_err("conflict");
    assert!(matches!(err, SpoilsError::AlreadyExists { .. }));
}
