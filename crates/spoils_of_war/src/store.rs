//! Repository traits for ledgers, battles and multipliers, plus the in-memory
//! snapshot store and the per-document file store implementing them.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use spoils_of_war_proto::{
    blake3_hex, BattleContribution, BattleRecord, ContributionEvent, DisbursementRecord,
    Multiplier, SpoilsOfWar, TickPlan, UserMultiplier,
};
use tracing::info;

use crate::SpoilsError;

/// Single-document layout written by earlier versions; migrated on open.
const LEGACY_STATE_FILE_NAME: &str = "spoils_state.json";
const OPEN_LEDGER_DIR: &str = "ledgers/open";
const CLOSED_LEDGER_DIR: &str = "ledgers/closed";
const BATTLE_DIR: &str = "battles";
const MULTIPLIER_FILE_NAME: &str = "multipliers.json";

pub trait LedgerRepository: Send + Sync {
    /// Inserts a new ledger; fails with `AlreadyExists` if the battle already has one.
    fn insert_ledger(&self, record: &SpoilsOfWar) -> Result<(), SpoilsError>;

    fn ledger_by_battle(&self, battle_id: &str) -> Result<Option<SpoilsOfWar>, SpoilsError>;

    fn ledgers_by_battle_number(&self, battle_number: u64)
        -> Result<Vec<SpoilsOfWar>, SpoilsError>;

    /// Ledgers that are not closed, ordered by battle number then battle id.
    fn open_ledgers(&self) -> Result<Vec<SpoilsOfWar>, SpoilsError>;

    fn pending_tick(&self, battle_id: &str) -> Result<Option<TickPlan>, SpoilsError>;

    fn save_pending_tick(&self, plan: &TickPlan) -> Result<(), SpoilsError>;

    /// Atomically replaces `expected` with `next`, appends `disbursements` and
    /// drops a pending plan consumed by a tick advance. Fails with
    /// `StoreConflict` if the stored row no longer equals `expected`.
    fn update_ledger(
        &self,
        expected: &SpoilsOfWar,
        next: &SpoilsOfWar,
        disbursements: &[DisbursementRecord],
    ) -> Result<(), SpoilsError>;

    fn disbursements(&self, battle_id: &str) -> Result<Vec<DisbursementRecord>, SpoilsError>;
}

pub trait BattleRepository: Send + Sync {
    /// Inserts or updates a battle. Once `ended_at_ms` is set the record is
    /// frozen and any differing upsert fails with `BattleEnded`.
    fn upsert_battle(&self, battle: &BattleRecord) -> Result<(), SpoilsError>;

    fn battle(&self, battle_id: &str) -> Result<Option<BattleRecord>, SpoilsError>;

    /// Folds one event into the `(battle_id, player_id)` row and returns it.
    /// Rejected with `BattleEnded` once the battle has ended.
    fn record_contribution(
        &self,
        event: &ContributionEvent,
    ) -> Result<BattleContribution, SpoilsError>;

    fn contributions(&self, battle_id: &str) -> Result<Vec<BattleContribution>, SpoilsError>;
}

pub trait MultiplierRepository: Send + Sync {
    fn upsert_multiplier(&self, multiplier: &Multiplier) -> Result<(), SpoilsError>;

    /// Returns `false` when the `(player, multiplier, from_battle_number)` grant exists.
    fn grant_multiplier(&self, grant: &UserMultiplier) -> Result<bool, SpoilsError>;

    fn active_grants(
        &self,
        player_id: &str,
        battle_number: u64,
    ) -> Result<Vec<(UserMultiplier, Multiplier)>, SpoilsError>;
}

/// Whole engine state as one serializable value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoilsSnapshot {
    #[serde(default)]
    pub ledgers: BTreeMap<String, SpoilsOfWar>,
    #[serde(default)]
    pub pending_ticks: BTreeMap<String, TickPlan>,
    #[serde(default)]
    pub disbursements: BTreeMap<String, Vec<DisbursementRecord>>,
    #[serde(default)]
    pub battles: BTreeMap<String, BattleRecord>,
    #[serde(default)]
    pub contributions: BTreeMap<String, BTreeMap<String, BattleContribution>>,
    #[serde(default)]
    pub multipliers: BTreeMap<String, Multiplier>,
    #[serde(default)]
    pub grants: BTreeMap<String, Vec<UserMultiplier>>,
}

impl SpoilsSnapshot {
    fn insert_ledger(&mut self, record: &SpoilsOfWar) -> Result<(), SpoilsError> {
        if self.ledgers.contains_key(&record.battle_id) {
            return Err(SpoilsError::AlreadyExists {
                battle_id: record.battle_id.clone(),
            });
        }
        record
            .check_invariants()
            .map_err(|reason| SpoilsError::InvariantViolation {
                battle_id: record.battle_id.clone(),
                reason,
            })?;
        self.ledgers
            .insert(record.battle_id.clone(), record.clone());
        Ok(())
    }

    fn save_pending_tick(&mut self, plan: &TickPlan) -> Result<(), SpoilsError> {
        let Some(ledger) = self.ledgers.get(&plan.battle_id) else {
            return Err(SpoilsError::LedgerNotFound {
                battle_id: plan.battle_id.clone(),
            });
        };
        if ledger.current_tick != plan.tick_index {
            return Err(SpoilsError::StoreConflict {
                reason: format!(
                    "pending plan for tick {} does not match ledger tick {}",
                    plan.tick_index, ledger.current_tick
                ),
            });
        }
        self.pending_ticks
            .insert(plan.battle_id.clone(), plan.clone());
        Ok(())
    }

    fn update_ledger(
        &mut self,
        expected: &SpoilsOfWar,
        next: &SpoilsOfWar,
        disbursements: &[DisbursementRecord],
    ) -> Result<(), SpoilsError> {
        let Some(stored) = self.ledgers.get(&expected.battle_id) else {
            return Err(SpoilsError::LedgerNotFound {
                battle_id: expected.battle_id.clone(),
            });
        };
        if stored != expected {
            return Err(SpoilsError::StoreConflict {
                reason: format!(
                    "ledger for battle {} changed concurrently (stored tick {}, expected tick {})",
                    expected.battle_id, stored.current_tick, expected.current_tick
                ),
            });
        }
        stored
            .check_transition(next)
            .map_err(|reason| SpoilsError::InvariantViolation {
                battle_id: next.battle_id.clone(),
                reason,
            })?;
        if next.current_tick > stored.current_tick {
            self.pending_ticks.remove(&next.battle_id);
        }
        if !disbursements.is_empty() {
            self.disbursements
                .entry(next.battle_id.clone())
                .or_default()
                .extend(disbursements.iter().cloned());
        }
        self.ledgers.insert(next.battle_id.clone(), next.clone());
        Ok(())
    }

    fn upsert_battle(&mut self, battle: &BattleRecord) -> Result<(), SpoilsError> {
        if battle.battle_id.trim().is_empty() {
            return Err(SpoilsError::Validation {
                reason: "battle_id cannot be empty".to_string(),
            });
        }
        if let Some(existing) = self.battles.get(&battle.battle_id) {
            if existing.has_ended() && existing != battle {
                return Err(SpoilsError::BattleEnded {
                    battle_id: battle.battle_id.clone(),
                });
            }
        }
        self.battles
            .insert(battle.battle_id.clone(), battle.clone());
        Ok(())
    }

    fn record_contribution(
        &mut self,
        event: &ContributionEvent,
    ) -> Result<BattleContribution, SpoilsError> {
        let Some(battle) = self.battles.get(&event.battle_id) else {
            return Err(SpoilsError::BattleNotFound {
                battle_id: event.battle_id.clone(),
            });
        };
        if battle.has_ended() {
            return Err(SpoilsError::BattleEnded {
                battle_id: event.battle_id.clone(),
            });
        }
        if event.player_id.trim().is_empty() {
            return Err(SpoilsError::Validation {
                reason: "contribution player_id cannot be empty".to_string(),
            });
        }
        let row = self
            .contributions
            .entry(event.battle_id.clone())
            .or_default()
            .entry(event.player_id.clone())
            .or_insert_with(|| {
                BattleContribution::empty(&event.battle_id, &event.player_id, event.recorded_at_ms)
            });
        row.apply_event(event);
        Ok(row.clone())
    }

    fn upsert_multiplier(&mut self, multiplier: &Multiplier) -> Result<(), SpoilsError> {
        if multiplier.id.trim().is_empty() {
            return Err(SpoilsError::Validation {
                reason: "multiplier id cannot be empty".to_string(),
            });
        }
        if multiplier.value.is_sign_negative() && !multiplier.value.is_zero() {
            return Err(SpoilsError::Validation {
                reason: format!("multiplier {} value cannot be negative", multiplier.id),
            });
        }
        self.multipliers
            .insert(multiplier.id.clone(), multiplier.clone());
        Ok(())
    }

    fn grant_multiplier(&mut self, grant: &UserMultiplier) -> Result<bool, SpoilsError> {
        if !self.multipliers.contains_key(&grant.multiplier_id) {
            return Err(SpoilsError::Validation {
                reason: format!("unknown multiplier {}", grant.multiplier_id),
            });
        }
        let grants = self.grants.entry(grant.player_id.clone()).or_default();
        if grants.iter().any(|existing| existing.key() == grant.key()) {
            return Ok(false);
        }
        grants.push(grant.clone());
        grants.sort_by(|left, right| left.key().cmp(&right.key()));
        Ok(true)
    }

    fn active_grants(&self, player_id: &str, battle_number: u64) -> Vec<(UserMultiplier, Multiplier)> {
        let Some(grants) = self.grants.get(player_id) else {
            return Vec::new();
        };
        grants
            .iter()
            .filter_map(|grant| {
                let multiplier = self.multipliers.get(&grant.multiplier_id)?;
                grant
                    .is_active_for(multiplier, battle_number)
                    .then(|| (grant.clone(), multiplier.clone()))
            })
            .collect()
    }
}

fn sort_open_ledgers(ledgers: &mut [SpoilsOfWar]) {
    ledgers.sort_by(|left, right| {
        left.battle_number
            .cmp(&right.battle_number)
            .then_with(|| left.battle_id.cmp(&right.battle_id))
    });
}

/// A store that keeps the whole state as one [`SpoilsSnapshot`]. Every
/// mutation runs against a copy and is only published if it succeeds, so a
/// failed step leaves no partial state behind.
pub trait SnapshotBackend: Send + Sync {
    fn read<R>(&self, f: impl FnOnce(&SpoilsSnapshot) -> R) -> Result<R, SpoilsError>;

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut SpoilsSnapshot) -> Result<R, SpoilsError>,
    ) -> Result<R, SpoilsError>;
}

impl<T: SnapshotBackend> LedgerRepository for T {
    fn insert_ledger(&self, record: &SpoilsOfWar) -> Result<(), SpoilsError> {
        self.mutate(|snapshot| snapshot.insert_ledger(record))
    }

    fn ledger_by_battle(&self, battle_id: &str) -> Result<Option<SpoilsOfWar>, SpoilsError> {
        self.read(|snapshot| snapshot.ledgers.get(battle_id).cloned())
    }

    fn ledgers_by_battle_number(
        &self,
        battle_number: u64,
    ) -> Result<Vec<SpoilsOfWar>, SpoilsError> {
        self.read(|snapshot| {
            snapshot
                .ledgers
                .values()
                .filter(|ledger| ledger.battle_number == battle_number)
                .cloned()
                .collect()
        })
    }

    fn open_ledgers(&self) -> Result<Vec<SpoilsOfWar>, SpoilsError> {
        self.read(|snapshot| {
            let mut open: Vec<SpoilsOfWar> = snapshot
                .ledgers
                .values()
                .filter(|ledger| ledger.closed_at_ms.is_none())
                .cloned()
                .collect();
            sort_open_ledgers(&mut open);
            open
        })
    }

    fn pending_tick(&self, battle_id: &str) -> Result<Option<TickPlan>, SpoilsError> {
        self.read(|snapshot| snapshot.pending_ticks.get(battle_id).cloned())
    }

    fn save_pending_tick(&self, plan: &TickPlan) -> Result<(), SpoilsError> {
        self.mutate(|snapshot| snapshot.save_pending_tick(plan))
    }

    fn update_ledger(
        &self,
        expected: &SpoilsOfWar,
        next: &SpoilsOfWar,
        disbursements: &[DisbursementRecord],
    ) -> Result<(), SpoilsError> {
        self.mutate(|snapshot| snapshot.update_ledger(expected, next, disbursements))
    }

    fn disbursements(&self, battle_id: &str) -> Result<Vec<DisbursementRecord>, SpoilsError> {
        self.read(|snapshot| {
            snapshot
                .disbursements
                .get(battle_id)
                .cloned()
                .unwrap_or_default()
        })
    }
}

impl<T: SnapshotBackend> BattleRepository for T {
    fn upsert_battle(&self, battle: &BattleRecord) -> Result<(), SpoilsError> {
        self.mutate(|snapshot| snapshot.upsert_battle(battle))
    }

    fn battle(&self, battle_id: &str) -> Result<Option<BattleRecord>, SpoilsError> {
        self.read(|snapshot| snapshot.battles.get(battle_id).cloned())
    }

    fn record_contribution(
        &self,
        event: &ContributionEvent,
    ) -> Result<BattleContribution, SpoilsError> {
        self.mutate(|snapshot| snapshot.record_contribution(event))
    }

    fn contributions(&self, battle_id: &str) -> Result<Vec<BattleContribution>, SpoilsError> {
        self.read(|snapshot| {
            snapshot
                .contributions
                .get(battle_id)
                .map(|rows| rows.values().cloned().collect())
                .unwrap_or_default()
        })
    }
}

impl<T: SnapshotBackend> MultiplierRepository for T {
    fn upsert_multiplier(&self, multiplier: &Multiplier) -> Result<(), SpoilsError> {
        self.mutate(|snapshot| snapshot.upsert_multiplier(multiplier))
    }

    fn grant_multiplier(&self, grant: &UserMultiplier) -> Result<bool, SpoilsError> {
        self.mutate(|snapshot| snapshot.grant_multiplier(grant))
    }

    fn active_grants(
        &self,
        player_id: &str,
        battle_number: u64,
    ) -> Result<Vec<(UserMultiplier, Multiplier)>, SpoilsError> {
        self.read(|snapshot| snapshot.active_grants(player_id, battle_number))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySpoilsStore {
    state: Mutex<SpoilsSnapshot>,
}

impl InMemorySpoilsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<SpoilsSnapshot, SpoilsError> {
        self.read(SpoilsSnapshot::clone)
    }
}

impl SnapshotBackend for InMemorySpoilsStore {
    fn read<R>(&self, f: impl FnOnce(&SpoilsSnapshot) -> R) -> Result<R, SpoilsError> {
        let guard = self
            .state
            .lock()
            .map_err(|_| SpoilsError::Io("spoils store lock poisoned".into()))?;
        Ok(f(&guard))
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut SpoilsSnapshot) -> Result<R, SpoilsError>,
    ) -> Result<R, SpoilsError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| SpoilsError::Io("spoils store lock poisoned".into()))?;
        let mut working = guard.clone();
        let result = f(&mut working)?;
        *guard = working;
        Ok(result)
    }
}

/// One ledger together with its pending plan and audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerDocument {
    ledger: SpoilsOfWar,
    #[serde(default)]
    pending_tick: Option<TickPlan>,
    #[serde(default)]
    disbursements: Vec<DisbursementRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BattleDocument {
    battle: BattleRecord,
    #[serde(default)]
    contributions: BTreeMap<String, BattleContribution>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MultiplierDocument {
    #[serde(default)]
    multipliers: BTreeMap<String, Multiplier>,
    #[serde(default)]
    grants: BTreeMap<String, Vec<UserMultiplier>>,
}

/// The documents one repository call touches.
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    Ledger(&'a str),
    Battle(&'a str),
    Multipliers,
}

/// File-backed store keeping one JSON document per ledger and per battle
/// plus a shared multiplier document under `root_dir`:
///
/// ```text
/// ledgers/open/<blake3(battle_id)>.json
/// ledgers/closed/<blake3(battle_id)>.json
/// battles/<blake3(battle_id)>.json
/// multipliers.json
/// ```
///
/// Every call reads the documents it needs from disk, so rows written by
/// other processes are visible without reopening. A write only rewrites the
/// documents of its own scope. Closed ledgers move to `ledgers/closed` and no
/// longer cost anything in sweeps.
#[derive(Debug)]
pub struct FileSpoilsStore {
    root_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSpoilsStore {
    pub fn open(root_dir: impl AsRef<Path>) -> Result<Self, SpoilsError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        for dir in [OPEN_LEDGER_DIR, CLOSED_LEDGER_DIR, BATTLE_DIR] {
            let path = root_dir.join(dir);
            fs::create_dir_all(&path).map_err(|err| {
                SpoilsError::Io(format!(
                    "create spoils state dir {} failed: {}",
                    path.display(),
                    err
                ))
            })?;
        }
        let store = Self {
            root_dir,
            write_lock: Mutex::new(()),
        };
        store.migrate_legacy_snapshot()?;
        Ok(store)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn open_ledger_path(&self, battle_id: &str) -> PathBuf {
        self.root_dir
            .join(OPEN_LEDGER_DIR)
            .join(document_file_name(battle_id))
    }

    fn closed_ledger_path(&self, battle_id: &str) -> PathBuf {
        self.root_dir
            .join(CLOSED_LEDGER_DIR)
            .join(document_file_name(battle_id))
    }

    fn battle_path(&self, battle_id: &str) -> PathBuf {
        self.root_dir
            .join(BATTLE_DIR)
            .join(document_file_name(battle_id))
    }

    fn multiplier_path(&self) -> PathBuf {
        self.root_dir.join(MULTIPLIER_FILE_NAME)
    }

    /// A closed document wins over a stale open one left by an interrupted move.
    fn load_ledger_document(&self, battle_id: &str) -> Result<Option<LedgerDocument>, SpoilsError> {
        if let Some(document) = read_document(&self.closed_ledger_path(battle_id))? {
            return Ok(Some(document));
        }
        read_document(&self.open_ledger_path(battle_id))
    }

    fn load_battle_document(&self, battle_id: &str) -> Result<Option<BattleDocument>, SpoilsError> {
        read_document(&self.battle_path(battle_id))
    }

    fn load_multiplier_document(&self) -> Result<MultiplierDocument, SpoilsError> {
        Ok(read_document(&self.multiplier_path())?.unwrap_or_default())
    }

    fn ledger_documents(&self, dir: &str) -> Result<Vec<LedgerDocument>, SpoilsError> {
        let dir = self.root_dir.join(dir);
        let entries = fs::read_dir(&dir).map_err(|err| {
            SpoilsError::Io(format!("list {} failed: {}", dir.display(), err))
        })?;
        let mut documents = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|err| SpoilsError::Io(format!("list {} failed: {}", dir.display(), err)))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(document) = read_document::<LedgerDocument>(&path)? {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    fn load_scope(&self, scope: Scope<'_>) -> Result<SpoilsSnapshot, SpoilsError> {
        let mut snapshot = SpoilsSnapshot::default();
        match scope {
            Scope::Ledger(battle_id) => {
                if let Some(document) = self.load_ledger_document(battle_id)? {
                    if let Some(plan) = document.pending_tick {
                        snapshot.pending_ticks.insert(battle_id.to_string(), plan);
                    }
                    if !document.disbursements.is_empty() {
                        snapshot
                            .disbursements
                            .insert(battle_id.to_string(), document.disbursements);
                    }
                    snapshot
                        .ledgers
                        .insert(battle_id.to_string(), document.ledger);
                }
            }
            Scope::Battle(battle_id) => {
                if let Some(document) = self.load_battle_document(battle_id)? {
                    snapshot
                        .contributions
                        .insert(battle_id.to_string(), document.contributions);
                    snapshot
                        .battles
                        .insert(battle_id.to_string(), document.battle);
                }
            }
            Scope::Multipliers => {
                let document = self.load_multiplier_document()?;
                snapshot.multipliers = document.multipliers;
                snapshot.grants = document.grants;
            }
        }
        Ok(snapshot)
    }

    fn store_scope(&self, scope: Scope<'_>, snapshot: &SpoilsSnapshot) -> Result<(), SpoilsError> {
        match scope {
            Scope::Ledger(battle_id) => {
                let Some(ledger) = snapshot.ledgers.get(battle_id) else {
                    return Ok(());
                };
                let document = LedgerDocument {
                    ledger: ledger.clone(),
                    pending_tick: snapshot.pending_ticks.get(battle_id).cloned(),
                    disbursements: snapshot
                        .disbursements
                        .get(battle_id)
                        .cloned()
                        .unwrap_or_default(),
                };
                if ledger.closed_at_ms.is_some() {
                    write_document(&self.closed_ledger_path(battle_id), &document)?;
                    remove_document(&self.open_ledger_path(battle_id))
                } else {
                    write_document(&self.open_ledger_path(battle_id), &document)
                }
            }
            Scope::Battle(battle_id) => {
                let Some(battle) = snapshot.battles.get(battle_id) else {
                    return Ok(());
                };
                let document = BattleDocument {
                    battle: battle.clone(),
                    contributions: snapshot
                        .contributions
                        .get(battle_id)
                        .cloned()
                        .unwrap_or_default(),
                };
                write_document(&self.battle_path(battle_id), &document)
            }
            Scope::Multipliers => {
                let document = MultiplierDocument {
                    multipliers: snapshot.multipliers.clone(),
                    grants: snapshot.grants.clone(),
                };
                write_document(&self.multiplier_path(), &document)
            }
        }
    }

    fn read_scope<R>(
        &self,
        scope: Scope<'_>,
        f: impl FnOnce(&SpoilsSnapshot) -> R,
    ) -> Result<R, SpoilsError> {
        let snapshot = self.load_scope(scope)?;
        Ok(f(&snapshot))
    }

    /// Loads the scope, applies `f` and writes the scope back only if `f`
    /// succeeds.
    fn mutate_scope<R>(
        &self,
        scope: Scope<'_>,
        f: impl FnOnce(&mut SpoilsSnapshot) -> Result<R, SpoilsError>,
    ) -> Result<R, SpoilsError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| SpoilsError::Io("spoils file store lock poisoned".into()))?;
        let mut working = self.load_scope(scope)?;
        let result = f(&mut working)?;
        self.store_scope(scope, &working)?;
        Ok(result)
    }

    fn migrate_legacy_snapshot(&self) -> Result<(), SpoilsError> {
        let legacy_path = self.root_dir.join(LEGACY_STATE_FILE_NAME);
        let Some(snapshot) = read_document::<SpoilsSnapshot>(&legacy_path)? else {
            return Ok(());
        };
        for battle_id in snapshot.ledgers.keys() {
            self.store_scope(Scope::Ledger(battle_id), &snapshot)?;
        }
        for battle_id in snapshot.battles.keys() {
            self.store_scope(Scope::Battle(battle_id), &snapshot)?;
        }
        self.store_scope(Scope::Multipliers, &snapshot)?;
        let migrated_path = legacy_path.with_extension("json.migrated");
        fs::rename(&legacy_path, &migrated_path).map_err(|err| {
            SpoilsError::Io(format!(
                "rename migrated spoils state {} failed: {}",
                legacy_path.display(),
                err
            ))
        })?;
        info!(
            ledgers = snapshot.ledgers.len(),
            battles = snapshot.battles.len(),
            root_dir = %self.root_dir.display(),
            "migrated single-file spoils state"
        );
        Ok(())
    }
}

impl LedgerRepository for FileSpoilsStore {
    fn insert_ledger(&self, record: &SpoilsOfWar) -> Result<(), SpoilsError> {
        self.mutate_scope(Scope::Ledger(&record.battle_id), |snapshot| {
            snapshot.insert_ledger(record)
        })
    }

    fn ledger_by_battle(&self, battle_id: &str) -> Result<Option<SpoilsOfWar>, SpoilsError> {
        Ok(self
            .load_ledger_document(battle_id)?
            .map(|document| document.ledger))
    }

    fn ledgers_by_battle_number(
        &self,
        battle_number: u64,
    ) -> Result<Vec<SpoilsOfWar>, SpoilsError> {
        let mut matching = BTreeMap::new();
        for dir in [CLOSED_LEDGER_DIR, OPEN_LEDGER_DIR] {
            for document in self.ledger_documents(dir)? {
                if document.ledger.battle_number == battle_number {
                    matching
                        .entry(document.ledger.battle_id.clone())
                        .or_insert(document.ledger);
                }
            }
        }
        Ok(matching.into_values().collect())
    }

    fn open_ledgers(&self) -> Result<Vec<SpoilsOfWar>, SpoilsError> {
        let mut open: Vec<SpoilsOfWar> = self
            .ledger_documents(OPEN_LEDGER_DIR)?
            .into_iter()
            .map(|document| document.ledger)
            .filter(|ledger| {
                ledger.closed_at_ms.is_none()
                    && !self.closed_ledger_path(&ledger.battle_id).exists()
            })
            .collect();
        sort_open_ledgers(&mut open);
        Ok(open)
    }

    fn pending_tick(&self, battle_id: &str) -> Result<Option<TickPlan>, SpoilsError> {
        Ok(self
            .load_ledger_document(battle_id)?
            .and_then(|document| document.pending_tick))
    }

    fn save_pending_tick(&self, plan: &TickPlan) -> Result<(), SpoilsError> {
        self.mutate_scope(Scope::Ledger(&plan.battle_id), |snapshot| {
            snapshot.save_pending_tick(plan)
        })
    }

    fn update_ledger(
        &self,
        expected: &SpoilsOfWar,
        next: &SpoilsOfWar,
        disbursements: &[DisbursementRecord],
    ) -> Result<(), SpoilsError> {
        self.mutate_scope(Scope::Ledger(&expected.battle_id), |snapshot| {
            snapshot.update_ledger(expected, next, disbursements)
        })
    }

    fn disbursements(&self, battle_id: &str) -> Result<Vec<DisbursementRecord>, SpoilsError> {
        Ok(self
            .load_ledger_document(battle_id)?
            .map(|document| document.disbursements)
            .unwrap_or_default())
    }
}

impl BattleRepository for FileSpoilsStore {
    fn upsert_battle(&self, battle: &BattleRecord) -> Result<(), SpoilsError> {
        self.mutate_scope(Scope::Battle(&battle.battle_id), |snapshot| {
            snapshot.upsert_battle(battle)
        })
    }

    fn battle(&self, battle_id: &str) -> Result<Option<BattleRecord>, SpoilsError> {
        Ok(self
            .load_battle_document(battle_id)?
            .map(|document| document.battle))
    }

    fn record_contribution(
        &self,
        event: &ContributionEvent,
    ) -> Result<BattleContribution, SpoilsError> {
        self.mutate_scope(Scope::Battle(&event.battle_id), |snapshot| {
            snapshot.record_contribution(event)
        })
    }

    fn contributions(&self, battle_id: &str) -> Result<Vec<BattleContribution>, SpoilsError> {
        Ok(self
            .load_battle_document(battle_id)?
            .map(|document| document.contributions.into_values().collect())
            .unwrap_or_default())
    }
}

impl MultiplierRepository for FileSpoilsStore {
    fn upsert_multiplier(&self, multiplier: &Multiplier) -> Result<(), SpoilsError> {
        self.mutate_scope(Scope::Multipliers, |snapshot| {
            snapshot.upsert_multiplier(multiplier)
        })
    }

    fn grant_multiplier(&self, grant: &UserMultiplier) -> Result<bool, SpoilsError> {
        self.mutate_scope(Scope::Multipliers, |snapshot| snapshot.grant_multiplier(grant))
    }

    fn active_grants(
        &self,
        player_id: &str,
        battle_number: u64,
    ) -> Result<Vec<(UserMultiplier, Multiplier)>, SpoilsError> {
        self.read_scope(Scope::Multipliers, |snapshot| {
            snapshot.active_grants(player_id, battle_number)
        })
    }
}

fn document_file_name(battle_id: &str) -> String {
    format!("{}.json", blake3_hex(battle_id.as_bytes()))
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SpoilsError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(SpoilsError::Io(format!(
                "read spoils document {} failed: {}",
                path.display(),
                err
            )));
        }
    };
    let document = serde_json::from_slice::<T>(&bytes).map_err(|err| {
        SpoilsError::Serde(format!(
            "parse spoils document {} failed: {}",
            path.display(),
            err
        ))
    })?;
    Ok(Some(document))
}

fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<(), SpoilsError> {
    let bytes = serde_json::to_vec_pretty(document)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, bytes).map_err(|err| {
        SpoilsError::Io(format!(
            "write spoils document temp {} failed: {}",
            temp_path.display(),
            err
        ))
    })?;
    fs::rename(&temp_path, path).map_err(|err| {
        SpoilsError::Io(format!(
            "rename spoils document temp {} -> {} failed: {}",
            temp_path.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

fn remove_document(path: &Path) -> Result<(), SpoilsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SpoilsError::Io(format!(
            "remove spoils document {} failed: {}",
            path.display(),
            err
        ))),
    }
}
