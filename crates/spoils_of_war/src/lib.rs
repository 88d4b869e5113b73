//! Ticked, proportional distribution of per-battle reward pools.
//!
//! A [`DistributionLedger`] owns one `SpoilsOfWar` record per battle and pays
//! it out over `max_ticks` ticks, weighting players by contribution
//! ([`ContributionAggregator`]) and active multipliers ([`MultiplierResolver`]),
//! then sweeps whatever is left to a holding account.

mod config;
mod error;

pub mod contribution;
pub mod issuer;
pub mod lease;
pub mod ledger;
pub mod multiplier;
pub mod planner;
pub mod store;
pub mod util;


pub use config::{
    ContributionPolicy, LedgerConfig, MultiplierCombineMode, MultiplierPolicy,
    DEFAULT_AMOUNT_SCALE, DEFAULT_LEASE_TTL_MS, DEFAULT_MAX_TICKS_LIMIT, DEFAULT_TRANSFER_GROUP,
    MAX_AMOUNT_SCALE,
};
pub use contribution::{normalize_scores, ContributionAggregator, WEIGHT_SCALE};
pub use error::{ErrorCategory, SpoilsError};
pub use issuer::{BoundedTransactionIssuer, InMemoryTransactionIssuer, TransactionIssuer};
pub use lease::{LedgerLeaseGuard, LedgerLeases};
pub use ledger::{
    CreateLedgerOutcome, DistributionLedger, FinalizeOutcome, SpoilsPoolSummary, TickOutcome,
};
pub use multiplier::{
    AppliedMultiplier, MultiplierBreakdown, MultiplierResolver, PresenceOracle, SkipReason,
    SkippedMultiplier, StaticPresenceOracle,
};
pub use planner::PayoutPlanner;
pub use store::{
    BattleRepository, FileSpoilsStore, InMemorySpoilsStore, LedgerRepository,
    MultiplierRepository, SnapshotBackend, SpoilsSnapshot,
};
pub use util::now_unix_ms;

pub use spoils_of_war_proto as proto;
