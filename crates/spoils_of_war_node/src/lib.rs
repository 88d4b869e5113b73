//! Scheduler process around the spoils distribution engine: TOML config,
//! periodic sweeps, HTTP collaborators and operator alerts.

mod alert;
mod config;
mod error;
mod http;
mod runtime;
mod scheduler;
mod service;

pub use alert::{
    AlertSeverity, FileOperatorAlertSink, InMemoryOperatorAlertSink, OperatorAlert,
    OperatorAlertSink,
};
pub use config::{
    IssuerConfig, PresenceConfig, SchedulerConfig, SchedulerFileConfig, StorageConfig,
    DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_ISSUER_TIMEOUT_MS, DEFAULT_MAX_PARALLEL_LEDGERS,
    DEFAULT_MAX_TICK_RETRIES, DEFAULT_TICK_INTERVAL_MS,
};
pub use error::SchedulerError;
pub use http::{classify_status, HttpPresenceOracle, HttpTransactionIssuer};
pub use runtime::{SchedulerRuntime, SchedulerSnapshot};
pub use scheduler::{
    LedgerSweepAction, LedgerSweepResult, SpoilsScheduler, SweepReport,
    ALERT_CODE_BATTLE_UNRESOLVED, ALERT_CODE_INVARIANT, ALERT_CODE_RETRY_BUDGET,
};
pub use service::{assemble_scheduler, build_scheduler};
