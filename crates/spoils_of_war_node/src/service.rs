use std::sync::Arc;
use std::time::Duration;

use spoils_of_war::{
    BattleRepository, BoundedTransactionIssuer, ContributionAggregator, DistributionLedger,
    FileSpoilsStore, LedgerRepository, MultiplierRepository, MultiplierResolver, PresenceOracle,
    StaticPresenceOracle, TransactionIssuer,
};
use tracing::info;

use crate::{
    FileOperatorAlertSink, HttpPresenceOracle, HttpTransactionIssuer, InMemoryOperatorAlertSink,
    OperatorAlertSink, SchedulerError, SchedulerFileConfig, SpoilsScheduler,
};

/// Wires the file store, HTTP collaborators and alert sink described by
/// `config` into a ready scheduler.
pub fn build_scheduler(config: &SchedulerFileConfig) -> Result<SpoilsScheduler, SchedulerError> {
    config.validate()?;
    let store = Arc::new(FileSpoilsStore::open(&config.storage.data_dir)?);

    let wallet = HttpTransactionIssuer::new(
        &config.issuer.base_url,
        Duration::from_millis(config.issuer.request_timeout_ms),
    )?;
    let issuer: Arc<dyn TransactionIssuer> = Arc::new(BoundedTransactionIssuer::new(
        Arc::new(wallet),
        config.scheduler.issuer_timeout(),
    ));

    let presence: Arc<dyn PresenceOracle> = match &config.presence.base_url {
        Some(base_url) => Arc::new(HttpPresenceOracle::new(
            base_url,
            Duration::from_millis(config.presence.request_timeout_ms),
        )?),
        None => Arc::new(StaticPresenceOracle::new(config.presence.default_online)),
    };

    let alerts: Arc<dyn OperatorAlertSink> = match &config.storage.alert_dir {
        Some(alert_dir) => Arc::new(FileOperatorAlertSink::new(alert_dir)?),
        None => Arc::new(InMemoryOperatorAlertSink::new()),
    };

    info!(
        data_dir = %config.storage.data_dir.display(),
        wallet = %config.issuer.base_url,
        presence = config.presence.base_url.as_deref().unwrap_or("static"),
        "spoils scheduler wired"
    );
    assemble_scheduler(config, store, issuer, presence, alerts)
}

/// Same as [`build_scheduler`] with caller-supplied storage and collaborators.
pub fn assemble_scheduler<S>(
    config: &SchedulerFileConfig,
    store: Arc<S>,
    issuer: Arc<dyn TransactionIssuer>,
    presence: Arc<dyn PresenceOracle>,
    alerts: Arc<dyn OperatorAlertSink>,
) -> Result<SpoilsScheduler, SchedulerError>
where
    S: LedgerRepository + BattleRepository + MultiplierRepository + 'static,
{
    let battles: Arc<dyn BattleRepository> = store.clone();
    let grants: Arc<dyn MultiplierRepository> = store.clone();
    let ledgers: Arc<dyn LedgerRepository> = store;
    let aggregator = ContributionAggregator::new(battles, config.contribution.clone())?;
    let resolver = MultiplierResolver::new(grants, presence, config.multiplier.clone());
    let ledger = DistributionLedger::new(config.ledger.clone(), ledgers, aggregator, resolver, issuer)?;
    SpoilsScheduler::new(config.scheduler.clone(), Arc::new(ledger), alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

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
                path: std::env::temp_dir().join(format!("spoils-service-tests-{prefix}-{unique}")),
            }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn build_scheduler_opens_store_and_alert_dir() {
        let guard = TempDirGuard::new("wire");
        let dir = guard.path.clone();
        let mut config = SchedulerFileConfig::default();
        config.issuer.base_url = "http://127.0.0.1:9/".to_string();
        config.presence.base_url = Some("http://127.0.0.1:9/presence".to_string());
        config.storage.data_dir = dir.join("data");
        config.storage.alert_dir = Some(dir.join("alerts"));

        let scheduler = build_scheduler(&config).expect("scheduler");
        assert!(scheduler.ledger().open_ledgers().expect("open").is_empty());
        assert!(dir.join("alerts").is_dir());
    }

    #[test]
    fn build_scheduler_rejects_invalid_config() {
        let err = build_scheduler(&SchedulerFileConfig::default()).expect_err("no wallet url");
        assert!(matches!(err, SchedulerError::InvalidConfig { .. }));
    }
}
