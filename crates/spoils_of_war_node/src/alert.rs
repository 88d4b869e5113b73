//! Operator alerts raised by the scheduler.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

const ALERT_LOG_FILE_NAME: &str = "spoils-alerts.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warn,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub scheduler_id: String,
    pub battle_id: String,
    pub tick_index: Option<u32>,
    pub severity: AlertSeverity,
    pub code: String,
    pub message: String,
    pub consecutive_failures: u32,
    pub emitted_at_ms: i64,
}

pub trait OperatorAlertSink: Send + Sync {
    fn emit(&self, alert: &OperatorAlert) -> Result<(), SchedulerError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOperatorAlertSink {
    alerts: Arc<Mutex<Vec<OperatorAlert>>>,
}

impl InMemoryOperatorAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Result<Vec<OperatorAlert>, SchedulerError> {
        let guard = self
            .alerts
            .lock()
            .map_err(|_| SchedulerError::Io("operator alert sink lock poisoned".into()))?;
        Ok(guard.clone())
    }
}

impl OperatorAlertSink for InMemoryOperatorAlertSink {
    fn emit(&self, alert: &OperatorAlert) -> Result<(), SchedulerError> {
        let mut guard = self
            .alerts
            .lock()
            .map_err(|_| SchedulerError::Io("operator alert sink lock poisoned".into()))?;
        guard.push(alert.clone());
        Ok(())
    }
}

/// Appends alerts as JSON lines to `<root_dir>/spoils-alerts.jsonl`.
#[derive(Debug, Clone)]
pub struct FileOperatorAlertSink {
    root_dir: PathBuf,
}

impl FileOperatorAlertSink {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn log_path(&self) -> PathBuf {
        self.root_dir.join(ALERT_LOG_FILE_NAME)
    }

    pub fn list(&self) -> Result<Vec<OperatorAlert>, SchedulerError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(path)?;
        let reader = BufReader::new(file);
        let mut alerts = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            alerts.push(serde_json::from_str(&line)?);
        }
        Ok(alerts)
    }
}

impl OperatorAlertSink for FileOperatorAlertSink {
    fn emit(&self, alert: &OperatorAlert) -> Result<(), SchedulerError> {
        let line = serde_json::to_string(alert)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
                path: std::env::temp_dir().join(format!("spoils-alert-tests-{prefix}-{unique}")),
            }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn alert(battle_id: &str, severity: AlertSeverity) -> OperatorAlert {
        OperatorAlert {
            scheduler_id: "scheduler-1".to_string(),
            battle_id: battle_id.to_string(),
            tick_index: Some(2),
            severity,
            code: "tick_retry_budget_exhausted".to_string(),
            message: "wallet unavailable".to_string(),
            consecutive_failures: 5,
            emitted_at_ms: 1_000,
        }
    }

    #[test]
    fn file_sink_appends_and_lists_in_order() {
        let guard = TempDirGuard::new("file");
        let dir = guard.path.clone();
        let sink = FileOperatorAlertSink::new(&dir).expect("sink");
        sink.emit(&alert("battle-1", AlertSeverity::Warn)).expect("emit 1");
        sink.emit(&alert("battle-2", AlertSeverity::Critical))
            .expect("emit 2");
        let listed = sink.list().expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].battle_id, "battle-1");
        assert_eq!(listed[1].severity, AlertSeverity::Critical);
    }

    #[test]
    fn in_memory_sink_shares_state_between_clones() {
        let sink = InMemoryOperatorAlertSink::new();
        let observer = sink.clone();
        sink.emit(&alert("battle-1", AlertSeverity::Warn)).expect("emit");
        assert_eq!(observer.list().expect("list").len(), 1);
    }
}
