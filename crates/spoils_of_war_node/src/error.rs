use std::fmt;
use std::io;

use spoils_of_war::SpoilsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    InvalidConfig { reason: String },
    ReadConfigFile { path: String, message: String },
    ParseConfigFile { path: String, message: String },
    BuildClient { message: String },
    AlreadyRunning { scheduler_id: String },
    NotRunning { scheduler_id: String },
    ThreadSpawnFailed { reason: String },
    ThreadJoinFailed { scheduler_id: String },
    Engine(SpoilsError),
    Io(String),
    Serde(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InvalidConfig { reason } => {
                write!(f, "invalid scheduler config: {reason}")
            }
            SchedulerError::ReadConfigFile { path, message } => {
                write!(f, "read config file failed ({path}): {message}")
            }
            SchedulerError::ParseConfigFile { path, message } => {
                write!(f, "parse config file failed ({path}): {message}")
            }
            SchedulerError::BuildClient { message } => {
                write!(f, "build http client failed: {message}")
            }
            SchedulerError::AlreadyRunning { scheduler_id } => {
                write!(f, "scheduler runtime already running: {scheduler_id}")
            }
            SchedulerError::NotRunning { scheduler_id } => {
                write!(f, "scheduler runtime not running: {scheduler_id}")
            }
            SchedulerError::ThreadSpawnFailed { reason } => {
                write!(f, "failed to spawn scheduler thread: {reason}")
            }
            SchedulerError::ThreadJoinFailed { scheduler_id } => {
                write!(f, "failed to join scheduler thread: {scheduler_id}")
            }
            SchedulerError::Engine(err) => write!(f, "spoils engine error: {err}"),
            SchedulerError::Io(reason) => write!(f, "io error: {reason}"),
            SchedulerError::Serde(reason) => write!(f, "serde error: {reason}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<SpoilsError> for SchedulerError {
    fn from(error: SpoilsError) -> Self {
        SchedulerError::Engine(error)
    }
}

impl From<io::Error> for SchedulerError {
    fn from(error: io::Error) -> Self {
        SchedulerError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        SchedulerError::Serde(error.to_string())
    }
}
