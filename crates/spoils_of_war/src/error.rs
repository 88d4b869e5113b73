//! Error types for the distribution engine.

use std::fmt;
use std::io;

use spoils_of_war_proto::CollaboratorError;

/// Coarse classification used by the scheduler to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Conflict,
    NotFound,
    State,
    TransientIssuer,
    InvariantViolation,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpoilsError {
    Validation { reason: String },
    AlreadyExists { battle_id: String },
    Busy { battle_id: String, reason: String },
    LedgerNotFound { battle_id: String },
    BattleNotFound { battle_id: String },
    BattleNotEnded { battle_id: String },
    BattleEnded { battle_id: String },
    AlreadyFinalized { battle_id: String },
    TicksRemaining { battle_id: String, current_tick: u32, max_ticks: u32 },
    NoProgress {
        battle_id: String,
        tick_index: Option<u32>,
        source: CollaboratorError,
    },
    PresenceUnavailable {
        player_id: String,
        source: CollaboratorError,
    },
    InvariantViolation { battle_id: String, reason: String },
    StoreConflict { reason: String },
    Io(String),
    Serde(String),
}

impl SpoilsError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SpoilsError::Validation { .. } => ErrorCategory::Validation,
            SpoilsError::AlreadyExists { .. } | SpoilsError::Busy { .. } => {
                ErrorCategory::Conflict
            }
            SpoilsError::LedgerNotFound { .. } | SpoilsError::BattleNotFound { .. } => {
                ErrorCategory::NotFound
            }
            SpoilsError::BattleNotEnded { .. }
            | SpoilsError::BattleEnded { .. }
            | SpoilsError::AlreadyFinalized { .. }
            | SpoilsError::TicksRemaining { .. } => ErrorCategory::State,
            SpoilsError::NoProgress { .. } | SpoilsError::PresenceUnavailable { .. } => {
                ErrorCategory::TransientIssuer
            }
            SpoilsError::InvariantViolation { .. } => ErrorCategory::InvariantViolation,
            SpoilsError::StoreConflict { .. } | SpoilsError::Io(_) | SpoilsError::Serde(_) => {
                ErrorCategory::Storage
            }
        }
    }

    /// Whether the same call may succeed on a later scheduler sweep.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientIssuer | ErrorCategory::Storage
        ) || matches!(self, SpoilsError::Busy { .. })
    }
}

impl fmt::Display for SpoilsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpoilsError::Validation { reason } => write!(f, "validation failed: {reason}"),
            SpoilsError::AlreadyExists { battle_id } => {
                write!(f, "spoils ledger already exists for battle {battle_id}")
            }
            SpoilsError::Busy { battle_id, reason } => {
                write!(f, "spoils ledger for battle {battle_id} is busy: {reason}")
            }
            SpoilsError::LedgerNotFound { battle_id } => {
                write!(f, "no spoils ledger for battle {battle_id}")
            }
            SpoilsError::BattleNotFound { battle_id } => write!(f, "unknown battle {battle_id}"),
            SpoilsError::BattleNotEnded { battle_id } => {
                write!(f, "battle {battle_id} has not ended")
            }
            SpoilsError::BattleEnded { battle_id } => {
                write!(f, "battle {battle_id} has ended and is read-only")
            }
            SpoilsError::AlreadyFinalized { battle_id } => {
                write!(f, "spoils ledger for battle {battle_id} is already finalized")
            }
            SpoilsError::TicksRemaining {
                battle_id,
                current_tick,
                max_ticks,
            } => write!(
                f,
                "spoils ledger for battle {battle_id} still has ticks remaining ({current_tick}/{max_ticks})"
            ),
            SpoilsError::NoProgress {
                battle_id,
                tick_index,
                source,
            } => match tick_index {
                Some(tick) => write!(
                    f,
                    "no progress on battle {battle_id} tick {tick}: {source}"
                ),
                None => write!(f, "no progress on battle {battle_id} leftover sweep: {source}"),
            },
            SpoilsError::PresenceUnavailable { player_id, source } => {
                write!(f, "presence lookup for player {player_id} failed: {source}")
            }
            SpoilsError::InvariantViolation { battle_id, reason } => {
                write!(f, "invariant violation on battle {battle_id}: {reason}")
            }
            SpoilsError::StoreConflict { reason } => write!(f, "store conflict: {reason}"),
            SpoilsError::Io(reason) => write!(f, "io error: {reason}"),
            SpoilsError::Serde(reason) => write!(f, "serde error: {reason}"),
        }
    }
}

impl std::error::Error for SpoilsError {}

impl From<serde_json::Error> for SpoilsError {
    fn from(error: serde_json::Error) -> Self {
        SpoilsError::Serde(error.to_string())
    }
}

impl From<io::Error> for SpoilsError {
    fn from(error: io::Error) -> Self {
        SpoilsError::Io(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_failures_are_retryable() {
        let err = SpoilsError::NoProgress {
            battle_id: "battle-1".to_string(),
            tick_index: Some(2),
            source: CollaboratorError::Timeout {
                operation: "transfer".to_string(),
                timeout_ms: 500,
            },
        };
        assert_eq!(err.category(), ErrorCategory::TransientIssuer);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("tick 2"));
    }

    #[test]
    fn invariant_violations_are_not_retryable() {
        let err = SpoilsError::InvariantViolation {
            battle_id: "battle-1".to_string(),
            reason: "overspend".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn writes_to_ended_battles_are_state_errors() {
        let err = SpoilsError::BattleEnded {
            battle_id: "battle-1".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::State);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("read-only"));
    }
}
