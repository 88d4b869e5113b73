use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type TransactionId = String;

pub fn tick_idempotency_key(spoils_id: &str, tick_index: u32, player_id: &str) -> String {
    format!("sow:{spoils_id}:tick:{tick_index}:{player_id}")
}

pub fn leftover_idempotency_key(spoils_id: &str) -> String {
    format!("sow:{spoils_id}:leftover")
}

/// A single currency movement requested from the wallet service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub idempotency_key: String,
    pub from_account: String,
    pub to_account: String,
    pub amount: Decimal,
    pub reference: String,
    pub group: String,
    pub subgroup: String,
    pub description: String,
}

/// Failure reported by an external collaborator (wallet or presence service).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    Timeout { operation: String, timeout_ms: u64 },
    Unavailable { reason: String },
    Rejected { reason: String },
}

impl CollaboratorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Timeout { .. } | CollaboratorError::Unavailable { .. }
        )
    }
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollaboratorError::Timeout {
                operation,
                timeout_ms,
            } => write!(f, "{operation} timed out after {timeout_ms}ms"),
            CollaboratorError::Unavailable { reason } => {
                write!(f, "collaborator unavailable: {reason}")
            }
            CollaboratorError::Rejected { reason } => {
                write!(f, "collaborator rejected request: {reason}")
            }
        }
    }
}

impl std::error::Error for CollaboratorError {}
