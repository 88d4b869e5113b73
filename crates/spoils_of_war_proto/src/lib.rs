//! Shared record and wire types for the spoils-of-war distribution engine.

pub mod battle;
pub mod ledger;
pub mod multiplier;
pub mod transfer;

use serde::Serialize;

pub use battle::{BattleContribution, BattleRecord, ContributionEvent, ContributionKind};
pub use ledger::{
    spoils_id_for_battle, DisbursementKind, DisbursementRecord, LedgerState, LedgerStatus,
    PlannedPayout, SpoilsOfWar, TickPlan,
};
pub use multiplier::{Multiplier, UserMultiplier};
pub use transfer::{
    leftover_idempotency_key, tick_idempotency_key, CollaboratorError, TransactionId,
    TransferRequest,
};

pub type PlayerId = String;
pub type BattleId = String;

pub fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Encodes `value` as self-describing CBOR after a round trip through
/// `serde_cbor::Value`, which sorts map keys.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    let mut buf = Vec::with_capacity(256);
    let canonical_value = serde_cbor::value::to_value(value)
        .map_err(|err| format!("failed to convert value to canonical cbor: {err}"))?;
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer
        .self_describe()
        .map_err(|err| format!("failed to write cbor self describe tag: {err}"))?;
    canonical_value
        .serialize(&mut serializer)
        .map_err(|err| format!("failed to serialize canonical cbor value: {err}"))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn canonical_cbor_is_independent_of_insertion_order() {
        let mut left = BTreeMap::new();
        left.insert("b", 2);
        left.insert("a", 1);
        let mut right = BTreeMap::new();
        right.insert("a", 1);
        right.insert("b", 2);
        assert_eq!(
            to_canonical_cbor(&left).expect("left"),
            to_canonical_cbor(&right).expect("right")
        );
    }

    #[test]
    fn blake3_hex_is_64_chars() {
        assert_eq!(blake3_hex(b"battle-1").len(), 64);
    }
}
