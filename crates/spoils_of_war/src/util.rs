use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rust_decimal::{Decimal, RoundingStrategy};

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis_to_i64_saturating)
        .unwrap_or(0)
}

fn duration_millis_to_i64_saturating(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Truncates toward zero at `scale` fractional digits.
pub(crate) fn truncate_at(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::ToZero)
}

/// Smallest representable amount at `scale`.
pub(crate) fn unit_at(scale: u32) -> Decimal {
    Decimal::new(1, scale)
}

/// Number of fractional digits actually needed to represent `value`.
pub(crate) fn effective_scale(value: Decimal) -> u32 {
    value.normalize().scale()
}
