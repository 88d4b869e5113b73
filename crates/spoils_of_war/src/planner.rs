use std::collections::BTreeMap;

use rust_decimal::Decimal;
use spoils_of_war_proto::{PlannedPayout, PlayerId, SpoilsOfWar, TickPlan};

use crate::util::{truncate_at, unit_at};
use crate::SpoilsError;

/// Computes the next tick's disbursement for a ledger.
///
/// Each tick spends `remaining / ticks_left` truncated to the amount scale, so
/// the sub-unit residue of a tick is carried into the next budget instead of
/// accumulating, and the final tick's budget is whatever is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayoutPlanner {
    amount_scale: u32,
}

impl PayoutPlanner {
    pub fn new(amount_scale: u32) -> Self {
        Self { amount_scale }
    }

    pub fn amount_scale(&self) -> u32 {
        self.amount_scale
    }

    pub fn plan_tick(
        &self,
        pool: &SpoilsOfWar,
        weights: &BTreeMap<PlayerId, Decimal>,
        multipliers: &BTreeMap<PlayerId, Decimal>,
        now_ms: i64,
    ) -> Result<TickPlan, SpoilsError> {
        let ticks_left = pool.ticks_left();
        if ticks_left == 0 {
            return Err(SpoilsError::InvariantViolation {
                battle_id: pool.battle_id.clone(),
                reason: format!(
                    "cannot plan tick {} of {}: no ticks left",
                    pool.current_tick, pool.max_ticks
                ),
            });
        }
        let remaining = pool.remaining();
        if remaining < Decimal::ZERO {
            return Err(SpoilsError::InvariantViolation {
                battle_id: pool.battle_id.clone(),
                reason: format!("remaining pool {remaining} is negative"),
            });
        }
        let budget = truncate_at(remaining / Decimal::from(ticks_left), self.amount_scale);

        let mut scores: Vec<(&PlayerId, Decimal, Decimal, Decimal)> =
            Vec::with_capacity(weights.len());
        let mut total_score = Decimal::ZERO;
        for (player_id, weight) in weights {
            let multiplier = multipliers.get(player_id).copied().unwrap_or(Decimal::ONE);
            let score = weight
                .checked_mul(multiplier)
                .ok_or_else(|| overflow(pool, format!("score of {player_id} ({weight} x {multiplier})")))?;
            if score > Decimal::ZERO {
                total_score = total_score
                    .checked_add(score)
                    .ok_or_else(|| overflow(pool, "total score".to_string()))?;
                scores.push((player_id, *weight, multiplier, score));
            }
        }

        let mut payouts = Vec::with_capacity(scores.len());
        if total_score > Decimal::ZERO && budget > Decimal::ZERO {
            for (player_id, weight, multiplier, score) in scores {
                let product = budget
                    .checked_mul(score)
                    .ok_or_else(|| overflow(pool, format!("share of {player_id}")))?;
                let share = truncate_at(product / total_score, self.amount_scale);
                payouts.push(PlannedPayout {
                    player_id: player_id.clone(),
                    weight,
                    multiplier,
                    amount: share.max(Decimal::ZERO),
                });
            }
            self.clip_to_budget(&mut payouts, budget);
        }

        let total = payouts
            .iter()
            .fold(Decimal::ZERO, |acc, payout| acc + payout.amount);
        Ok(TickPlan {
            spoils_id: pool.id.clone(),
            battle_id: pool.battle_id.clone(),
            tick_index: pool.current_tick,
            budget,
            payouts,
            total,
            residue: budget - total,
            planned_at_ms: now_ms,
        })
    }

    // Rounding in the share product can overshoot by a few units. The
    // overshoot is spread over the shares largest first (ties by player id);
    // whatever a small share cannot absorb falls to the next one.
    fn clip_to_budget(&self, payouts: &mut [PlannedPayout], budget: Decimal) {
        let total: Decimal = payouts.iter().map(|payout| payout.amount).sum();
        if total <= budget || payouts.is_empty() {
            return;
        }
        let unit = unit_at(self.amount_scale);
        let mut order: Vec<usize> = (0..payouts.len()).collect();
        order.sort_by(|left, right| {
            payouts[*right]
                .amount
                .cmp(&payouts[*left].amount)
                .then_with(|| payouts[*left].player_id.cmp(&payouts[*right].player_id))
        });

        let count = Decimal::from(order.len());
        let mut overshoot = total - budget;
        let even = truncate_at(overshoot / count, self.amount_scale);
        let mut spare = overshoot - even * count;
        for index in &order {
            let mut cut = even;
            if spare >= unit {
                cut += unit;
                spare -= unit;
            }
            let cut = cut.min(payouts[*index].amount).min(overshoot);
            payouts[*index].amount -= cut;
            overshoot -= cut;
        }
        for index in &order {
            if overshoot <= Decimal::ZERO {
                break;
            }
            let cut = overshoot.min(payouts[*index].amount);
            payouts[*index].amount -= cut;
            overshoot -= cut;
        }
    }
}

fn overflow(pool: &SpoilsOfWar, what: String) -> SpoilsError {
    SpoilsError::InvariantViolation {
        battle_id: pool.battle_id.clone(),
        reason: format!("decimal overflow computing {what}"),
    }
}
