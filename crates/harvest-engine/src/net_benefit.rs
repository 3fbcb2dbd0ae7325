//! Net-benefit arithmetic for a candidate harvest.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::CostAssumptions;

/// Fraction of the loss the net benefit must clear before the trade
/// friction is considered worth it.
const WORTHWHILE_FLOOR: Decimal = dec!(0.05);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetBenefit {
    pub tax_savings: Decimal,
    pub total_costs: Decimal,
    pub net_benefit: Decimal,
    pub is_worthwhile: bool,
}

/// Estimate the after-cost benefit of realizing `loss_amount` (positive
/// magnitude). Savings assume the loss offsets short-term gains, the
/// highest-rate offset available, so this is the optimistic bound.
pub fn calculate_net_benefit(
    loss_amount: Decimal,
    costs: &CostAssumptions,
    short_term_rate: Decimal,
) -> NetBenefit {
    let tax_savings = loss_amount * short_term_rate;
    let total_costs = loss_amount * costs.slippage_rate + costs.fixed_commission;
    let net_benefit = tax_savings - total_costs;

    NetBenefit {
        tax_savings,
        total_costs,
        net_benefit,
        is_worthwhile: net_benefit > loss_amount * WORTHWHILE_FLOOR,
    }
}
