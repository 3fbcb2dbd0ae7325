use std::env;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Friction assumptions applied when estimating what a harvest costs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAssumptions {
    /// Expected slippage as a fraction of the realized loss.
    pub slippage_rate: Decimal,
    /// Flat per-batch commission.
    pub fixed_commission: Decimal,
}

impl Default for CostAssumptions {
    fn default() -> Self {
        Self {
            slippage_rate: dec!(0.002),
            fixed_commission: dec!(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Flat short-term rate used when the tax-profile lookup has no entry
    /// for an owner, as a fraction.
    pub default_short_term_rate: Decimal,
    pub costs: CostAssumptions,
    /// Calendar days on each side of a disposal in which an acquisition of
    /// the same asset disallows the loss.
    pub wash_sale_window_days: i64,
    /// Upper bound on each price or correlation read during a scan. One slow
    /// feed should cost one asset, not the whole pass.
    pub collaborator_timeout: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            default_short_term_rate: dec!(0.35),
            costs: CostAssumptions::default(),
            wash_sale_window_days: 30,
            collaborator_timeout: Duration::from_secs(5),
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            default_short_term_rate: env::var("HARVEST_SHORT_TERM_RATE")
                .unwrap_or_else(|_| "0.35".to_string())
                .parse()?,
            costs: CostAssumptions {
                slippage_rate: env::var("HARVEST_SLIPPAGE_RATE")
                    .unwrap_or_else(|_| "0.002".to_string())
                    .parse()?,
                fixed_commission: env::var("HARVEST_FIXED_COMMISSION")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            },
            wash_sale_window_days: env::var("HARVEST_WASH_SALE_WINDOW_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            collaborator_timeout: Duration::from_secs(
                env::var("HARVEST_COLLABORATOR_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()?,
            ),
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_env_fallbacks() {
        let config = HarvestConfig::from_env().unwrap();
        let defaults = HarvestConfig::default();
        assert_eq!(config.default_short_term_rate, defaults.default_short_term_rate);
        assert_eq!(config.costs.slippage_rate, defaults.costs.slippage_rate);
        assert_eq!(config.costs.fixed_commission, defaults.costs.fixed_commission);
        assert_eq!(config.wash_sale_window_days, defaults.wash_sale_window_days);
        assert_eq!(config.collaborator_timeout, defaults.collaborator_timeout);
    }
}
