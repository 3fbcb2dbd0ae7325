//! Collaborator seams.
//!
//! The engine owns lots and harvest bookkeeping, nothing else. Prices, tax
//! profiles, acquisition history and the correlation table come from caller
//! supplied implementations of these traits, so the scan logic stays testable
//! against in-memory stubs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A current price observation. The engine tolerates staleness; it never
/// tolerates a quote without a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub asset_id: String,
    pub price: Decimal,
    pub as_of: DateTime<Utc>,
}

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Current unit price for an asset.
    async fn quote(&self, asset_id: &str) -> anyhow::Result<PriceQuote>;
}

#[async_trait]
pub trait TaxProfileLookup: Send + Sync {
    /// Marginal short-term rate for an owner, as a fraction (0.35 = 35%).
    /// None means no profile exists and the engine's flat default applies.
    async fn short_term_rate(&self, owner_id: &str) -> anyhow::Result<Option<Decimal>>;
}

/// One recorded acquisition of an asset, from any account the owner controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionEvent {
    pub asset_id: String,
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait TransactionHistory: Send + Sync {
    /// Acquisitions of `asset_id` by `owner_id` inside `[from, to]`, bounds
    /// inclusive.
    async fn acquisitions_between(
        &self,
        owner_id: &str,
        asset_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<AcquisitionEvent>>;
}

/// Precomputed correlation between a base asset and one candidate substitute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationEntry {
    pub base_asset: String,
    pub proxy_asset: String,
    /// Pearson coefficient in [-1, 1].
    pub coefficient: f64,
}

#[async_trait]
pub trait CorrelationSource: Send + Sync {
    /// Every correlation row for a base asset. Empty when the table knows
    /// nothing about it.
    async fn correlations_for(&self, base_asset: &str) -> anyhow::Result<Vec<CorrelationEntry>>;
}
