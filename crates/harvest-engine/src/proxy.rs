//! Correlation-ranked substitute lookup.
//!
//! A harvested position usually wants immediate replacement exposure. The
//! finder ranks candidates from a precomputed correlation table; it does not
//! compute correlations itself.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::collaborators::CorrelationSource;

/// A substitute recommendation attached to an opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyAsset {
    pub asset_id: String,
    pub correlation: f64,
}

pub struct ProxyFinder {
    correlations: Arc<dyn CorrelationSource>,
}

impl ProxyFinder {
    pub fn new(correlations: Arc<dyn CorrelationSource>) -> Self {
        Self { correlations }
    }

    /// The single highest-coefficient substitute, or None when the table has
    /// no usable row. An opportunity without a proxy is still actionable.
    pub async fn find_proxy_asset(&self, base_asset: &str) -> Result<Option<ProxyAsset>> {
        Ok(self.ranked_proxies(base_asset, 1).await?.into_iter().next())
    }

    /// Up to `limit` substitutes, highest coefficient first. Ties break on
    /// asset id so repeated scans rank deterministically. The base asset
    /// itself never qualifies.
    pub async fn ranked_proxies(&self, base_asset: &str, limit: usize) -> Result<Vec<ProxyAsset>> {
        let mut entries = self.correlations.correlations_for(base_asset).await?;
        entries.retain(|e| e.proxy_asset != base_asset);
        entries.sort_by(|a, b| {
            b.coefficient
                .partial_cmp(&a.coefficient)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.proxy_asset.cmp(&b.proxy_asset))
        });
        entries.truncate(limit);

        Ok(entries
            .into_iter()
            .map(|e| ProxyAsset {
                asset_id: e.proxy_asset,
                correlation: e.coefficient,
            })
            .collect())
    }
}
