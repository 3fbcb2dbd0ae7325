//! Opportunity scanning.
//!
//! One pass per owner: every held asset is priced, gated through the
//! wash-sale guard, aggregated for unrealized losses and scored for net
//! benefit. Qualifying assets land in harvest_opportunities via an upsert
//! keyed on the pair's single pending row, so rescans refresh instead of
//! duplicating. A failing asset costs that asset, never the pass.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lot_ledger::LotLedger;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::collaborators::{CorrelationSource, PriceFeed, TaxProfileLookup, TransactionHistory};
use crate::config::HarvestConfig;
use crate::models::{HarvestOpportunity, OpportunityRow};
use crate::net_benefit::{calculate_net_benefit, NetBenefit};
use crate::proxy::{ProxyAsset, ProxyFinder};
use crate::wash_sale::WashSaleGuard;

pub struct OpportunityScanner {
    ledger: LotLedger,
    price_feed: Arc<dyn PriceFeed>,
    tax_profiles: Arc<dyn TaxProfileLookup>,
    wash_sale: WashSaleGuard,
    proxies: ProxyFinder,
    config: HarvestConfig,
}

/// Roll-up of one scan pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub total_opportunities: usize,
    pub total_harvestable_loss: Decimal,
    pub total_estimated_savings: Decimal,
    pub total_net_benefit: Decimal,
    pub with_proxy: usize,
}

/// Summarize a scan result for reporting.
pub fn scan_summary(opportunities: &[HarvestOpportunity]) -> ScanSummary {
    ScanSummary {
        total_opportunities: opportunities.len(),
        total_harvestable_loss: opportunities.iter().map(|o| o.total_loss).sum(),
        total_estimated_savings: opportunities.iter().map(|o| o.estimated_tax_savings).sum(),
        total_net_benefit: opportunities.iter().map(|o| o.net_benefit).sum(),
        with_proxy: opportunities
            .iter()
            .filter(|o| o.proxy_asset_id.is_some())
            .count(),
    }
}

impl OpportunityScanner {
    pub fn new(
        ledger: LotLedger,
        price_feed: Arc<dyn PriceFeed>,
        tax_profiles: Arc<dyn TaxProfileLookup>,
        history: Arc<dyn TransactionHistory>,
        correlations: Arc<dyn CorrelationSource>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            ledger,
            price_feed,
            tax_profiles,
            wash_sale: WashSaleGuard::new(history, config.wash_sale_window_days),
            proxies: ProxyFinder::new(correlations),
            config,
        }
    }

    /// Scan every asset an owner holds and record the ones whose aggregate
    /// unrealized loss clears `min_loss_threshold` and is worth harvesting
    /// after costs. Returns the recorded opportunities, best net benefit
    /// first. Assets whose collaborators fail or time out are skipped with a
    /// warning and picked up again on the next pass.
    pub async fn scan_for_opportunities(
        &self,
        owner_id: &str,
        min_loss_threshold: Decimal,
    ) -> Result<Vec<HarvestOpportunity>> {
        let scan_at = Utc::now();
        let short_term_rate = self.short_term_rate_for(owner_id).await;

        let assets = self.ledger.held_assets(owner_id).await?;
        tracing::info!(
            "Scanning {} held assets for {} (loss threshold {})",
            assets.len(),
            owner_id,
            min_loss_threshold
        );

        let mut opportunities = Vec::new();
        for asset_id in &assets {
            match self
                .evaluate_asset(owner_id, asset_id, min_loss_threshold, short_term_rate, scan_at)
                .await
            {
                Ok(Some(opportunity)) => opportunities.push(opportunity),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping {}/{} this pass: {:#}", owner_id, asset_id, e);
                }
            }
        }

        // Best first, so schedulers can work the list top-down.
        opportunities.sort_by(|a, b| b.net_benefit.cmp(&a.net_benefit));

        Ok(opportunities)
    }

    /// Pending opportunities for an owner, best net benefit first.
    pub async fn pending_opportunities(&self, owner_id: &str) -> Result<Vec<HarvestOpportunity>> {
        let rows: Vec<OpportunityRow> = sqlx::query_as(
            "SELECT * FROM harvest_opportunities WHERE owner_id = ? AND status = 'pending'",
        )
        .bind(owner_id)
        .fetch_all(self.ledger.db().pool())
        .await?;

        let mut opportunities = rows
            .into_iter()
            .map(HarvestOpportunity::try_from)
            .collect::<Result<Vec<_>>>()?;
        opportunities.sort_by(|a, b| b.net_benefit.cmp(&a.net_benefit));
        Ok(opportunities)
    }

    /// Retire a pending opportunity without harvesting it. The next scan may
    /// re-detect the asset as a fresh pending row.
    pub async fn dismiss_opportunity(&self, opportunity_id: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE harvest_opportunities SET status = 'dismissed' WHERE id = ? AND status = 'pending'",
        )
        .bind(opportunity_id)
        .execute(self.ledger.db().pool())
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Opportunity {} not found or not pending", opportunity_id);
        }
        tracing::info!("Dismissed opportunity {}", opportunity_id);
        Ok(())
    }

    async fn short_term_rate_for(&self, owner_id: &str) -> Decimal {
        match self.tax_profiles.short_term_rate(owner_id).await {
            Ok(Some(rate)) => rate,
            Ok(None) => self.config.default_short_term_rate,
            Err(e) => {
                tracing::warn!(
                    "Tax profile lookup failed for {}: {:#}; using flat default rate",
                    owner_id,
                    e
                );
                self.config.default_short_term_rate
            }
        }
    }

    async fn evaluate_asset(
        &self,
        owner_id: &str,
        asset_id: &str,
        min_loss_threshold: Decimal,
        short_term_rate: Decimal,
        scan_at: DateTime<Utc>,
    ) -> Result<Option<HarvestOpportunity>> {
        let quote = timeout(self.config.collaborator_timeout, self.price_feed.quote(asset_id))
            .await
            .with_context(|| format!("price read for {asset_id} timed out"))?
            .with_context(|| format!("price read for {asset_id} failed"))?;

        if self
            .wash_sale
            .check_wash_sale_risk(owner_id, asset_id, scan_at)
            .await?
        {
            tracing::info!("Wash-sale risk on {}/{}; excluded this pass", owner_id, asset_id);
            return Ok(None);
        }

        // Losing lots only. Lots sitting at a gain never offset the total.
        let lots = self.ledger.open_lots(owner_id, asset_id).await?;
        let mut total_loss = Decimal::ZERO;
        let mut eligible_lots = 0i64;
        for lot in &lots {
            let gain_loss = lot.unrealized_gain_loss(quote.price);
            if gain_loss < Decimal::ZERO {
                total_loss += -gain_loss;
                eligible_lots += 1;
            }
        }

        if eligible_lots == 0 || total_loss < min_loss_threshold {
            return Ok(None);
        }

        let proxy = timeout(
            self.config.collaborator_timeout,
            self.proxies.find_proxy_asset(asset_id),
        )
        .await
        .with_context(|| format!("correlation read for {asset_id} timed out"))??;

        let benefit = calculate_net_benefit(total_loss, &self.config.costs, short_term_rate);
        if !benefit.is_worthwhile {
            tracing::debug!(
                "{}/{}: loss {} nets {} after costs, below the worthwhile floor",
                owner_id,
                asset_id,
                total_loss,
                benefit.net_benefit
            );
            return Ok(None);
        }

        let opportunity = self
            .upsert_opportunity(
                owner_id,
                asset_id,
                total_loss,
                eligible_lots,
                &benefit,
                proxy.as_ref(),
                scan_at,
            )
            .await?;

        tracing::info!(
            "Opportunity on {}/{}: loss {}, net benefit {} across {} lots",
            owner_id,
            asset_id,
            total_loss,
            benefit.net_benefit,
            eligible_lots
        );
        Ok(Some(opportunity))
    }

    /// Insert or refresh the pair's single pending row. The partial unique
    /// index on pending (owner, asset) makes this a true single-statement
    /// upsert, so concurrent scans cannot duplicate.
    #[allow(clippy::too_many_arguments)]
    async fn upsert_opportunity(
        &self,
        owner_id: &str,
        asset_id: &str,
        total_loss: Decimal,
        eligible_lots: i64,
        benefit: &NetBenefit,
        proxy: Option<&ProxyAsset>,
        detected_at: DateTime<Utc>,
    ) -> Result<HarvestOpportunity> {
        let row: OpportunityRow = sqlx::query_as(
            r#"
            INSERT INTO harvest_opportunities (
                owner_id, asset_id, total_loss, eligible_lots, estimated_tax_savings,
                net_benefit, proxy_asset_id, proxy_correlation, status, last_detected_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT(owner_id, asset_id) WHERE status = 'pending' DO UPDATE SET
                total_loss = excluded.total_loss,
                eligible_lots = excluded.eligible_lots,
                estimated_tax_savings = excluded.estimated_tax_savings,
                net_benefit = excluded.net_benefit,
                proxy_asset_id = excluded.proxy_asset_id,
                proxy_correlation = excluded.proxy_correlation,
                last_detected_at = excluded.last_detected_at
            RETURNING id, owner_id, asset_id, total_loss, eligible_lots, estimated_tax_savings,
                      net_benefit, proxy_asset_id, proxy_correlation, status, last_detected_at,
                      created_at
            "#,
        )
        .bind(owner_id)
        .bind(asset_id)
        .bind(total_loss.to_string())
        .bind(eligible_lots)
        .bind(benefit.tax_savings.to_string())
        .bind(benefit.net_benefit.to_string())
        .bind(proxy.map(|p| p.asset_id.as_str()))
        .bind(proxy.map(|p| p.correlation))
        .bind(detected_at)
        .fetch_one(self.ledger.db().pool())
        .await?;

        row.try_into()
    }
}
