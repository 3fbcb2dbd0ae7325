//! Harvest execution.
//!
//! The only path that moves lots to `harvested`. A batch commits the lot
//! transitions, the execution record and the opportunity status flip in one
//! transaction, taken under the same pair lock the ledger's close path uses.
//! When the batch cannot commit, everything rolls back and a failed record
//! is written in its place so the audit trail still shows the attempt.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use lot_ledger::{store, LedgerError, LotLedger, LotStatus};
use rust_decimal::Decimal;
use tokio::time::timeout;
use uuid::Uuid;

use crate::collaborators::{PriceFeed, TaxProfileLookup};
use crate::config::HarvestConfig;
use crate::models::{ExecutionStatus, HarvestExecutionRecord};

pub struct HarvestExecutor {
    ledger: LotLedger,
    price_feed: Arc<dyn PriceFeed>,
    tax_profiles: Arc<dyn TaxProfileLookup>,
    config: HarvestConfig,
}

impl HarvestExecutor {
    pub fn new(
        ledger: LotLedger,
        price_feed: Arc<dyn PriceFeed>,
        tax_profiles: Arc<dyn TaxProfileLookup>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            ledger,
            price_feed,
            tax_profiles,
            config,
        }
    }

    /// Harvest the named lots as one all-or-nothing batch.
    ///
    /// Success returns a completed record. A batch that cannot commit (stale
    /// lot id, pair mismatch, dead price feed) rolls back every lot change
    /// and returns a failed record carrying the reason; the pending
    /// opportunity stays pending. Err is reserved for the bookkeeping itself
    /// breaking, e.g. the records table not accepting the failure row.
    pub async fn execute_harvest(
        &self,
        owner_id: &str,
        asset_id: &str,
        lot_ids: &[i64],
    ) -> Result<HarvestExecutionRecord> {
        if lot_ids.is_empty() {
            anyhow::bail!("Harvest batch for {}/{} names no lots", owner_id, asset_id);
        }
        let mut seen = HashSet::with_capacity(lot_ids.len());
        for id in lot_ids {
            if !seen.insert(*id) {
                anyhow::bail!(
                    "Harvest batch for {}/{} names lot {} more than once",
                    owner_id,
                    asset_id,
                    id
                );
            }
        }

        let batch_id = Uuid::new_v4().to_string();
        let executed_at = Utc::now();

        // 1. Price the batch. No quote, no disposal.
        let quote = match timeout(
            self.config.collaborator_timeout,
            self.price_feed.quote(asset_id),
        )
        .await
        {
            Ok(Ok(quote)) => quote,
            Ok(Err(e)) => {
                return self
                    .record_failure(
                        owner_id,
                        asset_id,
                        lot_ids,
                        &batch_id,
                        format!("Price read failed: {e:#}"),
                        executed_at,
                    )
                    .await;
            }
            Err(_) => {
                return self
                    .record_failure(
                        owner_id,
                        asset_id,
                        lot_ids,
                        &batch_id,
                        "Price read timed out".to_string(),
                        executed_at,
                    )
                    .await;
            }
        };

        let short_term_rate = match self.tax_profiles.short_term_rate(owner_id).await {
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
        };

        // 2. Serialize with disposals on the same pair, then run the batch
        // inside a single transaction.
        let lock = self.ledger.db().pair_lock(owner_id, asset_id);
        let _guard = lock.lock().await;

        let batch_result = self
            .harvest_batch(
                owner_id,
                asset_id,
                lot_ids,
                &batch_id,
                quote.price,
                short_term_rate,
                executed_at,
            )
            .await;

        match batch_result {
            Ok(record) => {
                tracing::info!(
                    "Harvest batch {} completed: {} lots of {}/{}, loss {}",
                    batch_id,
                    lot_ids.len(),
                    owner_id,
                    asset_id,
                    record.total_loss
                );
                Ok(record)
            }
            Err(e) => {
                tracing::warn!("Harvest batch {} rolled back: {:#}", batch_id, e);
                self.record_failure(owner_id, asset_id, lot_ids, &batch_id, format!("{e:#}"), executed_at)
                    .await
            }
        }
    }

    /// Completed and failed batches for an owner, newest first.
    pub async fn execution_history(&self, owner_id: &str) -> Result<Vec<HarvestExecutionRecord>> {
        let rows: Vec<crate::models::ExecutionRow> = sqlx::query_as(
            "SELECT * FROM harvest_executions WHERE owner_id = ? ORDER BY executed_at DESC, id DESC",
        )
        .bind(owner_id)
        .fetch_all(self.ledger.db().pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn harvest_batch(
        &self,
        owner_id: &str,
        asset_id: &str,
        lot_ids: &[i64],
        batch_id: &str,
        disposal_price: Decimal,
        short_term_rate: Decimal,
        executed_at: DateTime<Utc>,
    ) -> Result<HarvestExecutionRecord> {
        let mut tx = self.ledger.db().pool().begin().await?;

        // 3. Validate and transition every named lot. First failure aborts
        // the whole batch; the drop of `tx` rolls prior transitions back.
        let mut total_realized = Decimal::ZERO;
        for &lot_id in lot_ids {
            let lot = store::fetch_lot(&mut *tx, lot_id)
                .await?
                .ok_or(LedgerError::LotNotFound(lot_id))?;
            if lot.owner_id != owner_id || lot.asset_id != asset_id {
                return Err(LedgerError::LotMismatch {
                    lot_id,
                    owner: owner_id.to_string(),
                    asset: asset_id.to_string(),
                }
                .into());
            }
            if lot.status != LotStatus::Open {
                return Err(LedgerError::LotNotOpen {
                    lot_id,
                    status: lot.status,
                }
                .into());
            }

            let realized = lot.quantity * disposal_price - lot.cost_basis;
            let is_long_term = lot.held_long_term(executed_at);
            store::mark_disposed(
                &mut *tx,
                lot_id,
                LotStatus::Harvested,
                disposal_price,
                executed_at,
                realized,
                is_long_term,
                batch_id,
            )
            .await?
            .ok_or(LedgerError::StateChanged(lot_id))?;
            total_realized += realized;
        }

        // 4. Record the batch. Loss is the positive magnitude of the net
        // realized result; a batch that nets a gain saves nothing.
        let total_loss = -total_realized;
        let estimated_tax_savings = if total_loss > Decimal::ZERO {
            total_loss * short_term_rate
        } else {
            Decimal::ZERO
        };

        let lot_ids_json = serde_json::to_string(lot_ids)?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO harvest_executions (batch_id, owner_id, asset_id, lot_ids, total_loss,
                                            estimated_tax_savings, status, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, 'completed', ?)
            RETURNING id
            "#,
        )
        .bind(batch_id)
        .bind(owner_id)
        .bind(asset_id)
        .bind(&lot_ids_json)
        .bind(total_loss.to_string())
        .bind(estimated_tax_savings.to_string())
        .bind(executed_at)
        .fetch_one(&mut *tx)
        .await?;

        // 5. The pair's pending opportunity, if any, is now acted on.
        sqlx::query(
            "UPDATE harvest_opportunities SET status = 'executed' WHERE owner_id = ? AND asset_id = ? AND status = 'pending'",
        )
        .bind(owner_id)
        .bind(asset_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(HarvestExecutionRecord {
            id,
            batch_id: batch_id.to_string(),
            owner_id: owner_id.to_string(),
            asset_id: asset_id.to_string(),
            lot_ids: lot_ids.to_vec(),
            total_loss,
            estimated_tax_savings,
            status: ExecutionStatus::Completed,
            error: None,
            executed_at,
        })
    }

    async fn record_failure(
        &self,
        owner_id: &str,
        asset_id: &str,
        lot_ids: &[i64],
        batch_id: &str,
        error: String,
        executed_at: DateTime<Utc>,
    ) -> Result<HarvestExecutionRecord> {
        let lot_ids_json = serde_json::to_string(lot_ids)?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO harvest_executions (batch_id, owner_id, asset_id, lot_ids, total_loss,
                                            estimated_tax_savings, status, error, executed_at)
            VALUES (?, ?, ?, ?, '0', '0', 'failed', ?, ?)
            RETURNING id
            "#,
        )
        .bind(batch_id)
        .bind(owner_id)
        .bind(asset_id)
        .bind(&lot_ids_json)
        .bind(&error)
        .bind(executed_at)
        .fetch_one(self.ledger.db().pool())
        .await?;

        Ok(HarvestExecutionRecord {
            id,
            batch_id: batch_id.to_string(),
            owner_id: owner_id.to_string(),
            asset_id: asset_id.to_string(),
            lot_ids: lot_ids.to_vec(),
            total_loss: Decimal::ZERO,
            estimated_tax_savings: Decimal::ZERO,
            status: ExecutionStatus::Failed,
            error: Some(error),
            executed_at,
        })
    }
}
