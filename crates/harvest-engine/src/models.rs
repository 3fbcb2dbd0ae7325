//! Opportunity and execution-record models.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Pending,
    Executed,
    Dismissed,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Pending => "pending",
            OpportunityStatus::Executed => "executed",
            OpportunityStatus::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpportunityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OpportunityStatus::Pending),
            "executed" => Ok(OpportunityStatus::Executed),
            "dismissed" => Ok(OpportunityStatus::Dismissed),
            other => Err(format!("unknown opportunity status '{other}'")),
        }
    }
}

/// One detected harvest opportunity. At most one pending row exists per
/// (owner, asset) pair; rescans update that row in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestOpportunity {
    pub id: i64,
    pub owner_id: String,
    pub asset_id: String,
    /// Aggregate unrealized loss across eligible lots, positive magnitude.
    pub total_loss: Decimal,
    /// Count of open lots carrying an unrealized loss at scan time.
    pub eligible_lots: i64,
    pub estimated_tax_savings: Decimal,
    pub net_benefit: Decimal,
    pub proxy_asset_id: Option<String>,
    pub proxy_correlation: Option<f64>,
    pub status: OpportunityStatus,
    /// Refreshed on every detection; `created_at` keeps the first one.
    pub last_detected_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OpportunityRow {
    pub id: i64,
    pub owner_id: String,
    pub asset_id: String,
    pub total_loss: String,
    pub eligible_lots: i64,
    pub estimated_tax_savings: String,
    pub net_benefit: String,
    pub proxy_asset_id: Option<String>,
    pub proxy_correlation: Option<f64>,
    pub status: String,
    pub last_detected_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<OpportunityRow> for HarvestOpportunity {
    type Error = anyhow::Error;

    fn try_from(row: OpportunityRow) -> Result<Self> {
        Ok(HarvestOpportunity {
            id: row.id,
            total_loss: parse_decimal(row.id, "total_loss", &row.total_loss)?,
            estimated_tax_savings: parse_decimal(
                row.id,
                "estimated_tax_savings",
                &row.estimated_tax_savings,
            )?,
            net_benefit: parse_decimal(row.id, "net_benefit", &row.net_benefit)?,
            status: row
                .status
                .parse()
                .map_err(|e| anyhow!("opportunity {}: {e}", row.id))?,
            owner_id: row.owner_id,
            asset_id: row.asset_id,
            eligible_lots: row.eligible_lots,
            proxy_asset_id: row.proxy_asset_id,
            proxy_correlation: row.proxy_correlation,
            last_detected_at: row.last_detected_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// Audit record of one harvest batch, kept for completed and failed attempts
/// alike. Never updated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestExecutionRecord {
    pub id: i64,
    pub batch_id: String,
    pub owner_id: String,
    pub asset_id: String,
    /// Lot ids named in the batch request, in request order.
    pub lot_ids: Vec<i64>,
    /// Net realized loss, positive magnitude. Negative when the batch
    /// actually netted a gain.
    pub total_loss: Decimal,
    pub estimated_tax_savings: Decimal,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ExecutionRow {
    pub id: i64,
    pub batch_id: String,
    pub owner_id: String,
    pub asset_id: String,
    pub lot_ids: String,
    pub total_loss: String,
    pub estimated_tax_savings: String,
    pub status: String,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for HarvestExecutionRecord {
    type Error = anyhow::Error;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(HarvestExecutionRecord {
            id: row.id,
            lot_ids: serde_json::from_str(&row.lot_ids)
                .map_err(|e| anyhow!("execution {}: lot_ids: {e}", row.id))?,
            total_loss: parse_decimal(row.id, "total_loss", &row.total_loss)?,
            estimated_tax_savings: parse_decimal(
                row.id,
                "estimated_tax_savings",
                &row.estimated_tax_savings,
            )?,
            status: row
                .status
                .parse()
                .map_err(|e| anyhow!("execution {}: {e}", row.id))?,
            batch_id: row.batch_id,
            owner_id: row.owner_id,
            asset_id: row.asset_id,
            error: row.error,
            executed_at: row.executed_at,
        })
    }
}

fn parse_decimal(id: i64, field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| anyhow!("record {id}: {field}: {e}"))
}
