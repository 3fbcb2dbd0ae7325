//! Tax-lot data model.
//!
//! Quantities, prices and bases are `Decimal` end to end and persist as TEXT,
//! so splitting a lot never leaks or invents quantity the way float math can.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Days a lot must be held strictly longer than to classify long-term.
pub const LONG_TERM_THRESHOLD_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotStatus {
    Open,
    Closed,
    Harvested,
}

impl LotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotStatus::Open => "open",
            LotStatus::Closed => "closed",
            LotStatus::Harvested => "harvested",
        }
    }
}

impl fmt::Display for LotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(LotStatus::Open),
            "closed" => Ok(LotStatus::Closed),
            "harvested" => Ok(LotStatus::Harvested),
            other => Err(format!("unknown lot status '{other}'")),
        }
    }
}

/// One tax lot. `quantity` and `unit_price` never change after acquisition
/// except when a partial disposal shrinks the remaining open lot; the closed
/// portion is appended as its own row carrying the original acquisition data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxLot {
    pub id: i64,
    pub owner_id: String,
    pub asset_id: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub cost_basis: Decimal,
    pub status: LotStatus,
    pub acquired_at: DateTime<Utc>,
    pub disposed_at: Option<DateTime<Utc>>,
    pub disposal_unit_price: Option<Decimal>,
    /// Signed: negative is a loss. Set once on close or harvest.
    pub realized_gain_loss: Option<Decimal>,
    pub is_long_term: Option<bool>,
    /// Correlates lots disposed in the same call (one close, one harvest batch).
    pub batch_id: Option<String>,
}

impl TaxLot {
    /// Signed unrealized result at `current_price`.
    pub fn unrealized_gain_loss(&self, current_price: Decimal) -> Decimal {
        self.quantity * current_price - self.cost_basis
    }

    /// Whole days held as of `as_of`.
    pub fn days_held(&self, as_of: DateTime<Utc>) -> i64 {
        (as_of - self.acquired_at).num_days()
    }

    /// Long-term iff held strictly longer than [`LONG_TERM_THRESHOLD_DAYS`].
    /// A disposal exactly 365 days after acquisition is still short-term.
    pub fn held_long_term(&self, disposal: DateTime<Utc>) -> bool {
        self.days_held(disposal) > LONG_TERM_THRESHOLD_DAYS
    }
}

/// Unrealized position of one open lot against a supplied price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnrealizedReport {
    pub lot_id: i64,
    pub gain_loss: Decimal,
    pub gain_loss_percent: Decimal,
    pub days_held: i64,
    pub is_long_term: bool,
    /// Days until the holding turns long-term. None once it already is.
    pub days_until_long_term: Option<i64>,
}

/// Raw row shape: decimals come back as TEXT and are parsed on conversion.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LotRow {
    pub id: i64,
    pub owner_id: String,
    pub asset_id: String,
    pub quantity: String,
    pub unit_price: String,
    pub cost_basis: String,
    pub status: String,
    pub acquired_at: DateTime<Utc>,
    pub disposed_at: Option<DateTime<Utc>>,
    pub disposal_unit_price: Option<String>,
    pub realized_gain_loss: Option<String>,
    pub is_long_term: Option<bool>,
    pub batch_id: Option<String>,
}

fn parse_decimal(lot_id: i64, field: &str, raw: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(raw).map_err(|e| LedgerError::CorruptRecord {
        lot_id,
        detail: format!("{field}: {e}"),
    })
}

impl TryFrom<LotRow> for TaxLot {
    type Error = LedgerError;

    fn try_from(row: LotRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(|e| LedgerError::CorruptRecord {
            lot_id: row.id,
            detail: e,
        })?;
        let disposal_unit_price = row
            .disposal_unit_price
            .map(|raw| parse_decimal(row.id, "disposal_unit_price", &raw))
            .transpose()?;
        let realized_gain_loss = row
            .realized_gain_loss
            .map(|raw| parse_decimal(row.id, "realized_gain_loss", &raw))
            .transpose()?;

        Ok(TaxLot {
            id: row.id,
            quantity: parse_decimal(row.id, "quantity", &row.quantity)?,
            unit_price: parse_decimal(row.id, "unit_price", &row.unit_price)?,
            cost_basis: parse_decimal(row.id, "cost_basis", &row.cost_basis)?,
            owner_id: row.owner_id,
            asset_id: row.asset_id,
            status,
            acquired_at: row.acquired_at,
            disposed_at: row.disposed_at,
            disposal_unit_price,
            realized_gain_loss,
            is_long_term: row.is_long_term,
            batch_id: row.batch_id,
        })
    }
}
