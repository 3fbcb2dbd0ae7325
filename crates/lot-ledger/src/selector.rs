//! Lot selection.
//!
//! Pure ordering over a snapshot of open lots; no storage access. The ledger
//! feeds the ordered list to its disposal loop, so the accounting method is
//! testable without a database.

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::models::{LotStatus, TaxLot};

/// Accounting method deciding which open lots a disposal consumes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Highest unit cost first. Ties go to the earliest acquisition, which
    /// favors shedding the most basis (largest loss or smallest gain) and
    /// nudges ties toward long-term treatment.
    Hifo,
    /// Earliest acquisition first.
    Fifo,
    /// Exactly these lots, consumed in the order given.
    SpecificId(Vec<i64>),
}

/// Order `open_lots` for consumption under `method`.
///
/// The snapshot must contain only open lots of a single (owner, asset) pair.
/// For [`SelectionMethod::SpecificId`], every id must name a lot in the
/// snapshot; one that does not yields [`LedgerError::LotNotFound`] (the
/// ledger upgrades that to a more precise mismatch/not-open error when it
/// can see the rest of the table).
pub fn order_lots(
    open_lots: Vec<TaxLot>,
    method: &SelectionMethod,
) -> Result<Vec<TaxLot>, LedgerError> {
    match method {
        SelectionMethod::Hifo => {
            let mut lots = open_lots;
            lots.sort_by(|a, b| {
                b.unit_price
                    .cmp(&a.unit_price)
                    .then_with(|| a.acquired_at.cmp(&b.acquired_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(lots)
        }
        SelectionMethod::Fifo => {
            let mut lots = open_lots;
            lots.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at).then_with(|| a.id.cmp(&b.id)));
            Ok(lots)
        }
        SelectionMethod::SpecificId(ids) => {
            let mut ordered = Vec::with_capacity(ids.len());
            for &lot_id in ids {
                let lot = open_lots
                    .iter()
                    .find(|l| l.id == lot_id)
                    .ok_or(LedgerError::LotNotFound(lot_id))?;
                if lot.status != LotStatus::Open {
                    return Err(LedgerError::LotNotOpen {
                        lot_id,
                        status: lot.status,
                    });
                }
                ordered.push(lot.clone());
            }
            Ok(ordered)
        }
    }
}
