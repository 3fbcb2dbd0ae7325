//! Lot Ledger service.
//!
//! Owns every write to the tax_lots table. Disposals run inside one
//! transaction while holding the (owner, asset) pair lock, so two concurrent
//! closes can never both spend the same open quantity.

use std::collections::HashSet;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::LedgerDb;
use crate::error::LedgerError;
use crate::models::{LotStatus, TaxLot, UnrealizedReport, LONG_TERM_THRESHOLD_DAYS};
use crate::selector::{order_lots, SelectionMethod};
use crate::store;

/// One lot consumed by a disposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedLot {
    /// The terminal row: the original lot on a full close, the appended
    /// portion row on a split.
    pub lot: TaxLot,
    /// Lot the quantity was taken from.
    pub source_lot_id: i64,
    /// True when the source lot was only partially consumed.
    pub split: bool,
}

/// Result of a [`LotLedger::close_lots`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LotCloseOutcome {
    pub owner_id: String,
    pub asset_id: String,
    /// Correlates every row this disposal touched.
    pub batch_id: String,
    pub units_closed: Decimal,
    pub disposal_unit_price: Decimal,
    /// Signed sum across the consumed lots.
    pub realized_gain_loss: Decimal,
    pub closed: Vec<ClosedLot>,
}

#[derive(Clone)]
pub struct LotLedger {
    db: LedgerDb,
}

impl LotLedger {
    pub fn new(db: LedgerDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &LedgerDb {
        &self.db
    }

    /// Record an acquisition as a new open lot.
    pub async fn add_lot(
        &self,
        owner_id: &str,
        asset_id: &str,
        quantity: Decimal,
        unit_price: Decimal,
        acquired_at: chrono::DateTime<Utc>,
    ) -> Result<TaxLot, LedgerError> {
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::InvalidQuantity(quantity));
        }
        if unit_price < Decimal::ZERO {
            return Err(LedgerError::InvalidPrice(unit_price));
        }

        let mut conn = self.db.pool().acquire().await?;
        let lot = store::insert_lot(&mut *conn, owner_id, asset_id, quantity, unit_price, acquired_at).await?;

        tracing::debug!(
            "Added lot {} for {}/{}: {} @ {}",
            lot.id,
            owner_id,
            asset_id,
            quantity,
            unit_price
        );
        Ok(lot)
    }

    /// Fetch one lot by id, any status.
    pub async fn get_lot(&self, lot_id: i64) -> Result<TaxLot, LedgerError> {
        let mut conn = self.db.pool().acquire().await?;
        store::fetch_lot(&mut *conn, lot_id)
            .await?
            .ok_or(LedgerError::LotNotFound(lot_id))
    }

    /// All open lots of one (owner, asset) pair, oldest acquisition first.
    pub async fn open_lots(&self, owner_id: &str, asset_id: &str) -> Result<Vec<TaxLot>, LedgerError> {
        let mut conn = self.db.pool().acquire().await?;
        store::fetch_open_lots(&mut *conn, owner_id, asset_id).await
    }

    /// Assets an owner currently holds open lots in.
    pub async fn held_assets(&self, owner_id: &str) -> Result<Vec<String>, LedgerError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT asset_id FROM tax_lots WHERE owner_id = ? AND status = 'open' ORDER BY asset_id",
        )
        .bind(owner_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|(asset,)| asset).collect())
    }

    /// Total open quantity for one (owner, asset) pair.
    pub async fn open_quantity(&self, owner_id: &str, asset_id: &str) -> Result<Decimal, LedgerError> {
        Ok(self
            .open_lots(owner_id, asset_id)
            .await?
            .iter()
            .map(|l| l.quantity)
            .sum())
    }

    /// Open lots ordered the way a disposal under `method` would consume them.
    pub async fn lots_ordered_by(
        &self,
        owner_id: &str,
        asset_id: &str,
        method: &SelectionMethod,
    ) -> Result<Vec<TaxLot>, LedgerError> {
        let open = self.open_lots(owner_id, asset_id).await?;
        order_lots(open, method)
    }

    /// Unrealized position of one open lot against a supplied price. Closed
    /// and harvested lots are stale references and report [`LedgerError::LotNotOpen`].
    pub async fn unrealized_gain_loss(
        &self,
        lot_id: i64,
        current_price: Decimal,
    ) -> Result<UnrealizedReport, LedgerError> {
        if current_price < Decimal::ZERO {
            return Err(LedgerError::InvalidPrice(current_price));
        }

        let lot = self.get_lot(lot_id).await?;
        if lot.status != LotStatus::Open {
            return Err(LedgerError::LotNotOpen {
                lot_id,
                status: lot.status,
            });
        }

        let gain_loss = lot.unrealized_gain_loss(current_price);
        let gain_loss_percent = if lot.cost_basis.is_zero() {
            Decimal::ZERO
        } else {
            gain_loss / lot.cost_basis * Decimal::ONE_HUNDRED
        };
        let days_held = lot.days_held(Utc::now());
        let is_long_term = days_held > LONG_TERM_THRESHOLD_DAYS;

        Ok(UnrealizedReport {
            lot_id,
            gain_loss,
            gain_loss_percent,
            days_held,
            is_long_term,
            days_until_long_term: if is_long_term {
                None
            } else {
                Some(LONG_TERM_THRESHOLD_DAYS + 1 - days_held)
            },
        })
    }

    /// Dispose `units_to_close` across the pair's open lots, consuming them in
    /// the order `method` dictates. All-or-nothing: on any failure no lot
    /// changes. A lot consumed only partially is split, with the closed
    /// portion appended as its own row keeping the original acquisition data.
    pub async fn close_lots(
        &self,
        owner_id: &str,
        asset_id: &str,
        units_to_close: Decimal,
        disposal_unit_price: Decimal,
        method: &SelectionMethod,
    ) -> Result<LotCloseOutcome, LedgerError> {
        if units_to_close <= Decimal::ZERO {
            return Err(LedgerError::InvalidQuantity(units_to_close));
        }
        if disposal_unit_price < Decimal::ZERO {
            return Err(LedgerError::InvalidPrice(disposal_unit_price));
        }
        if let SelectionMethod::SpecificId(ids) = method {
            if ids.is_empty() {
                return Err(LedgerError::InvalidCloseRequest(
                    "specific-id close names no lots".to_string(),
                ));
            }
            let mut seen = HashSet::with_capacity(ids.len());
            for id in ids {
                if !seen.insert(*id) {
                    return Err(LedgerError::InvalidCloseRequest(format!(
                        "lot {id} named more than once"
                    )));
                }
            }
        }

        // Serialize disposals per pair: two concurrent closes reading the
        // same snapshot could both conclude they have enough open quantity.
        let lock = self.db.pair_lock(owner_id, asset_id);
        let _guard = lock.lock().await;

        let mut tx = self.db.pool().begin().await?;

        let open = store::fetch_open_lots(&mut *tx, owner_id, asset_id).await?;
        let available: Decimal = open.iter().map(|l| l.quantity).sum();
        if available < units_to_close {
            return Err(LedgerError::InsufficientOpenQuantity {
                owner: owner_id.to_string(),
                asset: asset_id.to_string(),
                requested: units_to_close,
                available,
            });
        }

        let ordered = match order_lots(open, method) {
            Ok(lots) => lots,
            Err(LedgerError::LotNotFound(missing)) if matches!(method, SelectionMethod::SpecificId(_)) => {
                return Err(diagnose_unavailable_lot(&mut *tx, missing, owner_id, asset_id).await?);
            }
            Err(e) => return Err(e),
        };

        // Specific-id requests must cover the units from the named lots alone.
        if matches!(method, SelectionMethod::SpecificId(_)) {
            let selected: Decimal = ordered.iter().map(|l| l.quantity).sum();
            if selected < units_to_close {
                return Err(LedgerError::InsufficientOpenQuantity {
                    owner: owner_id.to_string(),
                    asset: asset_id.to_string(),
                    requested: units_to_close,
                    available: selected,
                });
            }
        }

        let batch_id = Uuid::new_v4().to_string();
        let disposed_at = Utc::now();
        let mut remaining = units_to_close;
        let mut realized_total = Decimal::ZERO;
        let mut closed = Vec::new();

        for lot in ordered {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(lot.quantity);
            let is_long_term = lot.held_long_term(disposed_at);

            if take == lot.quantity {
                let realized = take * disposal_unit_price - lot.cost_basis;
                let updated = store::mark_disposed(
                    &mut *tx,
                    lot.id,
                    LotStatus::Closed,
                    disposal_unit_price,
                    disposed_at,
                    realized,
                    is_long_term,
                    &batch_id,
                )
                .await?
                .ok_or(LedgerError::StateChanged(lot.id))?;
                realized_total += realized;
                closed.push(ClosedLot {
                    lot: updated,
                    source_lot_id: lot.id,
                    split: false,
                });
            } else {
                let portion = store::split_and_dispose(
                    &mut *tx,
                    &lot,
                    take,
                    LotStatus::Closed,
                    disposal_unit_price,
                    disposed_at,
                    is_long_term,
                    &batch_id,
                )
                .await?;
                realized_total += portion.realized_gain_loss.unwrap_or_default();
                closed.push(ClosedLot {
                    lot: portion,
                    source_lot_id: lot.id,
                    split: true,
                });
            }

            remaining -= take;
        }

        tx.commit().await?;

        tracing::info!(
            "Closed {} units of {}/{} across {} lots, realized {}",
            units_to_close,
            owner_id,
            asset_id,
            closed.len(),
            realized_total
        );

        Ok(LotCloseOutcome {
            owner_id: owner_id.to_string(),
            asset_id: asset_id.to_string(),
            batch_id,
            units_closed: units_to_close,
            disposal_unit_price,
            realized_gain_loss: realized_total,
            closed,
        })
    }
}

/// Turn a specific-id miss into the most precise error the table supports:
/// unknown id, wrong pair, or a lot that already reached a terminal status.
async fn diagnose_unavailable_lot(
    conn: &mut SqliteConnection,
    lot_id: i64,
    owner_id: &str,
    asset_id: &str,
) -> Result<LedgerError, LedgerError> {
    match store::fetch_lot(conn, lot_id).await? {
        None => Ok(LedgerError::LotNotFound(lot_id)),
        Some(lot) if lot.owner_id != owner_id || lot.asset_id != asset_id => {
            Ok(LedgerError::LotMismatch {
                lot_id,
                owner: owner_id.to_string(),
                asset: asset_id.to_string(),
            })
        }
        Some(lot) if lot.status != LotStatus::Open => Ok(LedgerError::LotNotOpen {
            lot_id,
            status: lot.status,
        }),
        Some(_) => Ok(LedgerError::LotNotFound(lot_id)),
    }
}
