//! Row-level operations on the tax_lots table.
//!
//! Everything here runs on a caller-supplied connection so a disposal's
//! reads and writes share one transaction. Mutating functions expect the
//! caller to hold the pair lock from [`crate::LedgerDb::pair_lock`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;

use crate::error::LedgerError;
use crate::models::{LotRow, LotStatus, TaxLot};

/// Insert a fresh open lot. Cost basis is quantity times unit price.
pub async fn insert_lot(
    conn: &mut SqliteConnection,
    owner_id: &str,
    asset_id: &str,
    quantity: Decimal,
    unit_price: Decimal,
    acquired_at: DateTime<Utc>,
) -> Result<TaxLot, LedgerError> {
    let cost_basis = quantity * unit_price;
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO tax_lots (owner_id, asset_id, quantity, unit_price, cost_basis, status, acquired_at)
        VALUES (?, ?, ?, ?, ?, 'open', ?)
        RETURNING id
        "#,
    )
    .bind(owner_id)
    .bind(asset_id)
    .bind(quantity.to_string())
    .bind(unit_price.to_string())
    .bind(cost_basis.to_string())
    .bind(acquired_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(TaxLot {
        id,
        owner_id: owner_id.to_string(),
        asset_id: asset_id.to_string(),
        quantity,
        unit_price,
        cost_basis,
        status: LotStatus::Open,
        acquired_at,
        disposed_at: None,
        disposal_unit_price: None,
        realized_gain_loss: None,
        is_long_term: None,
        batch_id: None,
    })
}

/// Fetch one lot by id, any status.
pub async fn fetch_lot(
    conn: &mut SqliteConnection,
    lot_id: i64,
) -> Result<Option<TaxLot>, LedgerError> {
    let row: Option<LotRow> = sqlx::query_as("SELECT * FROM tax_lots WHERE id = ?")
        .bind(lot_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(TaxLot::try_from).transpose()
}

/// All open lots of one (owner, asset) pair, oldest acquisition first.
pub async fn fetch_open_lots(
    conn: &mut SqliteConnection,
    owner_id: &str,
    asset_id: &str,
) -> Result<Vec<TaxLot>, LedgerError> {
    let rows: Vec<LotRow> = sqlx::query_as(
        "SELECT * FROM tax_lots WHERE owner_id = ? AND asset_id = ? AND status = 'open' ORDER BY acquired_at, id",
    )
    .bind(owner_id)
    .bind(asset_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(TaxLot::try_from).collect()
}

/// Move an open lot to a terminal status and stamp its disposal fields.
/// Returns None when the row is missing or no longer open; callers decide
/// whether that means a stale id or a mid-transaction state change.
#[allow(clippy::too_many_arguments)]
pub async fn mark_disposed(
    conn: &mut SqliteConnection,
    lot_id: i64,
    status: LotStatus,
    disposal_price: Decimal,
    disposed_at: DateTime<Utc>,
    realized_gain_loss: Decimal,
    is_long_term: bool,
    batch_id: &str,
) -> Result<Option<TaxLot>, LedgerError> {
    let row: Option<LotRow> = sqlx::query_as(
        r#"
        UPDATE tax_lots
        SET status = ?, disposed_at = ?, disposal_unit_price = ?, realized_gain_loss = ?,
            is_long_term = ?, batch_id = ?
        WHERE id = ? AND status = 'open'
        RETURNING *
        "#,
    )
    .bind(status.as_str())
    .bind(disposed_at)
    .bind(disposal_price.to_string())
    .bind(realized_gain_loss.to_string())
    .bind(is_long_term)
    .bind(batch_id)
    .bind(lot_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(TaxLot::try_from).transpose()
}

/// Partially dispose `close_quantity` out of `source` (strictly less than its
/// quantity): the closed portion is appended as a new terminal row keeping the
/// original acquisition time and unit price, and the source lot shrinks by
/// exactly that quantity and basis. Returns the appended row.
#[allow(clippy::too_many_arguments)]
pub async fn split_and_dispose(
    conn: &mut SqliteConnection,
    source: &TaxLot,
    close_quantity: Decimal,
    status: LotStatus,
    disposal_price: Decimal,
    disposed_at: DateTime<Utc>,
    is_long_term: bool,
    batch_id: &str,
) -> Result<TaxLot, LedgerError> {
    let closed_basis = close_quantity * source.unit_price;
    let realized = close_quantity * disposal_price - closed_basis;

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO tax_lots (owner_id, asset_id, quantity, unit_price, cost_basis, status,
                              acquired_at, disposed_at, disposal_unit_price, realized_gain_loss,
                              is_long_term, batch_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&source.owner_id)
    .bind(&source.asset_id)
    .bind(close_quantity.to_string())
    .bind(source.unit_price.to_string())
    .bind(closed_basis.to_string())
    .bind(status.as_str())
    .bind(source.acquired_at)
    .bind(disposed_at)
    .bind(disposal_price.to_string())
    .bind(realized.to_string())
    .bind(is_long_term)
    .bind(batch_id)
    .fetch_one(&mut *conn)
    .await?;

    let remaining = source.quantity - close_quantity;
    let remaining_basis = source.cost_basis - closed_basis;
    let updated = sqlx::query(
        "UPDATE tax_lots SET quantity = ?, cost_basis = ? WHERE id = ? AND status = 'open'",
    )
    .bind(remaining.to_string())
    .bind(remaining_basis.to_string())
    .bind(source.id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() != 1 {
        return Err(LedgerError::StateChanged(source.id));
    }

    Ok(TaxLot {
        id,
        owner_id: source.owner_id.clone(),
        asset_id: source.asset_id.clone(),
        quantity: close_quantity,
        unit_price: source.unit_price,
        cost_basis: closed_basis,
        status,
        acquired_at: source.acquired_at,
        disposed_at: Some(disposed_at),
        disposal_unit_price: Some(disposal_price),
        realized_gain_loss: Some(realized),
        is_long_term: Some(is_long_term),
        batch_id: Some(batch_id.to_string()),
    })
}
