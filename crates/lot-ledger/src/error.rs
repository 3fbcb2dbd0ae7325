use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::LotStatus;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid quantity {0}: must be positive")]
    InvalidQuantity(Decimal),

    #[error("Invalid price {0}: must not be negative")]
    InvalidPrice(Decimal),

    #[error("Invalid close request: {0}")]
    InvalidCloseRequest(String),

    #[error("Lot {0} not found")]
    LotNotFound(i64),

    #[error("Lot {lot_id} is {status}, expected open")]
    LotNotOpen { lot_id: i64, status: LotStatus },

    #[error("Lot {lot_id} does not belong to {owner}/{asset}")]
    LotMismatch {
        lot_id: i64,
        owner: String,
        asset: String,
    },

    #[error("Insufficient open quantity for {owner}/{asset}: requested {requested}, available {available}")]
    InsufficientOpenQuantity {
        owner: String,
        asset: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Lot {0} changed state mid-transaction")]
    StateChanged(i64),

    #[error("Corrupt lot record {lot_id}: {detail}")]
    CorruptRecord { lot_id: i64, detail: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
