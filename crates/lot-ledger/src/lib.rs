//! Lot Ledger
//!
//! System of record for tax lots. Tracks the open/closed/harvested lifecycle
//! per (owner, asset) pair, splits lots on partial disposal, and exposes the
//! pure selection orderings (HIFO, FIFO, specific-id) used to decide which
//! lots a disposal consumes.

pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod selector;
pub mod store;

pub use db::LedgerDb;
pub use error::LedgerError;
pub use ledger::{ClosedLot, LotCloseOutcome, LotLedger};
pub use models::{LotStatus, TaxLot, UnrealizedReport, LONG_TERM_THRESHOLD_DAYS};
pub use selector::{order_lots, SelectionMethod};
