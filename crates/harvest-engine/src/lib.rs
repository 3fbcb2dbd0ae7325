//! Harvest Engine
//!
//! Scans per-owner holdings for harvestable unrealized losses and executes
//! chosen batches against the lot ledger. Wash-sale guarding, correlated
//! substitute lookup and net-benefit gating decide what qualifies; the
//! executor makes the batch atomic.

pub mod collaborators;
pub mod config;
pub mod executor;
pub mod models;
pub mod net_benefit;
pub mod proxy;
pub mod scanner;
pub mod wash_sale;

#[cfg(test)]
mod tests;

pub use collaborators::{
    AcquisitionEvent, CorrelationEntry, CorrelationSource, PriceFeed, PriceQuote, TaxProfileLookup,
    TransactionHistory,
};
pub use config::{CostAssumptions, HarvestConfig};
pub use executor::HarvestExecutor;
pub use models::{
    ExecutionStatus, HarvestExecutionRecord, HarvestOpportunity, OpportunityStatus,
};
pub use net_benefit::{calculate_net_benefit, NetBenefit};
pub use proxy::{ProxyAsset, ProxyFinder};
pub use scanner::{scan_summary, OpportunityScanner, ScanSummary};
pub use wash_sale::WashSaleGuard;
