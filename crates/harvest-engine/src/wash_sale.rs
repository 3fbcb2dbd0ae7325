//! Wash-sale risk detection.
//!
//! One concrete rule: a loss on an asset is at risk when any acquisition of
//! that same asset falls within the configured window of calendar days before
//! or after the prospective disposal, bounds inclusive. Statutes extend the
//! rule to "substantially identical" instruments; deciding what counts as
//! identical belongs to whoever implements the history collaborator, and the
//! substitutes the proxy finder recommends are expected to stay clear of it.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::collaborators::TransactionHistory;

pub struct WashSaleGuard {
    history: Arc<dyn TransactionHistory>,
    window_days: i64,
}

impl WashSaleGuard {
    pub fn new(history: Arc<dyn TransactionHistory>, window_days: i64) -> Self {
        Self {
            history,
            window_days,
        }
    }

    /// Whether realizing a loss on (owner, asset) at `proposed_disposal`
    /// would be disallowed by a nearby acquisition. Read-only; an at-risk
    /// asset is an eligibility exclusion for this pass, not a fault.
    pub async fn check_wash_sale_risk(
        &self,
        owner_id: &str,
        asset_id: &str,
        proposed_disposal: DateTime<Utc>,
    ) -> Result<bool> {
        let window = Duration::days(self.window_days);
        let events = self
            .history
            .acquisitions_between(
                owner_id,
                asset_id,
                proposed_disposal - window,
                proposed_disposal + window,
            )
            .await?;

        // Recheck in day granularity rather than trusting the collaborator's
        // range filtering.
        let risky = events
            .iter()
            .any(|e| (e.occurred_at - proposed_disposal).num_days().abs() <= self.window_days);

        if risky {
            tracing::debug!(
                "Wash-sale risk for {}/{}: acquisition within {} days of {}",
                owner_id,
                asset_id,
                self.window_days,
                proposed_disposal
            );
        }

        Ok(risky)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::collaborators::AcquisitionEvent;

    struct StubHistory {
        events: Vec<AcquisitionEvent>,
    }

    #[async_trait]
    impl TransactionHistory for StubHistory {
        async fn acquisitions_between(
            &self,
            _owner_id: &str,
            asset_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<AcquisitionEvent>> {
            Ok(self
                .events
                .iter()
                .filter(|e| e.asset_id == asset_id && e.occurred_at >= from && e.occurred_at <= to)
                .cloned()
                .collect())
        }
    }

    fn guard_with_event(occurred_at: DateTime<Utc>) -> WashSaleGuard {
        let history = StubHistory {
            events: vec![AcquisitionEvent {
                asset_id: "VTI".to_string(),
                quantity: dec!(10),
                occurred_at,
            }],
        };
        WashSaleGuard::new(Arc::new(history), 30)
    }

    #[tokio::test]
    async fn test_acquisition_before_disposal_is_risky() {
        let disposal = Utc::now();
        let guard = guard_with_event(disposal - Duration::days(10));
        assert!(guard
            .check_wash_sale_risk("owner-1", "VTI", disposal)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_acquisition_after_disposal_is_risky() {
        let disposal = Utc::now();
        let guard = guard_with_event(disposal + Duration::days(10));
        assert!(guard
            .check_wash_sale_risk("owner-1", "VTI", disposal)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_window_bound_is_inclusive() {
        let disposal = Utc::now();
        let guard = guard_with_event(disposal - Duration::days(30));
        assert!(guard
            .check_wash_sale_risk("owner-1", "VTI", disposal)
            .await
            .unwrap());

        let guard = guard_with_event(disposal + Duration::days(30));
        assert!(guard
            .check_wash_sale_risk("owner-1", "VTI", disposal)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_outside_window_is_clear() {
        let disposal = Utc::now();
        let guard = guard_with_event(disposal - Duration::days(40));
        assert!(!guard
            .check_wash_sale_risk("owner-1", "VTI", disposal)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_other_asset_does_not_taint() {
        let disposal = Utc::now();
        let guard = guard_with_event(disposal - Duration::days(10));
        assert!(!guard
            .check_wash_sale_risk("owner-1", "VXUS", disposal)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_no_history_is_clear() {
        let guard = WashSaleGuard::new(Arc::new(StubHistory { events: vec![] }), 30);
        assert!(!guard
            .check_wash_sale_risk("owner-1", "VTI", Utc::now())
            .await
            .unwrap());
    }
}
