#[cfg(test)]
mod harvest_engine_tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use lot_ledger::{LedgerDb, LotLedger, LotStatus};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use crate::collaborators::{
        AcquisitionEvent, CorrelationEntry, CorrelationSource, PriceFeed, PriceQuote,
        TaxProfileLookup, TransactionHistory,
    };
    use crate::config::HarvestConfig;
    use crate::executor::HarvestExecutor;
    use crate::models::{ExecutionStatus, OpportunityStatus};
    use crate::scanner::{scan_summary, OpportunityScanner};

    struct StaticPrices {
        prices: HashMap<String, Decimal>,
        slow_asset: Option<String>,
    }

    impl StaticPrices {
        fn new(pairs: &[(&str, Decimal)]) -> Self {
            Self {
                prices: pairs.iter().map(|(a, p)| (a.to_string(), *p)).collect(),
                slow_asset: None,
            }
        }
    }

    #[async_trait]
    impl PriceFeed for StaticPrices {
        async fn quote(&self, asset_id: &str) -> anyhow::Result<PriceQuote> {
            if self.slow_asset.as_deref() == Some(asset_id) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let price = self
                .prices
                .get(asset_id)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no quote for {asset_id}"))?;
            Ok(PriceQuote {
                asset_id: asset_id.to_string(),
                price,
                as_of: Utc::now(),
            })
        }
    }

    struct FlatTaxProfile(Option<Decimal>);

    #[async_trait]
    impl TaxProfileLookup for FlatTaxProfile {
        async fn short_term_rate(&self, _owner_id: &str) -> anyhow::Result<Option<Decimal>> {
            Ok(self.0)
        }
    }

    struct RecordedHistory(Vec<AcquisitionEvent>);

    #[async_trait]
    impl TransactionHistory for RecordedHistory {
        async fn acquisitions_between(
            &self,
            _owner_id: &str,
            asset_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> anyhow::Result<Vec<AcquisitionEvent>> {
            Ok(self
                .0
                .iter()
                .filter(|e| e.asset_id == asset_id && e.occurred_at >= from && e.occurred_at <= to)
                .cloned()
                .collect())
        }
    }

    struct StaticCorrelations(Vec<CorrelationEntry>);

    #[async_trait]
    impl CorrelationSource for StaticCorrelations {
        async fn correlations_for(&self, base_asset: &str) -> anyhow::Result<Vec<CorrelationEntry>> {
            Ok(self
                .0
                .iter()
                .filter(|e| e.base_asset == base_asset)
                .cloned()
                .collect())
        }
    }

    fn vti_correlations() -> StaticCorrelations {
        StaticCorrelations(vec![
            CorrelationEntry {
                base_asset: "VTI".to_string(),
                proxy_asset: "ITOT".to_string(),
                coefficient: 0.99,
            },
            CorrelationEntry {
                base_asset: "VTI".to_string(),
                proxy_asset: "SCHB".to_string(),
                coefficient: 0.97,
            },
        ])
    }

    struct EngineFixture {
        ledger: LotLedger,
        scanner: OpportunityScanner,
        executor: HarvestExecutor,
    }

    async fn setup_engine(
        prices: StaticPrices,
        rate: Option<Decimal>,
        history: RecordedHistory,
    ) -> EngineFixture {
        // Shared cache keeps every pooled connection on one in-memory
        // database; a distinct name isolates concurrent tests.
        let url = format!("sqlite:file:{}?mode=memory&cache=shared", Uuid::new_v4());
        let db = LedgerDb::new(&url).await.unwrap();
        let ledger = LotLedger::new(db);
        let price_feed = Arc::new(prices);
        let tax_profiles = Arc::new(FlatTaxProfile(rate));
        let config = HarvestConfig {
            collaborator_timeout: Duration::from_millis(50),
            ..HarvestConfig::default()
        };

        let scanner = OpportunityScanner::new(
            ledger.clone(),
            price_feed.clone(),
            tax_profiles.clone(),
            Arc::new(history),
            Arc::new(vti_correlations()),
            config.clone(),
        );
        let executor = HarvestExecutor::new(ledger.clone(), price_feed, tax_profiles, config);

        EngineFixture {
            ledger,
            scanner,
            executor,
        }
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::days(days)
    }

    /// Owner holds one asset with a winning lot and a losing lot. Only the
    /// losing lot's shortfall qualifies, priced at the flat default rate.
    #[tokio::test]
    async fn scan_detects_only_the_losing_lot() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(60), dec!(35), days_ago(200))
            .await
            .unwrap();
        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();

        assert_eq!(opportunities.len(), 1);
        let opp = &opportunities[0];
        assert_eq!(opp.asset_id, "VTI");
        assert_eq!(opp.total_loss, dec!(1600));
        assert_eq!(opp.eligible_lots, 1);
        assert_eq!(opp.estimated_tax_savings, dec!(560));
        // 560 - (1600 * 0.002 + 10)
        assert_eq!(opp.net_benefit, dec!(546.8));
        assert_eq!(opp.status, OpportunityStatus::Pending);
        assert_eq!(opp.proxy_asset_id.as_deref(), Some("ITOT"));
        assert_eq!(opp.proxy_correlation, Some(0.99));

        let summary = scan_summary(&opportunities);
        assert_eq!(summary.total_opportunities, 1);
        assert_eq!(summary.total_harvestable_loss, dec!(1600));
        assert_eq!(summary.with_proxy, 1);
    }

    #[tokio::test]
    async fn rescan_refreshes_the_pending_row_in_place() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let first = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();

        assert_eq!(first[0].id, second[0].id);
        assert!(second[0].last_detected_at > first[0].last_detected_at);
        assert_eq!(first[0].created_at, second[0].created_at);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM harvest_opportunities")
            .fetch_one(fixture.ledger.db().pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn scan_excludes_asset_with_wash_sale_risk() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![AcquisitionEvent {
                asset_id: "VTI".to_string(),
                quantity: dec!(5),
                occurred_at: days_ago(10),
            }]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        assert!(opportunities.is_empty());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM harvest_opportunities")
            .fetch_one(fixture.ledger.db().pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn scan_skips_losses_below_threshold() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(79))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        // 40 units down 1 each: loss 40, threshold 100.
        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        assert!(opportunities.is_empty());
    }

    #[tokio::test]
    async fn scan_survives_one_asset_without_quotes() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();
        // BND has no quote; its evaluation fails and is skipped.
        fixture
            .ledger
            .add_lot("owner-1", "BND", dec!(10), dec!(70), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].asset_id, "VTI");
    }

    #[tokio::test]
    async fn scan_times_out_slow_price_feeds() {
        let mut prices = StaticPrices::new(&[("VTI", dec!(40)), ("BND", dec!(50))]);
        prices.slow_asset = Some("VTI".to_string());
        let fixture = setup_engine(prices, None, RecordedHistory(vec![])).await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();
        fixture
            .ledger
            .add_lot("owner-1", "BND", dec!(20), dec!(70), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].asset_id, "BND");
        assert_eq!(opportunities[0].total_loss, dec!(400));
    }

    #[tokio::test]
    async fn scan_ranks_by_net_benefit() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40)), ("BND", dec!(50))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "BND", dec!(20), dec!(70), days_ago(100))
            .await
            .unwrap();
        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        let assets: Vec<&str> = opportunities.iter().map(|o| o.asset_id.as_str()).collect();
        assert_eq!(assets, vec!["VTI", "BND"]);
    }

    #[tokio::test]
    async fn scan_records_opportunity_without_proxy() {
        let fixture = setup_engine(
            StaticPrices::new(&[("BND", dec!(50))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "BND", dec!(20), dec!(70), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        assert_eq!(opportunities.len(), 1);
        assert!(opportunities[0].proxy_asset_id.is_none());
        assert!(opportunities[0].proxy_correlation.is_none());
    }

    #[tokio::test]
    async fn scan_uses_profile_rate_when_present() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            Some(dec!(0.24)),
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let opportunities = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        assert_eq!(opportunities[0].estimated_tax_savings, dec!(384));
    }

    #[tokio::test]
    async fn dismissed_opportunity_clears_the_way_for_rescans() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let first = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        fixture
            .scanner
            .dismiss_opportunity(first[0].id)
            .await
            .unwrap();

        assert!(fixture
            .scanner
            .pending_opportunities("owner-1")
            .await
            .unwrap()
            .is_empty());
        assert!(fixture.scanner.dismiss_opportunity(first[0].id).await.is_err());

        let second = fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();
        assert_ne!(second[0].id, first[0].id);
        assert_eq!(second[0].status, OpportunityStatus::Pending);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM harvest_opportunities")
            .fetch_one(fixture.ledger.db().pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn execute_harvest_closes_lots_and_flips_the_opportunity() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(60), dec!(35), days_ago(200))
            .await
            .unwrap();
        let loser = fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        fixture
            .scanner
            .scan_for_opportunities("owner-1", dec!(100))
            .await
            .unwrap();

        let record = fixture
            .executor
            .execute_harvest("owner-1", "VTI", &[loser.id])
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.total_loss, dec!(1600));
        assert_eq!(record.estimated_tax_savings, dec!(560));
        assert!(record.error.is_none());

        let harvested = fixture.ledger.get_lot(loser.id).await.unwrap();
        assert_eq!(harvested.status, LotStatus::Harvested);
        assert_eq!(harvested.batch_id.as_deref(), Some(record.batch_id.as_str()));
        assert_eq!(harvested.realized_gain_loss, Some(dec!(-1600)));
        assert_eq!(harvested.is_long_term, Some(false));

        let (status,): (String,) = sqlx::query_as(
            "SELECT status FROM harvest_opportunities WHERE owner_id = ? AND asset_id = ?",
        )
        .bind("owner-1")
        .bind("VTI")
        .fetch_one(fixture.ledger.db().pool())
        .await
        .unwrap();
        assert_eq!(status, "executed");

        let history = fixture.executor.execution_history("owner-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].batch_id, record.batch_id);
        assert_eq!(history[0].lot_ids, vec![loser.id]);
    }

    #[tokio::test]
    async fn execute_harvest_rolls_back_the_whole_batch_on_a_stale_id() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        let good = fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let record = fixture
            .executor
            .execute_harvest("owner-1", "VTI", &[good.id, 9999])
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("9999"));
        assert_eq!(record.total_loss, dec!(0));

        // The batch member named before the stale id must be untouched.
        let untouched = fixture.ledger.get_lot(good.id).await.unwrap();
        assert_eq!(untouched.status, LotStatus::Open);
        assert!(untouched.batch_id.is_none());

        let history = fixture.executor.execution_history("owner-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn execute_harvest_records_a_dead_price_feed() {
        let fixture = setup_engine(StaticPrices::new(&[]), None, RecordedHistory(vec![])).await;

        let lot = fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(40), dec!(80), days_ago(100))
            .await
            .unwrap();

        let record = fixture
            .executor
            .execute_harvest("owner-1", "VTI", &[lot.id])
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("Price read failed"));

        let untouched = fixture.ledger.get_lot(lot.id).await.unwrap();
        assert_eq!(untouched.status, LotStatus::Open);
    }

    #[tokio::test]
    async fn execute_harvest_rejects_an_empty_batch() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        assert!(fixture
            .executor
            .execute_harvest("owner-1", "VTI", &[])
            .await
            .is_err());
        assert!(fixture
            .executor
            .execution_history("owner-1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn execute_harvest_rejects_a_batch_naming_a_lot_twice() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(40))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;
        let lot = fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(10), dec!(60), days_ago(100))
            .await
            .unwrap();

        let err = fixture
            .executor
            .execute_harvest("owner-1", "VTI", &[lot.id, lot.id])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));

        // Malformed input never reaches the table: no record, lot untouched.
        assert!(fixture
            .executor
            .execution_history("owner-1")
            .await
            .unwrap()
            .is_empty());
        let lot = fixture.ledger.get_lot(lot.id).await.unwrap();
        assert_eq!(lot.status, LotStatus::Open);
    }

    #[tokio::test]
    async fn harvest_netting_a_gain_saves_nothing() {
        let fixture = setup_engine(
            StaticPrices::new(&[("VTI", dec!(15))]),
            None,
            RecordedHistory(vec![]),
        )
        .await;

        let winner = fixture
            .ledger
            .add_lot("owner-1", "VTI", dec!(10), dec!(10), days_ago(100))
            .await
            .unwrap();

        let record = fixture
            .executor
            .execute_harvest("owner-1", "VTI", &[winner.id])
            .await
            .unwrap();

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.total_loss, dec!(-50));
        assert_eq!(record.estimated_tax_savings, dec!(0));
    }
}
