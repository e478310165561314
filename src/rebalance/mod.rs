pub mod memory;
pub mod models;
pub mod repository;

pub use memory::InMemoryRebalanceStore;
pub use models::*;
pub use repository::{PgRebalanceStore, RebalanceStore};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, PlanningError};
    use crate::ledger::{BalanceKey, TokenAddress};
    use crate::providers::{QuoteToken, RebalanceQuote, Strategy};
    use alloy_primitives::{Address, U256};
    use rust_decimal_macros::dec;

    fn token(chain_id: u64, byte: u8) -> QuoteToken {
        QuoteToken {
            chain_id,
            token: TokenAddress::Token(Address::repeat_byte(byte)),
            decimals: 6,
            symbol: "USDC".to_string(),
            balance: U256::from(1_000u64),
            target_balance: U256::from(500u64),
        }
    }

    fn quote(amount_in: u64, amount_out: u64) -> RebalanceQuote {
        RebalanceQuote {
            id: None,
            token_in: token(10, 0xaa),
            token_out: token(8453, 0xbb),
            amount_in: U256::from(amount_in),
            amount_out: U256::from(amount_out),
            slippage: dec!(0.01),
            strategy: Strategy::LiFi,
            context: serde_json::json!({}),
        }
    }

    fn wallet() -> Address {
        Address::repeat_byte(0x11)
    }

    #[tokio::test]
    async fn test_batch_shares_group_and_reserves() {
        let store = InMemoryRebalanceStore::new();
        let records = store
            .create_batch(wallet(), &[quote(100, 99), quote(50, 49)], None)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        let group = records[0].group_id.clone().unwrap();
        assert_eq!(records[1].group_id.as_deref(), Some(group.as_str()));
        assert!(records.iter().all(|r| r.status == RebalanceStatus::Pending));

        let reserved = store.pending_reserved(wallet()).await.unwrap();
        let key = BalanceKey::new(10, Address::repeat_byte(0xaa));
        assert_eq!(reserved.get(&key), Some(&U256::from(150u64)));
        assert_eq!(
            key.to_string(),
            format!("10:{}", Address::repeat_byte(0xaa).to_string().to_lowercase())
        );

        let incoming = store.pending_incoming(wallet()).await.unwrap();
        let out_key = BalanceKey::new(8453, Address::repeat_byte(0xbb));
        assert_eq!(incoming.get(&out_key), Some(&U256::from(148u64)));

        assert!(store
            .pending_reserved(Address::repeat_byte(0x22))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_keeps_successes() {
        let store = InMemoryRebalanceStore::new();
        store.fail_next_inserts(1);

        let err = store
            .create_batch(
                wallet(),
                &[quote(1, 1), quote(2, 2), quote(3, 3)],
                Some("g-1".to_string()),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Planning(PlanningError::BatchPersist { failed: 1, total: 3 })
        ));
        assert_eq!(err.to_string(), "Planning error: 1 out of 3 rebalances failed to persist");
        assert_eq!(store.find_by_group("g-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_records_are_immutable() {
        let store = InMemoryRebalanceStore::new();
        let record = store
            .create(CreateRebalance::from_quote(wallet(), &quote(100, 99), None))
            .await
            .unwrap();
        let job = record.rebalance_job_id.clone();

        let done = store
            .update_status(&job, RebalanceStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.status, RebalanceStatus::Completed);

        // Redelivery of the same outcome is tolerated
        assert!(store
            .update_status(&job, RebalanceStatus::Completed)
            .await
            .is_ok());
        assert!(matches!(
            store.update_status(&job, RebalanceStatus::Failed).await,
            Err(AppError::Planning(PlanningError::TerminalRecord(_)))
        ));
        assert!(matches!(
            store.update_status("missing", RebalanceStatus::Failed).await,
            Err(AppError::NotFound(_))
        ));

        assert!(store.pending_reserved(wallet()).await.unwrap().is_empty());
        assert_eq!(store.recent_success_count(60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_group_only_touches_pending() {
        let store = InMemoryRebalanceStore::new();
        let records = store
            .create_batch(wallet(), &[quote(1, 1), quote(2, 2)], Some("g-2".to_string()))
            .await
            .unwrap();
        store
            .update_status(&records[0].rebalance_job_id, RebalanceStatus::Completed)
            .await
            .unwrap();

        assert_eq!(store.cancel_group("g-2").await.unwrap(), 1);
        let statuses: Vec<RebalanceStatus> = store
            .find_by_group("g-2")
            .await
            .unwrap()
            .iter()
            .map(|r| r.status)
            .collect();
        assert!(statuses.contains(&RebalanceStatus::Completed));
        assert!(statuses.contains(&RebalanceStatus::Failed));
    }

    #[tokio::test]
    async fn test_insert_record_preserves_given_record() {
        let store = InMemoryRebalanceStore::new();
        let mut record = RebalanceRecord::pending(CreateRebalance::from_quote(
            wallet(),
            &quote(5, 4),
            None,
        ));
        record.rebalance_job_id = "job-42".to_string();
        let stored = store.insert_record(&record).await.unwrap();
        assert_eq!(stored, record);
        assert!(store.insert_record(&record).await.is_err());
        assert_eq!(stored.to_quote().id.as_deref(), Some("job-42"));
    }

    #[test]
    fn test_zero_amounts_do_not_reserve() {
        let key = BalanceKey::native(1);
        let totals = sum_by_key([(key, U256::ZERO), (key, U256::from(7u64))]);
        assert_eq!(totals.get(&key), Some(&U256::from(7u64)));
        assert!(sum_by_key([(key, U256::ZERO)]).is_empty());
    }
}
