use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use shine_core::{Contract, Invoice};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{sort_and_limit, ContractFilter, InvoiceFilter, Record, Store, StoreError};

/// Process-local store used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contracts: Mutex<Table<Contract>>,
    invoices: Mutex<Table<Invoice>>,
    sequences: Mutex<HashMap<String, u64>>,
    sequences_down: AtomicBool,
}

#[derive(Debug)]
struct Table<T> {
    rows: HashMap<Uuid, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self { rows: HashMap::new() }
    }
}

impl<T: Record> Table<T> {
    fn insert(&mut self, record: &T) -> Result<T, StoreError> {
        let taken = self.rows.contains_key(&record.id())
            || self.rows.values().any(|r| r.number() == record.number());
        if taken {
            return Err(StoreError::Duplicate {
                entity: T::ENTITY,
                key: record.number().to_string(),
            });
        }
        let mut stored = record.clone();
        stored.set_version(1);
        self.rows.insert(stored.id(), stored.clone());
        Ok(stored)
    }

    fn get(&self, id: Uuid) -> Result<T, StoreError> {
        self.rows.get(&id).cloned().ok_or_else(|| StoreError::NotFound {
            entity: T::ENTITY,
            key: id.to_string(),
        })
    }

    fn update(&mut self, record: &T) -> Result<T, StoreError> {
        let current = self.rows.get_mut(&record.id()).ok_or_else(|| StoreError::NotFound {
            entity: T::ENTITY,
            key: record.id().to_string(),
        })?;
        if current.version() != record.version() {
            return Err(StoreError::Conflict {
                entity: T::ENTITY,
                key: record.number().to_string(),
                expected: record.version(),
            });
        }
        let mut stored = record.clone();
        stored.set_version(record.version() + 1);
        *current = stored.clone();
        Ok(stored)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a sequence outage so number allocation takes its fallback path.
    pub fn set_sequences_available(&self, available: bool) {
        self.sequences_down.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_contract(&self, contract: &Contract) -> Result<Contract, StoreError> {
        self.contracts.lock().await.insert(contract)
    }

    async fn get_contract(&self, id: Uuid) -> Result<Contract, StoreError> {
        self.contracts.lock().await.get(id)
    }

    async fn update_contract(&self, contract: &Contract) -> Result<Contract, StoreError> {
        self.contracts.lock().await.update(contract)
    }

    async fn query_contracts(&self, filter: &ContractFilter) -> Result<Vec<Contract>, StoreError> {
        let table = self.contracts.lock().await;
        let rows = table.rows.values().filter(|c| filter.matches(c)).cloned().collect();
        Ok(sort_and_limit(rows, filter.order, filter.limit))
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, StoreError> {
        self.invoices.lock().await.insert(invoice)
    }

    async fn get_invoice(&self, id: Uuid) -> Result<Invoice, StoreError> {
        self.invoices.lock().await.get(id)
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice, StoreError> {
        self.invoices.lock().await.update(invoice)
    }

    async fn query_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError> {
        let table = self.invoices.lock().await;
        let rows = table.rows.values().filter(|i| filter.matches(i)).cloned().collect();
        Ok(sort_and_limit(rows, filter.order, filter.limit))
    }

    async fn next_sequence_value(&self, name: &str) -> Result<u64, StoreError> {
        if self.sequences_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("sequence {name} is offline")));
        }
        let mut sequences = self.sequences.lock().await;
        let value = sequences.entry(name.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use shine_core::{calculate, ContractDraft, ContractNumber, ContractStatus, PricingRuleTable, ServiceAttributes};

    fn contract(number: &str, email: &str) -> Contract {
        let table = PricingRuleTable::embedded().expect("rules");
        let attrs: ServiceAttributes = serde_json::from_value(json!({
            "category": "residential",
            "service_tier": "regular",
            "size": {"bedrooms": 2},
            "frequency": "fortnightly"
        }))
        .expect("attributes");
        let draft: ContractDraft = serde_json::from_value(json!({
            "contract_type": "residential_recurring",
            "client": {"name": "Sam Okafor", "email": email},
            "service": {"description": "Fortnightly regular clean"},
            "term": {"start_date": "2026-03-01", "duration_months": 6},
            "payment_frequency": "monthly",
            "price_point": {"kind": "low"}
        }))
        .expect("draft");
        Contract::new(
            Uuid::new_v4(),
            ContractNumber::parse(number).expect("number"),
            draft,
            calculate(&table, &attrs).expect("quote"),
            Utc::now(),
        )
        .expect("contract")
    }

    #[tokio::test]
    async fn updates_require_the_current_version() {
        let store = MemoryStore::new();
        let stored = store.insert_contract(&contract("CSA-26-0001", "sam@example.com")).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut first = stored.clone();
        first.status = ContractStatus::Sent;
        let first = store.update_contract(&first).await.unwrap();
        assert_eq!(first.version, 2);

        let mut stale = stored;
        stale.status = ContractStatus::Cancelled;
        let err = store.update_contract(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, .. }));
        assert_eq!(store.get_contract(first.id).await.unwrap().status, ContractStatus::Sent);
    }

    #[tokio::test]
    async fn duplicate_numbers_are_rejected() {
        let store = MemoryStore::new();
        store.insert_contract(&contract("CSA-26-0001", "a@example.com")).await.unwrap();
        let err = store.insert_contract(&contract("CSA-26-0001", "b@example.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn query_filters_by_email_and_payment_ref() {
        let store = MemoryStore::new();
        let mut linked = contract("CSA-26-0002", "linked@example.com");
        linked.payment.external_id = Some("pl_77".into());
        linked.payment.external_order_id = Some("ord_77".into());
        store.insert_contract(&linked).await.unwrap();
        store.insert_contract(&contract("CSA-26-0003", "other@example.com")).await.unwrap();

        let by_order = store
            .query_contracts(&ContractFilter { payment_ref: Some("ord_77".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_order.len(), 1);
        assert_eq!(by_order[0].contract_number.as_str(), "CSA-26-0002");

        let by_email = store
            .query_contracts(&ContractFilter { client_email: Some("OTHER@example.com".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(store.query_contracts(&ContractFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sequences_are_monotonic_until_taken_offline() {
        let store = MemoryStore::new();
        assert_eq!(store.next_sequence_value("contract_number_seq").await.unwrap(), 1);
        assert_eq!(store.next_sequence_value("contract_number_seq").await.unwrap(), 2);
        assert_eq!(store.next_sequence_value("invoice_number_seq").await.unwrap(), 1);
        store.set_sequences_available(false);
        assert!(matches!(
            store.next_sequence_value("contract_number_seq").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
