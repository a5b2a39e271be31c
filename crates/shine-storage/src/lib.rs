//! Persistence for contracts and invoices plus the on-disk PDF cache.
//!
//! The [`Store`] trait is the only way the lifecycle services touch records.
//! Every update is conditional on the caller's `version`; the store bumps it.

mod documents;
mod memory;
mod postgres;

use async_trait::async_trait;
use shine_core::{Contract, ContractStatus, Invoice, InvoiceStatus};
use thiserror::Error;
use uuid::Uuid;

pub use documents::{DocumentCache, StoredDocument};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "shine-storage";

pub const CONTRACT_SEQUENCE: &str = "contract_number_seq";
pub const INVOICE_SEQUENCE: &str = "invoice_number_seq";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("{entity} {key} changed since version {expected}")]
    Conflict {
        entity: &'static str,
        key: String,
        expected: u64,
    },
    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Clone, Default)]
pub struct ContractFilter {
    pub status: Option<ContractStatus>,
    pub client_email: Option<String>,
    pub contract_number: Option<String>,
    /// Matches the processor's payment id or order id.
    pub payment_ref: Option<String>,
    pub ambiguous_only: bool,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl ContractFilter {
    pub fn matches(&self, contract: &Contract) -> bool {
        self.status.map_or(true, |s| contract.status == s)
            && self
                .client_email
                .as_deref()
                .map_or(true, |e| contract.client.email.eq_ignore_ascii_case(e))
            && self
                .contract_number
                .as_deref()
                .map_or(true, |n| contract.contract_number.as_str() == n)
            && self
                .payment_ref
                .as_deref()
                .map_or(true, |r| payment_ref_matches(&contract.payment, r))
            && (!self.ambiguous_only || contract.payment.is_ambiguous())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub invoice_number: Option<String>,
    pub payment_ref: Option<String>,
    pub ambiguous_only: bool,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl InvoiceFilter {
    pub fn matches(&self, invoice: &Invoice) -> bool {
        self.status.map_or(true, |s| invoice.status == s)
            && self
                .invoice_number
                .as_deref()
                .map_or(true, |n| invoice.invoice_number.as_str() == n)
            && self
                .payment_ref
                .as_deref()
                .map_or(true, |r| payment_ref_matches(&invoice.payment, r))
            && (!self.ambiguous_only || invoice.payment.is_ambiguous())
    }
}

fn payment_ref_matches(linkage: &shine_core::PaymentLinkage, reference: &str) -> bool {
    linkage.external_id.as_deref() == Some(reference)
        || linkage.external_order_id.as_deref() == Some(reference)
}

/// Record persistence with optimistic concurrency.
///
/// `update_*` succeeds only when the stored version equals the version carried
/// by the argument, and returns the record with its new version.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_contract(&self, contract: &Contract) -> Result<Contract, StoreError>;
    async fn get_contract(&self, id: Uuid) -> Result<Contract, StoreError>;
    async fn update_contract(&self, contract: &Contract) -> Result<Contract, StoreError>;
    async fn query_contracts(&self, filter: &ContractFilter) -> Result<Vec<Contract>, StoreError>;

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<Invoice, StoreError>;
    async fn get_invoice(&self, id: Uuid) -> Result<Invoice, StoreError>;
    async fn update_invoice(&self, invoice: &Invoice) -> Result<Invoice, StoreError>;
    async fn query_invoices(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, StoreError>;

    /// Next value of a named monotonic sequence, starting at 1.
    async fn next_sequence_value(&self, name: &str) -> Result<u64, StoreError>;
}

/// Fields the stores need to treat contracts and invoices alike.
pub(crate) trait Record: Clone {
    const ENTITY: &'static str;
    fn id(&self) -> Uuid;
    fn number(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn created_at(&self) -> chrono::DateTime<chrono::Utc>;
}

impl Record for Contract {
    const ENTITY: &'static str = "contract";

    fn id(&self) -> Uuid {
        self.id
    }

    fn number(&self) -> &str {
        self.contract_number.as_str()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }
}

impl Record for Invoice {
    const ENTITY: &'static str = "invoice";

    fn id(&self) -> Uuid {
        self.id
    }

    fn number(&self) -> &str {
        self.invoice_number.as_str()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }
}

pub(crate) fn sort_and_limit<T: Record>(mut rows: Vec<T>, order: SortOrder, limit: Option<usize>) -> Vec<T> {
    rows.sort_by(|a, b| {
        let key = a.created_at().cmp(&b.created_at()).then_with(|| a.number().cmp(b.number()));
        match order {
            SortOrder::OldestFirst => key,
            SortOrder::NewestFirst => key.reverse(),
        }
    });
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    rows
}
