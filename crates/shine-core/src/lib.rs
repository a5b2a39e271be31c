//! Core domain model for Shine: pricing, contracts, invoices and document numbers.
//!
//! Nothing in this crate performs I/O or reads the clock.

pub mod attributes;
pub mod contract;
pub mod error;
pub mod invoice;
pub mod money;
pub mod numbering;
pub mod payment;
pub mod pricing;
pub mod quote;

pub use attributes::ServiceAttributes;
pub use contract::{Contract, ContractDraft, ContractEdit, ContractStatus, PROVIDER};
pub use error::{ContractError, QuoteError, RuleTableError};
pub use invoice::{Invoice, InvoiceDraft, InvoiceStatus};
pub use money::PriceRange;
pub use numbering::{ContractNumber, NumberSource};
pub use payment::{AttemptState, ExternalPaymentStatus, PaymentLinkage};
pub use pricing::PricingRuleTable;
pub use quote::{calculate, PriceBreakdown};

pub const CRATE_NAME: &str = "shine-core";
