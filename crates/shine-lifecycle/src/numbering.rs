//! Document number allocation.
//!
//! The store's sequences are the primary source. When they cannot be reached
//! the service keeps issuing numbers from the microsecond clock (8 digits,
//! see `ContractNumber::from_fallback`) and logs the degradation. Fallback
//! numbers are unique per host only.

use std::sync::Arc;

use chrono::Datelike;
use serde::Serialize;
use shine_core::numbering::NumberFormatError;
use shine_core::{ContractNumber, NumberSource};
use shine_storage::{Store, CONTRACT_SEQUENCE, INVOICE_SEQUENCE};
use tracing::warn;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Contract,
    Invoice,
}

impl DocumentKind {
    fn sequence(self) -> &'static str {
        match self {
            Self::Contract => CONTRACT_SEQUENCE,
            Self::Invoice => INVOICE_SEQUENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedNumber {
    pub number: ContractNumber,
    pub source: NumberSource,
}

pub struct NumberingService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    contract_prefix: String,
    invoice_prefix: String,
}

impl NumberingService {
    /// Fails when a prefix is not 2-4 uppercase letters.
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        contract_prefix: &str,
        invoice_prefix: &str,
    ) -> Result<Self, NumberFormatError> {
        for prefix in [contract_prefix, invoice_prefix] {
            ContractNumber::from_sequence(prefix, 2000, 1)?;
        }
        Ok(Self {
            store,
            clock,
            contract_prefix: contract_prefix.to_string(),
            invoice_prefix: invoice_prefix.to_string(),
        })
    }

    fn prefix(&self, kind: DocumentKind) -> &str {
        match kind {
            DocumentKind::Contract => &self.contract_prefix,
            DocumentKind::Invoice => &self.invoice_prefix,
        }
    }

    /// Never fails for lack of a sequence; only a broken prefix can error.
    pub async fn allocate(&self, kind: DocumentKind) -> Result<AllocatedNumber, NumberFormatError> {
        let now = self.clock.now();
        let prefix = self.prefix(kind);
        let sequenced = match self.store.next_sequence_value(kind.sequence()).await {
            Ok(value) => ContractNumber::from_sequence(prefix, now.year(), value)
                .map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        };
        match sequenced {
            Ok(number) => Ok(AllocatedNumber {
                number,
                source: NumberSource::Sequence,
            }),
            Err(reason) => {
                let micros = u64::try_from(now.timestamp_micros()).unwrap_or_default();
                let number = ContractNumber::from_fallback(prefix, now.year(), micros)?;
                warn!(
                    ?kind,
                    %number,
                    %reason,
                    "number sequence unavailable, issued clock-derived fallback number (degraded mode)"
                );
                Ok(AllocatedNumber {
                    number,
                    source: NumberSource::Fallback,
                })
            }
        }
    }
}
