use thiserror::Error;

use crate::attributes::{ServiceCategory, ServiceTier, SizeMetric};
use crate::contract::ContractStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no base price for {category:?}/{tier:?} with size {size}")]
    UnknownServiceCombination {
        category: ServiceCategory,
        tier: ServiceTier,
        size: SizeMetric,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleTableError {
    #[error("parsing pricing rules: {0}")]
    Parse(String),
    #[error("invalid pricing rules: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid state transition {from} -> {to}: {reason}")]
    InvalidStateTransition {
        from: ContractStatus,
        to: ContractStatus,
        reason: String,
    },
}

impl ContractError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn illegal(from: ContractStatus, to: ContractStatus, reason: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from,
            to,
            reason: reason.into(),
        }
    }
}

impl From<QuoteError> for ContractError {
    fn from(err: QuoteError) -> Self {
        Self::Validation(err.to_string())
    }
}
