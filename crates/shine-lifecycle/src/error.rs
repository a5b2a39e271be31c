use shine_core::{ContractError, QuoteError};
use shine_docs::DocumentError;
use shine_gateway::GatewayError;
use shine_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Quote(#[from] QuoteError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error(transparent)]
    Store(StoreError),
    /// The artifact may exist at the processor; the attempt is parked until
    /// a reconciliation pass or webhook settles it.
    #[error("payment gateway outcome for {reference} is unknown; it will be reconciled")]
    GatewayAmbiguous { reference: String },
    #[error(transparent)]
    Gateway(GatewayError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, key } => Self::NotFound { entity, key },
            other => Self::Store(other),
        }
    }
}

impl LifecycleError {
    pub(crate) fn gateway(reference: &str, err: GatewayError) -> Self {
        match err {
            GatewayError::Ambiguous(_) => Self::GatewayAmbiguous {
                reference: reference.to_string(),
            },
            other => Self::Gateway(other),
        }
    }
}
