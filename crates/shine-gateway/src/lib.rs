//! Payment processor client: hosted payment links and formal invoices.
//!
//! Every mutating call carries an idempotency key, so repeating a call with
//! the same key never creates a second artifact. A timed-out call is reported
//! as [`GatewayError::Ambiguous`] and is never retried automatically; the
//! caller resolves it later through [`PaymentGateway::lookup`].

mod http;
mod recording;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpGateway, HttpGatewayConfig};
pub use recording::{RecordedCall, RecordingGateway};

pub const CRATE_NAME: &str = "shine-gateway";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayLineItem {
    pub name: String,
    pub quantity: u32,
    /// Unit price in cents.
    pub unit_amount_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buyer {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLinkRequest {
    pub idempotency_key: String,
    /// Our document number, echoed back by the processor in webhooks.
    pub reference: String,
    pub description: String,
    pub currency: String,
    pub line_items: Vec<GatewayLineItem>,
    pub buyer: Buyer,
    #[serde(default)]
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub reference: String,
    pub currency: String,
    pub buyer: Buyer,
    pub line_items: Vec<GatewayLineItem>,
    pub due_date: NaiveDate,
    pub payment_terms: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl InvoiceRequest {
    pub fn shell_key(&self) -> String {
        format!("{}-shell", self.reference)
    }

    pub fn lines_key(&self) -> String {
        format!("{}-lines", self.reference)
    }

    /// The key that identifies the finished invoice; `lookup` resolves it.
    pub fn publish_key(&self) -> String {
        publish_key(&self.reference)
    }
}

pub fn publish_key(reference: &str) -> String {
    format!("publish-{reference}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentArtifact {
    pub external_id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Nothing was created; retrying with the same key is safe.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment gateway rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    /// The request may or may not have taken effect.
    #[error("payment gateway outcome unknown: {0}")]
    Ambiguous(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_link(
        &self,
        request: &PaymentLinkRequest,
    ) -> Result<PaymentArtifact, GatewayError>;

    /// Shell, line items and publish, each step keyed independently so an
    /// interrupted invoice can be resumed.
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<PaymentArtifact, GatewayError>;

    async fn lookup(&self, idempotency_key: &str) -> Result<Option<PaymentArtifact>, GatewayError>;

    async fn cancel(&self, external_id: &str) -> Result<(), GatewayError>;
}

pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        GatewayError::Unavailable(format!("HTTP {status}: {body}"))
    } else {
        GatewayError::Rejected {
            status: status.as_u16(),
            message: body.to_string(),
        }
    }
}

/// Only failures that provably happened before the request left this host
/// count as unavailable.
pub fn classify_reqwest_error(err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Ambiguous(format!("request timed out: {err}"))
    } else if err.is_connect() {
        GatewayError::Unavailable(format!("connect failed: {err}"))
    } else if err.is_builder() {
        GatewayError::Rejected {
            status: 0,
            message: format!("invalid request: {err}"),
        }
    } else {
        GatewayError::Ambiguous(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        let rejected = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad amount");
        assert_eq!(
            rejected,
            GatewayError::Rejected {
                status: 422,
                message: "bad amount".into()
            }
        );
        assert!(!GatewayError::Ambiguous("timeout".into()).is_retryable());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn invoice_step_keys_derive_from_the_reference() {
        let request = InvoiceRequest {
            reference: "INV-26-0007".into(),
            currency: "AUD".into(),
            buyer: Buyer {
                name: "Harbour Dental".into(),
                email: "accounts@harbourdental.com.au".into(),
            },
            line_items: vec![],
            due_date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            payment_terms: "14 days".into(),
            description: None,
        };
        assert_eq!(request.shell_key(), "INV-26-0007-shell");
        assert_eq!(request.lines_key(), "INV-26-0007-lines");
        assert_eq!(request.publish_key(), "publish-INV-26-0007");
    }
}
