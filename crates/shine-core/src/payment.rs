//! Linkage between an entity and its artifact at the payment processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-known processor-side status. Forward movement follows `rank`;
/// cancellations and refunds may move it backwards, failures only while the
/// payment is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalPaymentStatus {
    #[default]
    None,
    Created,
    Pending,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl ExternalPaymentStatus {
    pub fn rank(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Created => 1,
            Self::Pending | Self::Failed => 2,
            Self::Completed => 3,
            Self::Cancelled | Self::Refunded => 4,
        }
    }

    /// Whether an event reporting `next` may replace this status. Repeats
    /// and regressions are refused.
    pub fn admits(self, next: Self) -> bool {
        use ExternalPaymentStatus::*;
        match (self, next) {
            (current, next) if current == next => false,
            (Cancelled, Refunded) => true,
            (Cancelled | Refunded, _) => false,
            (_, Cancelled | Refunded) => true,
            (Completed, _) => false,
            (Failed, Pending | Completed) => true,
            (_, Failed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

/// Outcome of one artifact-creation attempt, recorded before and after the
/// gateway call so an interrupted send can resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    /// Timed out with an unknown outcome; resolved by querying the key.
    Ambiguous,
    Created,
    Failed { reason: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub idempotency_key: String,
    #[serde(flatten)]
    pub state: AttemptState,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentLinkage {
    #[serde(default)]
    pub attempt: Option<PaymentAttempt>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub external_order_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: ExternalPaymentStatus,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
}

impl PaymentLinkage {
    pub fn begin_attempt(&mut self, idempotency_key: String, now: DateTime<Utc>) {
        self.attempt = Some(PaymentAttempt {
            idempotency_key,
            state: AttemptState::Pending,
            attempted_at: now,
        });
    }

    pub fn mark_attempt(&mut self, state: AttemptState) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.state = state;
        }
    }

    pub fn record_artifact(
        &mut self,
        external_id: String,
        external_order_id: Option<String>,
        url: String,
    ) {
        self.mark_attempt(AttemptState::Created);
        self.external_id = Some(external_id);
        self.external_order_id = external_order_id;
        self.url = Some(url);
        if self.status == ExternalPaymentStatus::None {
            self.status = ExternalPaymentStatus::Created;
        }
    }

    pub fn has_artifact(&self) -> bool {
        matches!(
            self.attempt,
            Some(PaymentAttempt {
                state: AttemptState::Created,
                ..
            })
        ) && self.external_id.is_some()
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self.attempt,
            Some(PaymentAttempt {
                state: AttemptState::Ambiguous,
                ..
            })
        )
    }

    pub fn is_paid(&self) -> bool {
        self.status == ExternalPaymentStatus::Completed
    }
}
