use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    GatewayError, InvoiceRequest, PaymentArtifact, PaymentGateway, PaymentLinkRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: &'static str,
    pub idempotency_key: String,
}

#[derive(Debug)]
struct ScriptedFailure {
    error: GatewayError,
    /// The artifact is created before the error is returned, like a response
    /// lost on the way back.
    commit: bool,
}

#[derive(Debug, Default)]
struct State {
    artifacts: HashMap<String, PaymentArtifact>,
    calls: Vec<RecordedCall>,
    cancelled: Vec<String>,
    failures: VecDeque<ScriptedFailure>,
    next_id: u64,
}

impl State {
    fn mint(&mut self, key: &str, prefix: &str) -> PaymentArtifact {
        if let Some(existing) = self.artifacts.get(key) {
            return existing.clone();
        }
        self.next_id += 1;
        let n = self.next_id;
        let artifact = PaymentArtifact {
            external_id: format!("{prefix}_{n}"),
            order_id: Some(format!("ord_{n}")),
            url: format!("https://pay.example.test/{prefix}_{n}"),
        };
        self.artifacts.insert(key.to_string(), artifact.clone());
        artifact
    }

    fn create(&mut self, operation: &'static str, key: &str, prefix: &str) -> Result<PaymentArtifact, GatewayError> {
        self.calls.push(RecordedCall {
            operation,
            idempotency_key: key.to_string(),
        });
        match self.failures.pop_front() {
            Some(ScriptedFailure { error, commit: false }) => Err(error),
            Some(ScriptedFailure { error, commit: true }) => {
                self.mint(key, prefix);
                Err(error)
            }
            None => Ok(self.mint(key, prefix)),
        }
    }
}

/// In-process gateway that honours idempotency keys and records every call.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    state: Mutex<State>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next mutating call fails without creating anything.
    pub async fn fail_next(&self, error: GatewayError) {
        self.state.lock().await.failures.push_back(ScriptedFailure { error, commit: false });
    }

    /// The next mutating call creates its artifact, then reports a timeout.
    pub async fn time_out_after_commit(&self) {
        self.state.lock().await.failures.push_back(ScriptedFailure {
            error: GatewayError::Ambiguous("simulated timeout".to_string()),
            commit: true,
        });
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    /// Distinct artifacts created so far.
    pub async fn artifact_count(&self) -> usize {
        self.state.lock().await.artifacts.len()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn create_payment_link(
        &self,
        request: &PaymentLinkRequest,
    ) -> Result<PaymentArtifact, GatewayError> {
        if request.line_items.is_empty() {
            return Err(GatewayError::Rejected {
                status: 422,
                message: "payment link needs at least one line item".to_string(),
            });
        }
        self.state
            .lock()
            .await
            .create("create_payment_link", &request.idempotency_key, "pl")
    }

    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<PaymentArtifact, GatewayError> {
        let mut state = self.state.lock().await;
        for (operation, key) in [
            ("create_invoice_shell", request.shell_key()),
            ("attach_invoice_lines", request.lines_key()),
        ] {
            state.calls.push(RecordedCall {
                operation,
                idempotency_key: key,
            });
        }
        state.create("publish_invoice", &request.publish_key(), "inv")
    }

    async fn lookup(&self, idempotency_key: &str) -> Result<Option<PaymentArtifact>, GatewayError> {
        Ok(self.state.lock().await.artifacts.get(idempotency_key).cloned())
    }

    async fn cancel(&self, external_id: &str) -> Result<(), GatewayError> {
        self.state.lock().await.cancelled.push(external_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Buyer, GatewayLineItem};

    fn link_request(key: &str) -> PaymentLinkRequest {
        PaymentLinkRequest {
            idempotency_key: key.into(),
            reference: key.into(),
            description: "Monthly regular clean".into(),
            currency: "AUD".into(),
            line_items: vec![GatewayLineItem {
                name: "Service agreement".into(),
                quantity: 1,
                unit_amount_minor: 18050,
            }],
            buyer: Buyer {
                name: "Priya Raman".into(),
                email: "priya@example.com".into(),
            },
            redirect_url: None,
        }
    }

    #[tokio::test]
    async fn same_key_yields_same_artifact() {
        let gateway = RecordingGateway::new();
        let first = gateway.create_payment_link(&link_request("CSA-26-0001")).await.unwrap();
        let second = gateway.create_payment_link(&link_request("CSA-26-0001")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.artifact_count().await, 1);
        assert_eq!(gateway.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn committed_timeouts_are_visible_through_lookup() {
        let gateway = RecordingGateway::new();
        gateway.time_out_after_commit().await;
        let err = gateway.create_payment_link(&link_request("CSA-26-0002")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Ambiguous(_)));
        let found = gateway.lookup("CSA-26-0002").await.unwrap();
        assert!(found.is_some());
        assert_eq!(gateway.lookup("CSA-26-0003").await.unwrap(), None);
    }
}
