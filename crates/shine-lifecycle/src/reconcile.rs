//! Resolution of gateway attempts whose outcome was never learned.

use serde::Serialize;
use shine_core::{AttemptState, ContractStatus, InvoiceStatus};
use shine_gateway::publish_key;
use shine_storage::{ContractFilter, InvoiceFilter, SortOrder};
use tracing::{info, info_span, warn, Instrument};

use crate::{Engine, LifecycleError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    /// Found at the processor and recorded.
    pub resolved: usize,
    /// Not found; the attempt is failed and a later send starts afresh.
    pub reopened: usize,
    /// Document numbers the processor could not answer for this pass.
    pub unresolved: Vec<String>,
}

enum Resolution {
    Resolved,
    Reopened,
    Skipped,
}

const NOT_FOUND_REASON: &str = "no artifact found at the processor for the idempotency key";

impl Engine {
    /// Looks up every ambiguous attempt by its idempotency key. Found
    /// artifacts are recorded and the interrupted send is finished.
    pub async fn reconcile_ambiguous(&self) -> Result<ReconcileReport, LifecycleError> {
        let span = info_span!("reconcile_ambiguous");
        async {
            let mut report = ReconcileReport::default();
            let contracts = self
                .shared
                .store
                .query_contracts(&ContractFilter {
                    ambiguous_only: true,
                    order: SortOrder::OldestFirst,
                    ..ContractFilter::default()
                })
                .await?;
            for contract in contracts {
                report.examined += 1;
                let number = contract.contract_number.to_string();
                match self.reconcile_contract(contract.id).await {
                    Ok(resolution) => report.record(resolution),
                    Err(err) => {
                        warn!(contract = %number, error = %err, "ambiguous payment link left unresolved");
                        report.unresolved.push(number);
                    }
                }
            }

            let invoices = self
                .shared
                .store
                .query_invoices(&InvoiceFilter {
                    ambiguous_only: true,
                    order: SortOrder::OldestFirst,
                    ..InvoiceFilter::default()
                })
                .await?;
            for invoice in invoices {
                report.examined += 1;
                let number = invoice.invoice_number.to_string();
                match self.reconcile_invoice(invoice.id).await {
                    Ok(resolution) => report.record(resolution),
                    Err(err) => {
                        warn!(invoice = %number, error = %err, "ambiguous invoice left unresolved");
                        report.unresolved.push(number);
                    }
                }
            }
            info!(
                examined = report.examined,
                resolved = report.resolved,
                reopened = report.reopened,
                unresolved = report.unresolved.len(),
                "reconciliation pass finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn reconcile_contract(&self, id: uuid::Uuid) -> Result<Resolution, LifecycleError> {
        let shared = &self.shared;
        let _guard = shared.locks.acquire(id).await;
        let mut contract = shared.store.get_contract(id).await?;
        if !contract.payment.is_ambiguous() {
            return Ok(Resolution::Skipped);
        }
        let key = contract.contract_number.to_string();
        match shared.gateway.lookup(&key).await {
            Ok(Some(artifact)) => {
                contract
                    .payment
                    .record_artifact(artifact.external_id, artifact.order_id, artifact.url);
                let contract = shared.save_contract(&contract).await?;
                if contract.status == ContractStatus::Draft {
                    shared.finish_contract_send(contract, shared.clock.now()).await?;
                }
                info!(%key, "ambiguous payment link resolved");
                Ok(Resolution::Resolved)
            }
            Ok(None) => {
                contract.payment.mark_attempt(AttemptState::Failed {
                    reason: NOT_FOUND_REASON.to_string(),
                    retryable: true,
                });
                shared.save_contract(&contract).await?;
                info!(%key, "ambiguous payment link was never created, send may be retried");
                Ok(Resolution::Reopened)
            }
            Err(err) => Err(LifecycleError::gateway(&key, err)),
        }
    }

    async fn reconcile_invoice(&self, id: uuid::Uuid) -> Result<Resolution, LifecycleError> {
        let shared = &self.shared;
        let _guard = shared.locks.acquire(id).await;
        let mut invoice = shared.store.get_invoice(id).await?;
        if !invoice.payment.is_ambiguous() {
            return Ok(Resolution::Skipped);
        }
        let key = publish_key(invoice.invoice_number.as_str());
        match shared.gateway.lookup(&key).await {
            Ok(Some(artifact)) => {
                invoice
                    .payment
                    .record_artifact(artifact.external_id, artifact.order_id, artifact.url);
                let invoice = shared.save_invoice(&invoice).await?;
                if invoice.status == InvoiceStatus::Draft {
                    shared.finish_invoice_send(invoice, shared.clock.now()).await?;
                }
                info!(%key, "ambiguous invoice resolved");
                Ok(Resolution::Resolved)
            }
            Ok(None) => {
                invoice.payment.mark_attempt(AttemptState::Failed {
                    reason: NOT_FOUND_REASON.to_string(),
                    retryable: true,
                });
                shared.save_invoice(&invoice).await?;
                info!(%key, "ambiguous invoice was never published, send may be retried");
                Ok(Resolution::Reopened)
            }
            Err(err) => Err(LifecycleError::gateway(&key, err)),
        }
    }
}

impl ReconcileReport {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Resolved => self.resolved += 1,
            Resolution::Reopened => self.reopened += 1,
            Resolution::Skipped => {}
        }
    }
}
