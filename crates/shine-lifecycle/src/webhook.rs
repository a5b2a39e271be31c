//! Processor webhooks.
//!
//! Events are matched to a contract or invoice by payment id, then order id,
//! then our document number. Status only moves along the payment lattice
//! (`ExternalPaymentStatus::admits`), so replays and out-of-order deliveries
//! are harmless.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shine_core::contract::NotificationKind;
use shine_core::{AttemptState, ContractStatus, ExternalPaymentStatus, InvoiceStatus, PaymentLinkage};
use shine_storage::{ContractFilter, InvoiceFilter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{contract_notification, invoice_notification, LifecycleError, Shared};

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: WebhookData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookData {
    #[serde(default)]
    pub object: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        reference: String,
        status: ExternalPaymentStatus,
    },
    Duplicate {
        reference: String,
    },
    /// The event reports a status the entity has already moved past.
    Stale {
        reference: String,
        current: ExternalPaymentStatus,
        reported: ExternalPaymentStatus,
    },
    Unmatched,
    Ignored,
}

/// The payment facts carried by one event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PaymentEvent {
    payment_id: Option<String>,
    order_id: Option<String>,
    reference: Option<String>,
    status: ExternalPaymentStatus,
}

impl PaymentEvent {
    fn from_webhook(event: &WebhookEvent) -> Option<Self> {
        let object = &event.data.object;
        match event.event_type.as_str() {
            kind @ ("payment.created" | "payment.updated") => {
                let payment = object.get("payment").unwrap_or(object);
                let status = match text(payment, "status") {
                    Some(raw) => parse_status(&raw)?,
                    None if kind == "payment.created" => ExternalPaymentStatus::Created,
                    None => return None,
                };
                Some(Self {
                    payment_id: text(payment, "id"),
                    order_id: text(payment, "order_id"),
                    reference: text(payment, "reference_id").or_else(|| text(payment, "reference")),
                    status,
                })
            }
            "order.created" => {
                let order = object
                    .get("order_created")
                    .or_else(|| object.get("order"))
                    .unwrap_or(object);
                Some(Self {
                    payment_id: None,
                    order_id: text(order, "order_id").or_else(|| text(order, "id")),
                    reference: text(order, "reference_id").or_else(|| text(order, "reference")),
                    status: ExternalPaymentStatus::Created,
                })
            }
            _ => None,
        }
    }

    fn label(&self) -> &str {
        self.payment_id
            .as_deref()
            .or(self.order_id.as_deref())
            .or(self.reference.as_deref())
            .unwrap_or("<none>")
    }
}

fn text(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_status(raw: &str) -> Option<ExternalPaymentStatus> {
    match raw.to_ascii_uppercase().as_str() {
        "APPROVED" | "PENDING" => Some(ExternalPaymentStatus::Pending),
        "COMPLETED" => Some(ExternalPaymentStatus::Completed),
        "FAILED" => Some(ExternalPaymentStatus::Failed),
        "CANCELED" | "CANCELLED" => Some(ExternalPaymentStatus::Cancelled),
        "REFUNDED" => Some(ExternalPaymentStatus::Refunded),
        "CREATED" | "OPEN" => Some(ExternalPaymentStatus::Created),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Matched {
    Contract(Uuid),
    Invoice(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Applied,
    Duplicate,
    Stale,
}

/// Fills in ids the entity did not know yet, then moves the status if the
/// lattice allows it. Returns the verdict and whether anything changed.
fn apply(linkage: &mut PaymentLinkage, event: &PaymentEvent, at: DateTime<Utc>) -> (Verdict, bool) {
    let mut changed = false;
    if linkage.external_id.is_none() {
        if let Some(id) = &event.payment_id {
            linkage.external_id = Some(id.clone());
            changed = true;
        }
    }
    if linkage.external_order_id.is_none() {
        if let Some(id) = &event.order_id {
            linkage.external_order_id = Some(id.clone());
            changed = true;
        }
    }
    if linkage.is_ambiguous() && linkage.external_id.is_some() {
        linkage.mark_attempt(AttemptState::Created);
        changed = true;
    }

    if event.status == linkage.status {
        return (Verdict::Duplicate, changed);
    }
    if !linkage.status.admits(event.status) {
        return (Verdict::Stale, changed);
    }
    linkage.status = event.status;
    linkage.last_event_at = Some(at);
    if event.status == ExternalPaymentStatus::Completed && linkage.paid_at.is_none() {
        linkage.paid_at = Some(at);
    }
    (Verdict::Applied, true)
}

fn outcome(verdict: Verdict, reference: String, current: ExternalPaymentStatus, reported: ExternalPaymentStatus) -> ReconcileOutcome {
    match verdict {
        Verdict::Applied => ReconcileOutcome::Applied {
            reference,
            status: reported,
        },
        Verdict::Duplicate => ReconcileOutcome::Duplicate { reference },
        Verdict::Stale => ReconcileOutcome::Stale {
            reference,
            current,
            reported,
        },
    }
}

pub struct WebhookReconciler {
    shared: Arc<Shared>,
}

impl WebhookReconciler {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub async fn handle(&self, event: WebhookEvent) -> Result<ReconcileOutcome, LifecycleError> {
        let Some(payment) = PaymentEvent::from_webhook(&event) else {
            warn!(
                event_type = %event.event_type,
                event_id = event.event_id.as_deref().unwrap_or("-"),
                "webhook ignored"
            );
            return Ok(ReconcileOutcome::Ignored);
        };
        let at = event.created_at.unwrap_or_else(|| self.shared.clock.now());
        let Some(matched) = self.find(&payment).await? else {
            info!(reference = payment.label(), status = ?payment.status, "webhook matched no contract or invoice");
            return Ok(ReconcileOutcome::Unmatched);
        };
        let result = match matched {
            Matched::Contract(id) => self.apply_to_contract(id, &payment, at).await?,
            Matched::Invoice(id) => self.apply_to_invoice(id, &payment, at).await?,
        };
        debug!(event_id = event.event_id.as_deref().unwrap_or("-"), ?result, "webhook reconciled");
        Ok(result)
    }

    async fn find(&self, event: &PaymentEvent) -> Result<Option<Matched>, LifecycleError> {
        let store = &self.shared.store;
        for id in [&event.payment_id, &event.order_id].into_iter().flatten() {
            let contracts = store
                .query_contracts(&ContractFilter {
                    payment_ref: Some(id.clone()),
                    limit: Some(1),
                    ..ContractFilter::default()
                })
                .await?;
            if let Some(contract) = contracts.first() {
                return Ok(Some(Matched::Contract(contract.id)));
            }
            let invoices = store
                .query_invoices(&InvoiceFilter {
                    payment_ref: Some(id.clone()),
                    limit: Some(1),
                    ..InvoiceFilter::default()
                })
                .await?;
            if let Some(invoice) = invoices.first() {
                return Ok(Some(Matched::Invoice(invoice.id)));
            }
        }
        if let Some(reference) = &event.reference {
            let contracts = store
                .query_contracts(&ContractFilter {
                    contract_number: Some(reference.clone()),
                    limit: Some(1),
                    ..ContractFilter::default()
                })
                .await?;
            if let Some(contract) = contracts.first() {
                return Ok(Some(Matched::Contract(contract.id)));
            }
            let invoices = store
                .query_invoices(&InvoiceFilter {
                    invoice_number: Some(reference.clone()),
                    limit: Some(1),
                    ..InvoiceFilter::default()
                })
                .await?;
            if let Some(invoice) = invoices.first() {
                return Ok(Some(Matched::Invoice(invoice.id)));
            }
        }
        Ok(None)
    }

    /// A webhook for an ambiguous attempt proves the artifact exists; fetch
    /// it so the stored linkage keeps its URL.
    async fn settle_ambiguous(&self, linkage: &mut PaymentLinkage) -> bool {
        if !linkage.is_ambiguous() {
            return false;
        }
        let Some(key) = linkage.attempt.as_ref().map(|attempt| attempt.idempotency_key.clone()) else {
            return false;
        };
        match self.shared.gateway.lookup(&key).await {
            Ok(Some(artifact)) => {
                linkage.record_artifact(artifact.external_id, artifact.order_id, artifact.url);
                info!(%key, "ambiguous attempt settled by webhook");
                true
            }
            Ok(None) => {
                debug!(%key, "webhook for an attempt the processor cannot find");
                false
            }
            Err(err) => {
                warn!(%key, error = %err, "lookup failed while settling an ambiguous attempt");
                false
            }
        }
    }

    async fn apply_to_contract(
        &self,
        id: Uuid,
        event: &PaymentEvent,
        at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, LifecycleError> {
        let _guard = self.shared.locks.acquire(id).await;
        let mut contract = self.shared.store.get_contract(id).await?;
        let settled = self.settle_ambiguous(&mut contract.payment).await;
        let current = contract.payment.status;
        let (verdict, changed) = apply(&mut contract.payment, event, at);
        let changed = changed || settled;
        let mut notify = false;
        if verdict == Verdict::Applied && event.status == ExternalPaymentStatus::Completed {
            if matches!(contract.status, ContractStatus::Cancelled | ContractStatus::Expired) {
                warn!(
                    contract = %contract.contract_number,
                    status = contract.status.as_str(),
                    "payment completed on a closed contract, refund needs manual follow-up"
                );
            } else {
                notify = contract.notifications.insert(NotificationKind::PaymentConfirmed);
            }
        }
        if changed {
            contract = self.shared.save_contract(&contract).await?;
        }
        let reference = contract.contract_number.to_string();
        if verdict == Verdict::Applied {
            info!(contract = %reference, from = ?current, to = ?event.status, "payment status updated");
        }
        if notify {
            self.shared
                .deliver(contract_notification(&contract, NotificationKind::PaymentConfirmed))
                .await;
        }
        Ok(outcome(verdict, reference, current, event.status))
    }

    async fn apply_to_invoice(
        &self,
        id: Uuid,
        event: &PaymentEvent,
        at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, LifecycleError> {
        let _guard = self.shared.locks.acquire(id).await;
        let mut invoice = self.shared.store.get_invoice(id).await?;
        let settled = self.settle_ambiguous(&mut invoice.payment).await;
        let current = invoice.payment.status;
        let (verdict, changed) = apply(&mut invoice.payment, event, at);
        let changed = changed || settled;
        let mut notify = false;
        if verdict == Verdict::Applied && event.status == ExternalPaymentStatus::Completed {
            if invoice.status == InvoiceStatus::Cancelled {
                warn!(
                    invoice = %invoice.invoice_number,
                    "payment completed on a cancelled invoice, refund needs manual follow-up"
                );
            } else {
                invoice.mark_paid(at);
                notify = invoice.notifications.insert(NotificationKind::PaymentConfirmed);
            }
        }
        if changed {
            invoice = self.shared.save_invoice(&invoice).await?;
        }
        let reference = invoice.invoice_number.to_string();
        if verdict == Verdict::Applied {
            info!(invoice = %reference, from = ?current, to = ?event.status, "payment status updated");
        }
        if notify {
            self.shared
                .deliver(invoice_notification(&invoice, NotificationKind::PaymentConfirmed))
                .await;
        }
        Ok(outcome(verdict, reference, current, event.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(value: Value) -> WebhookEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn payment_events_read_nested_or_flat_objects() {
        let nested = event(json!({
            "type": "payment.updated",
            "event_id": "evt_1",
            "data": {"object": {"payment": {
                "id": "pay_9", "order_id": "ord_3", "reference_id": "CSA-26-0001", "status": "COMPLETED"
            }}}
        }));
        let parsed = PaymentEvent::from_webhook(&nested).unwrap();
        assert_eq!(parsed.payment_id.as_deref(), Some("pay_9"));
        assert_eq!(parsed.order_id.as_deref(), Some("ord_3"));
        assert_eq!(parsed.reference.as_deref(), Some("CSA-26-0001"));
        assert_eq!(parsed.status, ExternalPaymentStatus::Completed);

        let flat = event(json!({"type": "payment.created", "data": {"object": {"id": "pay_1"}}}));
        assert_eq!(
            PaymentEvent::from_webhook(&flat).unwrap().status,
            ExternalPaymentStatus::Created
        );
    }

    #[test]
    fn order_events_and_unknown_types() {
        let order = event(json!({
            "type": "order.created",
            "data": {"object": {"order_created": {"order_id": "ord_5", "reference_id": "INV-26-0002"}}}
        }));
        let parsed = PaymentEvent::from_webhook(&order).unwrap();
        assert_eq!(parsed.order_id.as_deref(), Some("ord_5"));
        assert_eq!(parsed.status, ExternalPaymentStatus::Created);

        assert!(PaymentEvent::from_webhook(&event(json!({"type": "refund.created"}))).is_none());
        let unknown_status = event(json!({
            "type": "payment.updated",
            "data": {"object": {"id": "pay_1", "status": "WEIRD"}}
        }));
        assert!(PaymentEvent::from_webhook(&unknown_status).is_none());
    }

    #[test]
    fn status_names_are_case_insensitive() {
        assert_eq!(parse_status("canceled"), Some(ExternalPaymentStatus::Cancelled));
        assert_eq!(parse_status("Approved"), Some(ExternalPaymentStatus::Pending));
        assert_eq!(parse_status("open"), Some(ExternalPaymentStatus::Created));
    }

    #[test]
    fn apply_is_monotonic_and_stamps_first_completion() {
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let mut linkage = PaymentLinkage::default();
        linkage.begin_attempt("CSA-26-0001".into(), t1);
        linkage.mark_attempt(AttemptState::Ambiguous);

        let completed = PaymentEvent {
            payment_id: Some("pay_1".into()),
            order_id: None,
            reference: None,
            status: ExternalPaymentStatus::Completed,
        };
        assert_eq!(apply(&mut linkage, &completed, t1), (Verdict::Applied, true));
        assert_eq!(linkage.paid_at, Some(t1));
        assert!(!linkage.is_ambiguous());

        assert_eq!(apply(&mut linkage, &completed, t2), (Verdict::Duplicate, false));
        let pending = PaymentEvent {
            status: ExternalPaymentStatus::Pending,
            ..completed.clone()
        };
        assert_eq!(apply(&mut linkage, &pending, t2), (Verdict::Stale, false));

        let refunded = PaymentEvent {
            status: ExternalPaymentStatus::Refunded,
            ..completed
        };
        assert_eq!(apply(&mut linkage, &refunded, t2), (Verdict::Applied, true));
        assert_eq!(linkage.paid_at, Some(t1));
        assert_eq!(linkage.last_event_at, Some(t2));
    }
}
