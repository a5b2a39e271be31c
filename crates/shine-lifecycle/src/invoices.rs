use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use shine_core::contract::{ClientDetails, NotificationKind};
use shine_core::invoice::InvoiceLineItem;
use shine_core::money::to_minor_units;
use shine_core::{calculate, ContractError, Invoice, InvoiceDraft, NumberSource, ServiceAttributes};
use shine_gateway::{publish_key, Buyer, GatewayLineItem, InvoiceRequest};
use shine_storage::{InvoiceFilter, StoreError};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::contracts::attempt_state_for;
use crate::numbering::DocumentKind;
use crate::{invoice_notification, LifecycleError, Shared, MAX_NUMBER_ATTEMPTS};

/// An invoice request. Line items are either given outright or derived from
/// a priced booking, one item per pricing step.
#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoice {
    pub client: ClientDetails,
    #[serde(default)]
    pub line_items: Vec<InvoiceLineItem>,
    #[serde(default)]
    pub service_attributes: Option<ServiceAttributes>,
    /// Bill the top of the quoted range instead of the bottom.
    #[serde(default)]
    pub high_end: bool,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub payment_terms: String,
    #[serde(default)]
    pub service_terms: String,
    #[serde(default)]
    pub external_reference: Option<String>,
}

pub struct InvoiceService {
    shared: Arc<Shared>,
}

impl InvoiceService {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub async fn create(&self, request: NewInvoice) -> Result<Invoice, LifecycleError> {
        let line_items = match (&request.service_attributes, request.line_items.is_empty()) {
            (Some(attrs), true) => {
                let quote = calculate(&self.shared.rules, attrs)?;
                InvoiceLineItem::from_breakdown(&quote, request.high_end)?
            }
            (Some(_), false) => {
                return Err(ContractError::Validation(
                    "give either line_items or service_attributes, not both".to_string(),
                )
                .into())
            }
            (None, _) => request.line_items,
        };
        let draft = InvoiceDraft {
            client: request.client,
            line_items,
            due_date: request.due_date,
            payment_terms: request.payment_terms,
            service_terms: request.service_terms,
            external_reference: request.external_reference,
        };

        let now = self.shared.clock.now();
        for _ in 0..MAX_NUMBER_ATTEMPTS {
            let allocated = self
                .shared
                .numbering
                .allocate(DocumentKind::Invoice)
                .await
                .map_err(anyhow::Error::from)?;
            let invoice = Invoice::new(Uuid::new_v4(), allocated.number.clone(), draft.clone(), now)?;
            match self.shared.store.insert_invoice(&invoice).await {
                Ok(saved) => {
                    info!(invoice = %saved.invoice_number, total = %saved.total(), "invoice drafted");
                    return Ok(saved);
                }
                Err(StoreError::Duplicate { key, .. }) if allocated.source == NumberSource::Fallback => {
                    warn!(number = %key, "fallback invoice number collided, allocating again");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(anyhow!("no unique invoice number after {MAX_NUMBER_ATTEMPTS} attempts").into())
    }

    pub async fn get(&self, id: Uuid) -> Result<Invoice, LifecycleError> {
        Ok(self.shared.store.get_invoice(id).await?)
    }

    pub async fn list(&self, filter: &InvoiceFilter) -> Result<Vec<Invoice>, LifecycleError> {
        Ok(self.shared.store.query_invoices(filter).await?)
    }

    /// Publishes the invoice at the processor, then marks it sent and notifies
    /// the client once. Safe to call again after any failure.
    pub async fn send(&self, id: Uuid) -> Result<Invoice, LifecycleError> {
        let _guard = self.shared.locks.acquire(id).await;
        let invoice = self.shared.store.get_invoice(id).await?;
        let now = self.shared.clock.now();
        invoice.clone().send(now)?;

        let span = info_span!("send_invoice", invoice = %invoice.invoice_number);
        async move {
            let invoice = if invoice.payment.has_artifact() {
                invoice
            } else {
                self.shared.ensure_published_invoice(invoice, now).await?
            };
            self.shared.finish_invoice_send(invoice, now).await
        }
        .instrument(span)
        .await
    }

    /// Drafts and sent invoices only; the processor's copy is voided on a
    /// best-effort basis.
    pub async fn cancel(&self, id: Uuid) -> Result<Invoice, LifecycleError> {
        let (invoice, voided) = {
            let _guard = self.shared.locks.acquire(id).await;
            let mut invoice = self.shared.store.get_invoice(id).await?;
            let voided = invoice.cancel(self.shared.clock.now())?;
            (self.shared.save_invoice(&invoice).await?, voided)
        };
        info!(invoice = %invoice.invoice_number, "invoice cancelled");
        if let Some(external_id) = voided {
            if let Err(err) = self.shared.gateway.cancel(&external_id).await {
                warn!(
                    invoice = %invoice.invoice_number,
                    %external_id,
                    error = %err,
                    "could not void invoice at the processor"
                );
            }
        }
        Ok(invoice)
    }
}

impl Shared {
    /// Shell, lines and publish run inside the gateway under keys derived
    /// from the invoice number; the publish key names the attempt here.
    pub(crate) async fn ensure_published_invoice(
        &self,
        mut invoice: Invoice,
        now: DateTime<Utc>,
    ) -> Result<Invoice, LifecycleError> {
        let key = publish_key(invoice.invoice_number.as_str());
        if invoice.payment.is_ambiguous() {
            match self.gateway.lookup(&key).await {
                Ok(Some(artifact)) => {
                    info!(%key, external_id = %artifact.external_id, "ambiguous invoice found at the processor");
                    invoice
                        .payment
                        .record_artifact(artifact.external_id, artifact.order_id, artifact.url);
                    return self.save_invoice(&invoice).await;
                }
                Ok(None) => {}
                Err(err) => return Err(LifecycleError::gateway(&key, err)),
            }
        }

        let request = invoice_request(&invoice)?;
        invoice.payment.begin_attempt(key.clone(), now);
        invoice = self.save_invoice(&invoice).await?;

        match self.gateway.create_invoice(&request).await {
            Ok(artifact) => {
                info!(%key, external_id = %artifact.external_id, "invoice published");
                invoice
                    .payment
                    .record_artifact(artifact.external_id, artifact.order_id, artifact.url);
                self.save_invoice(&invoice).await
            }
            Err(err) => {
                warn!(%key, error = %err, "invoice publish attempt did not complete");
                invoice.payment.mark_attempt(attempt_state_for(&err));
                self.save_invoice(&invoice).await?;
                Err(LifecycleError::gateway(&key, err))
            }
        }
    }

    pub(crate) async fn finish_invoice_send(
        &self,
        mut invoice: Invoice,
        now: DateTime<Utc>,
    ) -> Result<Invoice, LifecycleError> {
        if invoice.status == shine_core::InvoiceStatus::Draft {
            invoice.send(now)?;
        }
        let newly_notified = invoice.notifications.insert(NotificationKind::InvoiceSent);
        let invoice = self.save_invoice(&invoice).await?;
        info!(invoice = %invoice.invoice_number, "invoice sent");
        if newly_notified {
            self.deliver(invoice_notification(&invoice, NotificationKind::InvoiceSent))
                .await;
        }
        Ok(invoice)
    }
}

fn invoice_request(invoice: &Invoice) -> Result<InvoiceRequest, ContractError> {
    let line_items = invoice
        .line_items
        .iter()
        .map(|item| {
            to_minor_units(item.unit_amount)
                .filter(|minor| *minor >= 0)
                .map(|unit_amount_minor| GatewayLineItem {
                    name: item.name.clone(),
                    quantity: item.quantity,
                    unit_amount_minor,
                })
                .ok_or_else(|| ContractError::Validation(format!("{} cannot be charged", item.unit_amount)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let terms = invoice.service_terms.trim();
    Ok(InvoiceRequest {
        reference: invoice.invoice_number.to_string(),
        currency: invoice.currency.clone(),
        buyer: Buyer {
            name: invoice.client.name.clone(),
            email: invoice.client.email.clone(),
        },
        line_items,
        due_date: invoice.due_date,
        payment_terms: invoice.payment_terms.clone(),
        description: (!terms.is_empty()).then(|| terms.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn invoice(service_terms: &str) -> Invoice {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let draft = InvoiceDraft {
            client: ClientDetails {
                name: "Harbour Dental".into(),
                email: "accounts@harbourdental.example".into(),
                phone: None,
                company: None,
            },
            line_items: vec![InvoiceLineItem {
                name: "Deep clean".into(),
                description: None,
                quantity: 2,
                unit_amount: Decimal::new(18_950, 2),
            }],
            due_date: NaiveDate::from_ymd_opt(2026, 3, 30).unwrap(),
            payment_terms: "14 days".into(),
            service_terms: service_terms.into(),
            external_reference: None,
        };
        let number = shine_core::ContractNumber::from_sequence("INV", 2026, 7).unwrap();
        Invoice::new(Uuid::nil(), number, draft, now).unwrap()
    }

    #[test]
    fn gateway_request_carries_cents_and_optional_description() {
        let request = invoice_request(&invoice("  ")).unwrap();
        assert_eq!(request.reference, "INV-26-0007");
        assert_eq!(request.line_items[0].unit_amount_minor, 18_950);
        assert_eq!(request.line_items[0].quantity, 2);
        assert_eq!(request.description, None);
        assert_eq!(request.publish_key(), "publish-INV-26-0007");

        let described = invoice_request(&invoice("Includes window tracks")).unwrap();
        assert_eq!(described.description.as_deref(), Some("Includes window tracks"));
    }

    #[test]
    fn negative_line_amounts_never_reach_the_gateway() {
        let mut stored = invoice("");
        stored.line_items.push(InvoiceLineItem {
            name: "Recurring service discount".into(),
            description: None,
            quantity: 1,
            unit_amount: Decimal::new(-950, 2),
        });
        assert!(matches!(invoice_request(&stored), Err(ContractError::Validation(_))));
    }
}
