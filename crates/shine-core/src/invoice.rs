//! One-off invoices for single-payment commercial billing.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contract::{ClientDetails, NotificationKind};
use crate::error::ContractError;
use crate::money::{round_cents, CURRENCY};
use crate::numbering::ContractNumber;
use crate::payment::PaymentLinkage;
use crate::quote::PriceBreakdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub quantity: u32,
    pub unit_amount: Decimal,
}

impl InvoiceLineItem {
    pub fn amount(&self) -> Decimal {
        round_cents(self.unit_amount * Decimal::from(self.quantity))
    }

    /// One item per chargeable step of a priced quote, so the billed total
    /// matches the quote's low (or high) end to the cent.
    ///
    /// Processors refuse negative line amounts, so discounts are folded into
    /// the largest lines and named in their descriptions.
    pub fn from_breakdown(quote: &PriceBreakdown, high_end: bool) -> Result<Vec<Self>, ContractError> {
        if quote.total.is_none() {
            return Err(ContractError::validation(
                "cannot invoice a quote that requires a manual price",
            ));
        }
        let pick = |low: Decimal, high: Decimal| if high_end { high } else { low };
        let mut items = vec![Self {
            name: "Cleaning service".to_string(),
            description: Some(format!("Base price (rules {})", quote.rule_table_version)),
            quantity: 1,
            unit_amount: pick(quote.base.low, quote.base.high),
        }];
        let mut reductions = Vec::new();
        for item in quote.line_items() {
            let amount = pick(item.delta.low, item.delta.high);
            if amount < Decimal::ZERO {
                reductions.push((item.name, -amount));
            } else if amount > Decimal::ZERO {
                items.push(Self {
                    name: item.name,
                    description: None,
                    quantity: 1,
                    unit_amount: amount,
                });
            }
        }
        for (name, amount) in reductions {
            fold_reduction(&mut items, &name, amount)?;
        }
        Ok(items)
    }
}

fn fold_reduction(items: &mut [InvoiceLineItem], name: &str, amount: Decimal) -> Result<(), ContractError> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|a, b| items[*b].unit_amount.cmp(&items[*a].unit_amount));
    let mut left = amount;
    for index in order {
        if left.is_zero() {
            break;
        }
        let item = &mut items[index];
        let taken = left.min(item.unit_amount);
        if taken.is_zero() {
            continue;
        }
        item.unit_amount -= taken;
        left -= taken;
        let note = format!("less {name} {taken}");
        item.description = Some(match item.description.take() {
            Some(existing) => format!("{existing}; {note}"),
            None => note,
        });
    }
    if !left.is_zero() {
        return Err(ContractError::validation(format!(
            "`{name}` exceeds the amount it discounts"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub client: ClientDetails,
    pub line_items: Vec<InvoiceLineItem>,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub payment_terms: String,
    #[serde(default)]
    pub service_terms: String,
    #[serde(default)]
    pub external_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: ContractNumber,
    pub version: u64,
    pub status: InvoiceStatus,
    pub client: ClientDetails,
    pub line_items: Vec<InvoiceLineItem>,
    pub currency: String,
    pub due_date: NaiveDate,
    pub payment_terms: String,
    pub service_terms: String,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub payment: PaymentLinkage,
    #[serde(default)]
    pub notifications: BTreeSet<NotificationKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn new(
        id: Uuid,
        invoice_number: ContractNumber,
        draft: InvoiceDraft,
        now: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        draft.client.validate()?;
        validate_line_items(&draft.line_items)?;
        if draft.due_date < now.date_naive() {
            return Err(ContractError::validation("due_date is in the past"));
        }
        Ok(Self {
            id,
            invoice_number,
            version: 0,
            status: InvoiceStatus::Draft,
            client: draft.client,
            line_items: draft.line_items,
            currency: CURRENCY.to_string(),
            due_date: draft.due_date,
            payment_terms: draft.payment_terms,
            service_terms: draft.service_terms,
            external_reference: draft.external_reference,
            payment: PaymentLinkage::default(),
            notifications: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            sent_at: None,
            paid_at: None,
        })
    }

    /// Always recomputed from the line items.
    pub fn total(&self) -> Decimal {
        self.line_items.iter().map(InvoiceLineItem::amount).sum()
    }

    pub fn send(&mut self, now: DateTime<Utc>) -> Result<(), ContractError> {
        if self.status != InvoiceStatus::Draft {
            return Err(ContractError::validation(format!(
                "invoice {} is {:?}, only drafts can be sent",
                self.invoice_number, self.status
            )));
        }
        self.status = InvoiceStatus::Sent;
        self.sent_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Returns false when the invoice was already paid.
    pub fn mark_paid(&mut self, now: DateTime<Utc>) -> bool {
        match self.status {
            InvoiceStatus::Paid => false,
            _ => {
                self.status = InvoiceStatus::Paid;
                self.paid_at = Some(now);
                self.updated_at = now;
                true
            }
        }
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<Option<String>, ContractError> {
        if matches!(self.status, InvoiceStatus::Paid | InvoiceStatus::Cancelled) {
            return Err(ContractError::validation(format!(
                "invoice {} is already {:?}",
                self.invoice_number, self.status
            )));
        }
        let voided = self.payment.external_id.take();
        self.payment = PaymentLinkage::default();
        self.status = InvoiceStatus::Cancelled;
        self.updated_at = now;
        Ok(voided)
    }
}

fn validate_line_items(items: &[InvoiceLineItem]) -> Result<(), ContractError> {
    if items.is_empty() {
        return Err(ContractError::validation("an invoice needs at least one line item"));
    }
    for item in items {
        if item.name.trim().is_empty() {
            return Err(ContractError::validation("line item name is required"));
        }
        if item.quantity == 0 {
            return Err(ContractError::validation(format!(
                "line item `{}` has zero quantity",
                item.name
            )));
        }
        if item.unit_amount < Decimal::ZERO {
            return Err(ContractError::validation(format!(
                "line item `{}` has a negative amount; discount the line it reduces instead",
                item.name
            )));
        }
        if round_cents(item.unit_amount) != item.unit_amount {
            return Err(ContractError::validation(format!(
                "line item `{}` has sub-cent precision",
                item.name
            )));
        }
    }
    if items.iter().map(InvoiceLineItem::amount).sum::<Decimal>() <= Decimal::ZERO {
        return Err(ContractError::validation("invoice total must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::tests::{at, quote};
    use rust_decimal_macros::dec;

    fn draft() -> InvoiceDraft {
        InvoiceDraft {
            client: ClientDetails {
                name: "Harbour Dental".into(),
                email: "accounts@harbourdental.com.au".into(),
                phone: None,
                company: Some("Harbour Dental Pty Ltd".into()),
            },
            line_items: vec![
                InvoiceLineItem {
                    name: "Clinic deep clean".into(),
                    description: Some("Two treatment rooms and reception".into()),
                    quantity: 1,
                    unit_amount: dec!(640),
                },
                InvoiceLineItem {
                    name: "Window cleaning".into(),
                    description: None,
                    quantity: 3,
                    unit_amount: dec!(45.50),
                },
            ],
            due_date: NaiveDate::from_ymd_opt(2026, 3, 15).unwrap(),
            payment_terms: "14 days".into(),
            service_terms: "Standard commercial terms".into(),
            external_reference: None,
        }
    }

    #[test]
    fn total_is_recomputed_from_items() {
        let mut invoice = Invoice::new(Uuid::new_v4(), ContractNumber::parse("INV-26-0001").unwrap(), draft(), at(2026, 3, 1)).unwrap();
        assert_eq!(invoice.total(), dec!(776.50));
        invoice.line_items[1].quantity = 4;
        assert_eq!(invoice.total(), dec!(822.00));
    }

    #[test]
    fn rejects_empty_or_zero_quantity_items() {
        let mut d = draft();
        d.line_items[0].quantity = 0;
        assert!(Invoice::new(Uuid::new_v4(), ContractNumber::parse("INV-26-0002").unwrap(), d, at(2026, 3, 1)).is_err());
        let mut d = draft();
        d.line_items.clear();
        assert!(Invoice::new(Uuid::new_v4(), ContractNumber::parse("INV-26-0003").unwrap(), d, at(2026, 3, 1)).is_err());
    }

    #[test]
    fn breakdown_items_sum_to_quote_total() {
        let q = quote();
        let items = InvoiceLineItem::from_breakdown(&q, false).unwrap();
        let sum: Decimal = items.iter().map(InvoiceLineItem::amount).sum();
        assert_eq!(sum, q.total.unwrap().low);
        let items = InvoiceLineItem::from_breakdown(&q, true).unwrap();
        let sum: Decimal = items.iter().map(InvoiceLineItem::amount).sum();
        assert_eq!(sum, q.total.unwrap().high);
    }

    #[test]
    fn discounted_bookings_bill_without_negative_lines() {
        let q = quote();
        assert!(!q.discounts.is_empty());
        for high_end in [false, true] {
            let items = InvoiceLineItem::from_breakdown(&q, high_end).unwrap();
            assert!(items.iter().all(|item| item.unit_amount >= Decimal::ZERO));
            assert!(items.iter().all(|item| !item.name.contains("discount")));
            let sum: Decimal = items.iter().map(InvoiceLineItem::amount).sum();
            let total = q.total.unwrap();
            assert_eq!(sum, if high_end { total.high } else { total.low });
            let base = &items[0];
            assert!(base.description.as_deref().unwrap_or_default().contains("less "));
        }
        let mut d = draft();
        d.line_items.push(InvoiceLineItem {
            name: "Goodwill credit".into(),
            description: None,
            quantity: 1,
            unit_amount: dec!(-20),
        });
        assert!(Invoice::new(Uuid::new_v4(), ContractNumber::parse("INV-26-0005").unwrap(), d, at(2026, 3, 1)).is_err());
    }

    #[test]
    fn paying_twice_is_a_no_op() {
        let mut invoice = Invoice::new(Uuid::new_v4(), ContractNumber::parse("INV-26-0004").unwrap(), draft(), at(2026, 3, 1)).unwrap();
        invoice.send(at(2026, 3, 1)).unwrap();
        assert!(invoice.mark_paid(at(2026, 3, 2)));
        assert!(!invoice.mark_paid(at(2026, 3, 3)));
        assert_eq!(invoice.paid_at, Some(at(2026, 3, 2)));
    }
}
