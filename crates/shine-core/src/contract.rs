//! Service contract entity and its status state machine.
//!
//! Every mutation takes `now` explicitly; nothing here reads the clock.

use std::collections::BTreeSet;
use std::fmt;

use base64::Engine as _;
use chrono::{DateTime, Days, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ContractError;
use crate::money::{deposit_for, round_cents, CURRENCY};
use crate::numbering::ContractNumber;
use crate::payment::{ExternalPaymentStatus, PaymentLinkage};
use crate::quote::PriceBreakdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    AirbnbLongTerm,
    CommercialRecurring,
    CommercialOneTime,
    ResidentialRecurring,
    GeneralService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Draft,
    Sent,
    Signed,
    Active,
    Completed,
    Cancelled,
    Expired,
}

impl ContractStatus {
    pub const ALL: [ContractStatus; 7] = [
        Self::Draft,
        Self::Sent,
        Self::Signed,
        Self::Active,
        Self::Completed,
        Self::Cancelled,
        Self::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Signed => "signed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// The full edge table. Forward edges never skip a state.
    pub fn can_transition_to(self, next: ContractStatus) -> bool {
        use ContractStatus::*;
        match (self, next) {
            (Draft, Sent) | (Sent, Signed) | (Signed, Active) | (Active, Completed) => true,
            (Draft | Sent, Expired) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentFrequency {
    #[serde(rename = "weekly")]
    Weekly,
    #[serde(rename = "bi-weekly")]
    BiWeekly,
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "one-time")]
    OneTime,
}

impl PaymentFrequency {
    pub fn label(self) -> &'static str {
        match self {
            Self::Weekly => "Weekly",
            Self::BiWeekly => "Bi-weekly",
            Self::Monthly => "Monthly",
            Self::OneTime => "One-time",
        }
    }
}

/// The business side of every agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderIdentity {
    pub name: &'static str,
    pub abn: &'static str,
    pub email: &'static str,
    pub phone: &'static str,
    pub address: &'static str,
}

pub const PROVIDER: ProviderIdentity = ProviderIdentity {
    name: "Shine Cleaning Services Pty Ltd",
    abn: "53 004 085 616",
    email: "contracts@shinecleaning.com.au",
    phone: "+61 2 9000 1234",
    address: "Level 2, 88 George Street, Parramatta NSW 2150",
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetails {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

impl ClientDetails {
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.name.trim().is_empty() {
            return Err(ContractError::validation("client name is required"));
        }
        let email = self.email.trim();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            return Err(ContractError::validation(format!(
                "client email `{email}` is not a valid address"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceDetails {
    pub description: String,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub special_requirements: Option<String>,
    #[serde(default)]
    pub property_address: Option<String>,
    #[serde(default)]
    pub property_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTerm {
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub duration_months: Option<u32>,
    #[serde(default)]
    pub auto_renew: bool,
}

/// Longest term a single agreement may run, in months.
pub const MAX_TERM_MONTHS: u32 = 120;

impl ContractTerm {
    /// Months covered by the term, between 1 and [`MAX_TERM_MONTHS`]. An end
    /// date may sit on the anniversary or the day before it.
    pub fn months(&self) -> Result<Option<u32>, ContractError> {
        if let Some(months) = self.duration_months {
            if !(1..=MAX_TERM_MONTHS).contains(&months) {
                return Err(ContractError::validation(format!(
                    "duration_months must be between 1 and {MAX_TERM_MONTHS}"
                )));
            }
        }
        let months = self.matched_months()?;
        if months.is_some_and(|m| m > MAX_TERM_MONTHS) {
            return Err(ContractError::validation(format!(
                "a term may not run longer than {MAX_TERM_MONTHS} months"
            )));
        }
        Ok(months)
    }

    fn matched_months(&self) -> Result<Option<u32>, ContractError> {
        match (self.end_date, self.duration_months) {
            (None, months) => Ok(months),
            (Some(end), Some(months)) => {
                if self.ends_after(months) == Some(end)
                    || self.ends_after(months).and_then(|d| d.checked_sub_days(Days::new(1)))
                        == Some(end)
                {
                    Ok(Some(months))
                } else {
                    Err(ContractError::validation(format!(
                        "end_date {end} does not match start_date {} plus {months} month(s)",
                        self.start_date
                    )))
                }
            }
            (Some(end), None) => {
                if end <= self.start_date {
                    return Err(ContractError::validation("end_date must be after start_date"));
                }
                let candidate = month_index(end) - month_index(self.start_date);
                let candidate = u32::try_from(candidate.max(0)).unwrap_or(0);
                for months in [candidate, candidate + 1] {
                    let anniversary = self.ends_after(months);
                    if anniversary == Some(end)
                        || anniversary.and_then(|d| d.checked_sub_days(Days::new(1))) == Some(end)
                    {
                        return Ok(Some(months));
                    }
                }
                Err(ContractError::validation(format!(
                    "end_date {end} is not a whole number of months after {}",
                    self.start_date
                )))
            }
        }
    }

    fn ends_after(&self, months: u32) -> Option<NaiveDate> {
        self.start_date.checked_add_months(Months::new(months))
    }

    /// Last covered day, when the term is bounded.
    pub fn effective_end(&self) -> Option<NaiveDate> {
        self.end_date.or_else(|| {
            self.duration_months
                .and_then(|m| self.ends_after(m))
                .and_then(|d| d.checked_sub_days(Days::new(1)))
        })
    }
}

fn month_index(date: NaiveDate) -> i64 {
    use chrono::Datelike;
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

/// How the per-period amount is picked from a quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PricePoint {
    Low,
    High,
    /// A negotiated figure inside the quoted range.
    Confirmed { amount: Decimal },
    /// Jobs the calculator refuses to price automatically.
    Manual { amount: Decimal, note: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalOverride {
    pub amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialTerms {
    pub payment_frequency: PaymentFrequency,
    pub payment_amount_per_period: Decimal,
    pub periods: Option<u32>,
    pub total_contract_value: Decimal,
    #[serde(default)]
    pub total_override: Option<TotalOverride>,
    pub currency: String,
    pub deposit: Decimal,
    pub price_point: PricePoint,
    pub quote: PriceBreakdown,
}

impl FinancialTerms {
    /// Derive the financial block from calculator output. The only place the
    /// contract total is computed.
    pub fn derive(
        payment_frequency: PaymentFrequency,
        term: &ContractTerm,
        quote: PriceBreakdown,
        price_point: PricePoint,
        total_override: Option<TotalOverride>,
    ) -> Result<Self, ContractError> {
        let (amount, deposit) = match (&price_point, quote.total) {
            (PricePoint::Low, Some(total)) => (total.low, quote.deposit.unwrap_or_else(|| deposit_for(total.low))),
            (PricePoint::High, Some(total)) => (total.high, deposit_for(total.high)),
            (PricePoint::Confirmed { amount }, Some(total)) => {
                if *amount < total.low || *amount > total.high {
                    return Err(ContractError::validation(format!(
                        "confirmed amount {amount} is outside the quoted range {}..{}",
                        total.low, total.high
                    )));
                }
                (round_cents(*amount), deposit_for(*amount))
            }
            (PricePoint::Manual { amount, note }, None) => {
                if note.trim().is_empty() {
                    return Err(ContractError::validation("a manual quote needs a note"));
                }
                (round_cents(*amount), deposit_for(*amount))
            }
            (PricePoint::Manual { .. }, Some(_)) => {
                return Err(ContractError::validation(
                    "manual pricing is only accepted when the quote requires it",
                ))
            }
            (_, None) => {
                return Err(ContractError::validation(
                    "this job requires a manual quote; supply a manual price point",
                ))
            }
        };
        if amount <= Decimal::ZERO {
            return Err(ContractError::validation("payment amount must be positive"));
        }

        let periods = match payment_frequency {
            PaymentFrequency::OneTime => Some(1),
            PaymentFrequency::Monthly => term.months()?,
            PaymentFrequency::Weekly => term.months()?.map(|m| (m * 52 + 6) / 12),
            PaymentFrequency::BiWeekly => term.months()?.map(|m| (m * 26 + 6) / 12),
        };
        // Validate term consistency even for one-off billing.
        term.months()?;

        let total_contract_value = match (&total_override, periods) {
            (Some(o), _) => {
                if o.reason.trim().is_empty() || o.amount <= Decimal::ZERO {
                    return Err(ContractError::validation(
                        "a total override needs a positive amount and a reason",
                    ));
                }
                round_cents(o.amount)
            }
            (None, Some(n)) if n > 0 => round_cents(amount * Decimal::from(n)),
            (None, _) => {
                return Err(ContractError::validation(
                    "recurring contracts need duration_months or end_date to value the contract",
                ))
            }
        };

        Ok(Self {
            payment_frequency,
            payment_amount_per_period: amount,
            periods,
            total_contract_value,
            total_override,
            currency: CURRENCY.to_string(),
            deposit,
            price_point,
            quote,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

/// Signature image as captured by the signing pad, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureImage {
    pub format: ImageFormat,
    pub data: String,
}

impl SignatureImage {
    /// Accepts `data:image/png;base64,...` style URLs.
    pub fn from_data_url(url: &str) -> Result<Self, ContractError> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| ContractError::validation("signature must be a data URL"))?;
        let (mime, data) = rest
            .split_once(";base64,")
            .ok_or_else(|| ContractError::validation("signature data URL must be base64"))?;
        let format = match mime {
            "image/png" => ImageFormat::Png,
            "image/jpeg" | "image/jpg" => ImageFormat::Jpeg,
            other => {
                return Err(ContractError::validation(format!(
                    "unsupported signature image type `{other}`"
                )))
            }
        };
        let image = Self {
            format,
            data: data.to_string(),
        };
        image.decode()?;
        Ok(image)
    }

    pub fn decode(&self) -> Result<Vec<u8>, ContractError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.data.trim())
            .map_err(|err| ContractError::validation(format!("signature is not base64: {err}")))?;
        if bytes.is_empty() {
            return Err(ContractError::validation("signature image is empty"));
        }
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSignature {
    pub image: SignatureImage,
    pub signed_at: DateTime<Utc>,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessSignature {
    pub image: SignatureImage,
    pub signed_at: DateTime<Utc>,
    pub signer: String,
}

/// Pointer to the last rendered PDF. A cache, never a source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub path: String,
    pub sha256: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ContractSent,
    PaymentConfirmed,
    InvoiceSent,
}

/// Admin-supplied fields for a new contract. Totals are never accepted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDraft {
    pub contract_type: ContractType,
    pub client: ClientDetails,
    pub service: ServiceDetails,
    pub term: ContractTerm,
    pub payment_frequency: PaymentFrequency,
    pub price_point: PricePoint,
    #[serde(default)]
    pub total_override: Option<TotalOverride>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractEdit {
    #[serde(default)]
    pub client: Option<ClientDetails>,
    #[serde(default)]
    pub service: Option<ServiceDetails>,
    #[serde(default)]
    pub term: Option<ContractTerm>,
    #[serde(default)]
    pub payment_frequency: Option<PaymentFrequency>,
    #[serde(default)]
    pub price_point: Option<PricePoint>,
    /// `Some(None)` (an explicit JSON `null`) clears an existing override.
    #[serde(default, deserialize_with = "present")]
    pub total_override: Option<Option<TotalOverride>>,
}

/// Distinguishes a field sent as `null` from one left out.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ContractEdit {
    fn touches_financials(&self) -> bool {
        self.term.is_some()
            || self.payment_frequency.is_some()
            || self.price_point.is_some()
            || self.total_override.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub contract_number: ContractNumber,
    pub version: u64,
    pub contract_type: ContractType,
    pub status: ContractStatus,
    pub client: ClientDetails,
    pub service: ServiceDetails,
    pub financials: FinancialTerms,
    pub term: ContractTerm,
    #[serde(default)]
    pub client_signature: Option<ClientSignature>,
    #[serde(default)]
    pub business_signature: Option<BusinessSignature>,
    #[serde(default)]
    pub document: Option<DocumentRef>,
    #[serde(default)]
    pub payment: PaymentLinkage,
    #[serde(default)]
    pub notifications: BTreeSet<NotificationKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub viewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_reminded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
}

impl Contract {
    /// Build a draft from calculator output and an allocated number.
    pub fn new(
        id: Uuid,
        contract_number: ContractNumber,
        draft: ContractDraft,
        quote: PriceBreakdown,
        now: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        draft.client.validate()?;
        if draft.service.description.trim().is_empty() {
            return Err(ContractError::validation("service description is required"));
        }
        let financials = FinancialTerms::derive(
            draft.payment_frequency,
            &draft.term,
            quote,
            draft.price_point,
            draft.total_override,
        )?;
        Ok(Self {
            id,
            contract_number,
            version: 0,
            contract_type: draft.contract_type,
            status: ContractStatus::Draft,
            client: draft.client,
            service: draft.service,
            financials,
            term: draft.term,
            client_signature: None,
            business_signature: None,
            document: None,
            payment: PaymentLinkage::default(),
            notifications: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            sent_at: None,
            viewed_at: None,
            last_reminded_at: None,
            activated_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        })
    }

    fn guard(&self, to: ContractStatus) -> Result<(), ContractError> {
        if self.status.can_transition_to(to) {
            Ok(())
        } else {
            Err(ContractError::illegal(self.status, to, "edge not in the transition table"))
        }
    }

    pub fn is_one_time(&self) -> bool {
        self.financials.payment_frequency == PaymentFrequency::OneTime
            || self.contract_type == ContractType::CommercialOneTime
    }

    /// Pre-signature edits. Financial terms are frozen once the contract is
    /// sent because a payment artifact was priced from them.
    pub fn edit(&mut self, edit: ContractEdit, now: DateTime<Utc>) -> Result<(), ContractError> {
        match self.status {
            ContractStatus::Draft => {}
            ContractStatus::Sent if !edit.touches_financials() => {}
            ContractStatus::Sent => {
                return Err(ContractError::illegal(
                    self.status,
                    self.status,
                    "financial terms cannot change after the contract was sent",
                ))
            }
            other => {
                return Err(ContractError::illegal(
                    other,
                    other,
                    "only unsigned contracts can be edited",
                ))
            }
        }

        let reprice = edit.touches_financials();
        let mut next = self.clone();
        if let Some(client) = edit.client {
            client.validate()?;
            next.client = client;
        }
        if let Some(service) = edit.service {
            if service.description.trim().is_empty() {
                return Err(ContractError::validation("service description is required"));
            }
            next.service = service;
        }
        if let Some(term) = edit.term {
            next.term = term;
        }
        if reprice {
            let f = &self.financials;
            next.financials = FinancialTerms::derive(
                edit.payment_frequency.unwrap_or(f.payment_frequency),
                &next.term,
                f.quote.clone(),
                edit.price_point.unwrap_or_else(|| f.price_point.clone()),
                edit.total_override.unwrap_or_else(|| f.total_override.clone()),
            )?;
        }
        next.updated_at = now;
        *self = next;
        Ok(())
    }

    pub fn send(&mut self, now: DateTime<Utc>) -> Result<(), ContractError> {
        self.guard(ContractStatus::Sent)?;
        self.client.validate()?;
        if self.financials.payment_amount_per_period <= Decimal::ZERO
            || self.financials.total_contract_value <= Decimal::ZERO
        {
            return Err(ContractError::validation("financial terms are incomplete"));
        }
        self.status = ContractStatus::Sent;
        self.sent_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn sign(&mut self, signature: ClientSignature, now: DateTime<Utc>) -> Result<(), ContractError> {
        self.guard(ContractStatus::Signed)?;
        signature.image.decode()?;
        if signature.ip_address.trim().is_empty() {
            return Err(ContractError::validation("signer network address is required"));
        }
        self.client_signature = Some(signature);
        self.status = ContractStatus::Signed;
        self.updated_at = now;
        Ok(())
    }

    pub fn activate(&mut self, manual_confirmation: bool, now: DateTime<Utc>) -> Result<(), ContractError> {
        self.guard(ContractStatus::Active)?;
        if !manual_confirmation && now.date_naive() < self.term.start_date {
            return Err(ContractError::illegal(
                self.status,
                ContractStatus::Active,
                format!("start date {} has not been reached", self.term.start_date),
            ));
        }
        self.status = ContractStatus::Active;
        self.activated_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, manual: bool, now: DateTime<Utc>) -> Result<(), ContractError> {
        self.guard(ContractStatus::Completed)?;
        let ended = self
            .term
            .effective_end()
            .is_some_and(|end| now.date_naive() >= end);
        if !ended && !(manual && self.is_one_time()) {
            return Err(ContractError::illegal(
                self.status,
                ContractStatus::Completed,
                "the term has not ended and manual completion is only for one-time services",
            ));
        }
        self.status = ContractStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Cancel and drop any unpaid payment linkage. Returns the external id the
    /// caller should ask the gateway to void.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<Option<String>, ContractError> {
        self.guard(ContractStatus::Cancelled)?;
        let voided = if self.payment.status == ExternalPaymentStatus::Completed {
            None
        } else {
            let external_id = self.payment.external_id.clone();
            self.payment = PaymentLinkage::default();
            external_id
        };
        self.status = ContractStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancellation_reason = Some(reason.to_string());
        self.updated_at = now;
        Ok(voided)
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), ContractError> {
        self.guard(ContractStatus::Expired)?;
        if !self.is_past_end(now) {
            return Err(ContractError::illegal(
                self.status,
                ContractStatus::Expired,
                "the end date has not passed",
            ));
        }
        self.status = ContractStatus::Expired;
        self.updated_at = now;
        Ok(())
    }

    fn is_past_end(&self, now: DateTime<Utc>) -> bool {
        self.term
            .effective_end()
            .is_some_and(|end| now.date_naive() > end)
    }

    /// Lazy expiry, evaluated whenever the contract is read.
    pub fn refresh_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if matches!(self.status, ContractStatus::Draft | ContractStatus::Sent) && self.is_past_end(now) {
            self.status = ContractStatus::Expired;
            self.updated_at = now;
            true
        } else {
            false
        }
    }

    pub fn countersign(&mut self, signature: BusinessSignature, now: DateTime<Utc>) -> Result<(), ContractError> {
        if !matches!(self.status, ContractStatus::Signed | ContractStatus::Active) {
            return Err(ContractError::illegal(
                self.status,
                self.status,
                "only client-signed contracts can be countersigned",
            ));
        }
        signature.image.decode()?;
        if signature.signer.trim().is_empty() {
            return Err(ContractError::validation("countersignature needs a signer"));
        }
        self.business_signature = Some(signature);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_viewed(&mut self, now: DateTime<Utc>) {
        if self.viewed_at.is_none() {
            self.viewed_at = Some(now);
            self.updated_at = now;
        }
    }

    pub fn record_reminder(&mut self, now: DateTime<Utc>) -> Result<(), ContractError> {
        if self.status != ContractStatus::Sent {
            return Err(ContractError::illegal(
                self.status,
                self.status,
                "reminders are only sent for contracts awaiting signature",
            ));
        }
        self.last_reminded_at = Some(now);
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::attributes::{
        ConditionTier, RecurringFrequency, ServiceAttributes, ServiceCategory, ServiceTier,
        SizeMetric, UrgencyTier,
    };
    use crate::pricing::PricingRuleTable;
    use crate::quote::calculate;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    pub(crate) const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

    pub(crate) fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 0, 0).single().unwrap()
    }

    pub(crate) fn quote() -> PriceBreakdown {
        let attrs = ServiceAttributes {
            category: ServiceCategory::Residential,
            service_tier: ServiceTier::Regular,
            size: SizeMetric::Bedrooms(3),
            condition: ConditionTier::Standard,
            urgency: UrgencyTier::Standard,
            timing: Default::default(),
            distance_km: Decimal::ZERO,
            frequency: RecurringFrequency::Monthly,
            subscription: false,
            add_ons: Default::default(),
            visits_per_week: None,
        };
        calculate(&PricingRuleTable::embedded().unwrap(), &attrs).unwrap()
    }

    pub(crate) fn draft() -> ContractDraft {
        ContractDraft {
            contract_type: ContractType::ResidentialRecurring,
            client: ClientDetails {
                name: "Priya Raman".into(),
                email: "priya@example.com".into(),
                phone: None,
                company: None,
            },
            service: ServiceDetails {
                description: "Monthly regular clean of a three bedroom townhouse".into(),
                ..Default::default()
            },
            term: ContractTerm {
                start_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                end_date: None,
                duration_months: Some(12),
                auto_renew: false,
            },
            payment_frequency: PaymentFrequency::Monthly,
            price_point: PricePoint::Low,
            total_override: None,
        }
    }

    pub(crate) fn contract() -> Contract {
        Contract::new(
            Uuid::new_v4(),
            ContractNumber::parse("CSA-26-0001").unwrap(),
            draft(),
            quote(),
            at(2026, 2, 1),
        )
        .unwrap()
    }

    fn signature() -> ClientSignature {
        ClientSignature {
            image: SignatureImage {
                format: ImageFormat::Png,
                data: PIXEL_PNG.into(),
            },
            signed_at: at(2026, 2, 3),
            ip_address: "203.0.113.7".into(),
        }
    }

    #[test]
    fn total_is_rate_times_periods() {
        let c = contract();
        // 3br regular 190..260, monthly discount 5% -> 180.50
        assert_eq!(c.financials.payment_amount_per_period, dec!(180.50));
        assert_eq!(c.financials.periods, Some(12));
        assert_eq!(c.financials.total_contract_value, dec!(2166.00));
        assert_eq!(c.status, ContractStatus::Draft);
    }

    #[test]
    fn weekly_and_biweekly_periods_follow_the_calendar() {
        let mut d = draft();
        d.payment_frequency = PaymentFrequency::Weekly;
        let c = Contract::new(Uuid::new_v4(), ContractNumber::parse("CSA-26-0002").unwrap(), d.clone(), quote(), at(2026, 2, 1)).unwrap();
        assert_eq!(c.financials.periods, Some(52));

        d.payment_frequency = PaymentFrequency::BiWeekly;
        d.term.duration_months = Some(3);
        let c = Contract::new(Uuid::new_v4(), ContractNumber::parse("CSA-26-0003").unwrap(), d, quote(), at(2026, 2, 1)).unwrap();
        assert_eq!(c.financials.periods, Some(7));
    }

    #[test]
    fn terms_are_bounded_to_ten_years() {
        let term = |duration_months, end_date| ContractTerm {
            start_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            end_date,
            duration_months,
            auto_renew: false,
        };
        assert_eq!(term(Some(MAX_TERM_MONTHS), None).months().unwrap(), Some(120));
        for months in [0, MAX_TERM_MONTHS + 1, u32::MAX] {
            assert!(matches!(
                term(Some(months), None).months(),
                Err(ContractError::Validation(_))
            ));
        }
        let far = NaiveDate::from_ymd_opt(2046, 3, 1);
        assert!(matches!(term(None, far).months(), Err(ContractError::Validation(_))));

        let mut d = draft();
        d.payment_frequency = PaymentFrequency::Weekly;
        d.term.duration_months = Some(u32::MAX);
        assert!(Contract::new(Uuid::new_v4(), ContractNumber::parse("CSA-26-0099").unwrap(), d, quote(), at(2026, 2, 1)).is_err());
    }

    #[test]
    fn end_date_must_agree_with_duration() {
        let mut d = draft();
        d.term.end_date = NaiveDate::from_ymd_opt(2027, 2, 28);
        assert!(Contract::new(Uuid::new_v4(), ContractNumber::parse("CSA-26-0004").unwrap(), d.clone(), quote(), at(2026, 2, 1)).is_ok());

        d.term.end_date = NaiveDate::from_ymd_opt(2026, 11, 30);
        assert!(matches!(
            Contract::new(Uuid::new_v4(), ContractNumber::parse("CSA-26-0005").unwrap(), d.clone(), quote(), at(2026, 2, 1)),
            Err(ContractError::Validation(_))
        ));

        d.term.duration_months = None;
        let c = Contract::new(Uuid::new_v4(), ContractNumber::parse("CSA-26-0006").unwrap(), d, quote(), at(2026, 2, 1)).unwrap();
        assert_eq!(c.financials.periods, Some(9));
    }

    #[test]
    fn confirmed_amount_must_sit_inside_the_quote() {
        let mut d = draft();
        d.price_point = PricePoint::Confirmed { amount: dec!(500) };
        assert!(matches!(
            Contract::new(Uuid::new_v4(), ContractNumber::parse("CSA-26-0007").unwrap(), d, quote(), at(2026, 2, 1)),
            Err(ContractError::Validation(_))
        ));
    }

    #[test]
    fn happy_path_walks_every_state() {
        let mut c = contract();
        c.send(at(2026, 2, 2)).unwrap();
        c.sign(signature(), at(2026, 2, 3)).unwrap();
        c.activate(false, at(2026, 3, 1)).unwrap();
        c.complete(false, at(2027, 2, 28)).unwrap();
        assert_eq!(c.status, ContractStatus::Completed);
        assert_eq!(c.client_signature.as_ref().unwrap().ip_address, "203.0.113.7");
    }

    #[test]
    fn skipping_states_is_rejected_and_leaves_entity_unchanged() {
        let mut c = contract();
        let before = c.clone();
        let err = c.activate(true, at(2026, 3, 2)).unwrap_err();
        assert!(matches!(
            err,
            ContractError::InvalidStateTransition { from: ContractStatus::Draft, to: ContractStatus::Active, .. }
        ));
        assert_eq!(c, before);
        assert!(c.sign(signature(), at(2026, 2, 3)).is_err());
        assert!(c.complete(true, at(2026, 2, 3)).is_err());
        assert_eq!(c, before);
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use ContractStatus::*;
        let allowed = [
            (Draft, Sent), (Sent, Signed), (Signed, Active), (Active, Completed),
            (Draft, Cancelled), (Sent, Cancelled), (Signed, Cancelled), (Active, Cancelled),
            (Draft, Expired), (Sent, Expired),
        ];
        for from in ContractStatus::ALL {
            for to in ContractStatus::ALL {
                assert_eq!(from.can_transition_to(to), allowed.contains(&(from, to)), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn activation_waits_for_start_unless_confirmed() {
        let mut c = contract();
        c.send(at(2026, 2, 2)).unwrap();
        c.sign(signature(), at(2026, 2, 3)).unwrap();
        assert!(c.activate(false, at(2026, 2, 20)).is_err());
        c.activate(true, at(2026, 2, 20)).unwrap();
        assert_eq!(c.status, ContractStatus::Active);
        assert!(c.complete(true, at(2026, 6, 1)).is_err(), "recurring contracts cannot be completed early");
    }

    #[test]
    fn signing_requires_signature_and_origin() {
        let mut c = contract();
        c.send(at(2026, 2, 2)).unwrap();
        let mut sig = signature();
        sig.ip_address = " ".into();
        assert!(matches!(c.sign(sig, at(2026, 2, 3)), Err(ContractError::Validation(_))));
        let mut sig = signature();
        sig.image.data = String::new();
        assert!(c.sign(sig, at(2026, 2, 3)).is_err());
        assert_eq!(c.status, ContractStatus::Sent);
    }

    #[test]
    fn cancel_voids_unpaid_linkage() {
        let mut c = contract();
        c.payment.external_id = Some("pl_123".into());
        c.payment.status = ExternalPaymentStatus::Created;
        let voided = c.cancel("client changed plans", at(2026, 2, 2)).unwrap();
        assert_eq!(voided.as_deref(), Some("pl_123"));
        assert_eq!(c.payment, PaymentLinkage::default());
        assert!(c.cancel("again", at(2026, 2, 3)).is_err());
    }

    #[test]
    fn unsigned_contracts_expire_lazily() {
        let mut c = contract();
        c.send(at(2026, 2, 2)).unwrap();
        assert!(!c.refresh_expiry(at(2027, 2, 28)));
        assert!(c.refresh_expiry(at(2027, 3, 1)));
        assert_eq!(c.status, ContractStatus::Expired);
    }

    #[test]
    fn financial_edits_are_frozen_after_send() {
        let mut c = contract();
        c.edit(ContractEdit { price_point: Some(PricePoint::High), ..Default::default() }, at(2026, 2, 1)).unwrap();
        assert_eq!(c.financials.payment_amount_per_period, dec!(247.00));
        c.send(at(2026, 2, 2)).unwrap();
        assert!(c.edit(ContractEdit { price_point: Some(PricePoint::Low), ..Default::default() }, at(2026, 2, 2)).is_err());
        let mut client = c.client.clone();
        client.phone = Some("0400 000 000".into());
        c.edit(ContractEdit { client: Some(client), ..Default::default() }, at(2026, 2, 2)).unwrap();
    }

    #[test]
    fn data_url_signatures_are_decoded() {
        let sig = SignatureImage::from_data_url(&format!("data:image/png;base64,{PIXEL_PNG}")).unwrap();
        assert_eq!(sig.format, ImageFormat::Png);
        assert!(SignatureImage::from_data_url("data:image/gif;base64,AAAA").is_err());
    }

    #[test]
    fn null_override_clears_and_absent_override_keeps() {
        let cleared: ContractEdit = serde_json::from_str(r#"{"total_override": null}"#).unwrap();
        assert_eq!(cleared.total_override, Some(None));
        let untouched: ContractEdit = serde_json::from_str("{}").unwrap();
        assert_eq!(untouched.total_override, None);
    }
}
