use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shine_core::contract::{BusinessSignature, ClientSignature, DocumentRef, NotificationKind};
use shine_core::money::to_minor_units;
use shine_core::{
    calculate, AttemptState, Contract, ContractDraft, ContractEdit, ContractError, ContractStatus,
    NumberSource, PriceBreakdown, ServiceAttributes,
};
use shine_gateway::{Buyer, GatewayError, GatewayLineItem, PaymentLinkRequest};
use shine_storage::{ContractFilter, StoreError};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::numbering::DocumentKind;
use crate::{contract_notification, LifecycleError, Shared, MAX_NUMBER_ATTEMPTS};

/// A contract id, optionally pinned to the version the caller last saw.
/// A pinned call fails with `InvalidStateTransition` if anyone else wrote
/// the contract in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Target {
    pub id: Uuid,
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl Target {
    pub fn at(id: Uuid, version: u64) -> Self {
        Self {
            id,
            expected_version: Some(version),
        }
    }
}

impl From<Uuid> for Target {
    fn from(id: Uuid) -> Self {
        Self {
            id,
            expected_version: None,
        }
    }
}

/// A contract request: the booking attributes are priced here, never taken
/// from the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct NewContract {
    pub service_attributes: ServiceAttributes,
    #[serde(flatten)]
    pub draft: ContractDraft,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedContract {
    pub contract: Contract,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

pub struct ContractService {
    shared: Arc<Shared>,
}

impl ContractService {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn quote(&self, attrs: &ServiceAttributes) -> Result<PriceBreakdown, LifecycleError> {
        Ok(calculate(&self.shared.rules, attrs)?)
    }

    pub async fn create(&self, request: NewContract) -> Result<Contract, LifecycleError> {
        let quote = self.quote(&request.service_attributes)?;
        let now = self.shared.clock.now();
        for _ in 0..MAX_NUMBER_ATTEMPTS {
            let allocated = self
                .shared
                .numbering
                .allocate(DocumentKind::Contract)
                .await
                .map_err(anyhow::Error::from)?;
            let contract = Contract::new(
                Uuid::new_v4(),
                allocated.number.clone(),
                request.draft.clone(),
                quote.clone(),
                now,
            )?;
            match self.shared.store.insert_contract(&contract).await {
                Ok(saved) => {
                    info!(
                        contract = %saved.contract_number,
                        total = %saved.financials.total_contract_value,
                        "contract drafted"
                    );
                    return Ok(saved);
                }
                Err(StoreError::Duplicate { key, .. }) if allocated.source == NumberSource::Fallback => {
                    warn!(number = %key, "fallback contract number collided, allocating again");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(anyhow!("no unique contract number after {MAX_NUMBER_ATTEMPTS} attempts").into())
    }

    /// Reads apply lazy expiry and persist it when it fires.
    pub async fn get(&self, id: Uuid) -> Result<Contract, LifecycleError> {
        let contract = self.shared.store.get_contract(id).await?;
        if !contract.clone().refresh_expiry(self.shared.clock.now()) {
            return Ok(contract);
        }
        let (contract, ()) = self.mutate(id.into(), None, |_, _| Ok(())).await?;
        Ok(contract)
    }

    /// Listing shows lazily expired contracts as expired without writing.
    pub async fn list(&self, filter: &ContractFilter) -> Result<Vec<Contract>, LifecycleError> {
        let now = self.shared.clock.now();
        let unlimited = ContractFilter {
            status: None,
            limit: None,
            ..filter.clone()
        };
        let mut rows = self.shared.store.query_contracts(&unlimited).await?;
        for contract in &mut rows {
            contract.refresh_expiry(now);
        }
        rows.retain(|c| filter.matches(c));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    pub async fn edit(&self, target: impl Into<Target>, edit: ContractEdit) -> Result<Contract, LifecycleError> {
        let (contract, ()) = self.mutate(target.into(), None, |c, now| c.edit(edit, now)).await?;
        Ok(contract)
    }

    /// Payment link, then status, then the client notification. Each step is
    /// persisted before the next; calling again after a failure resumes.
    pub async fn send(&self, target: impl Into<Target>) -> Result<Contract, LifecycleError> {
        let target = target.into();
        let _guard = self.shared.locks.acquire(target.id).await;
        let mut contract = self.shared.store.get_contract(target.id).await?;
        let now = self.shared.clock.now();
        check_version(&contract, target, Some(ContractStatus::Sent))?;
        if contract.refresh_expiry(now) {
            contract = self.shared.save_contract(&contract).await?;
        }
        contract.clone().send(now)?;

        let span = info_span!("send_contract", contract = %contract.contract_number);
        async move {
            if !contract.payment.has_artifact() {
                contract = self.shared.ensure_payment_link(contract, now).await?;
            }
            self.shared.finish_contract_send(contract, now).await
        }
        .instrument(span)
        .await
    }

    pub async fn sign(&self, target: impl Into<Target>, signature: ClientSignature) -> Result<Contract, LifecycleError> {
        let (contract, ()) = self
            .mutate(target.into(), Some(ContractStatus::Signed), |c, now| c.sign(signature, now))
            .await?;
        info!(contract = %contract.contract_number, "contract signed");
        Ok(contract)
    }

    pub async fn activate(&self, target: impl Into<Target>, manual_confirmation: bool) -> Result<Contract, LifecycleError> {
        let (contract, ()) = self
            .mutate(target.into(), Some(ContractStatus::Active), |c, now| {
                c.activate(manual_confirmation, now)
            })
            .await?;
        Ok(contract)
    }

    pub async fn complete(&self, target: impl Into<Target>, manual: bool) -> Result<Contract, LifecycleError> {
        let (contract, ()) = self
            .mutate(target.into(), Some(ContractStatus::Completed), |c, now| c.complete(manual, now))
            .await?;
        Ok(contract)
    }

    /// Cancels, then asks the processor to void any unpaid artifact. The
    /// gateway call is best effort and never undoes the cancellation.
    pub async fn cancel(&self, target: impl Into<Target>, reason: &str) -> Result<Contract, LifecycleError> {
        let (contract, voided) = self
            .mutate(target.into(), Some(ContractStatus::Cancelled), |c, now| c.cancel(reason, now))
            .await?;
        info!(contract = %contract.contract_number, reason, "contract cancelled");
        if let Some(external_id) = voided {
            if let Err(err) = self.shared.gateway.cancel(&external_id).await {
                warn!(
                    contract = %contract.contract_number,
                    %external_id,
                    error = %err,
                    "could not void payment artifact at the processor"
                );
            }
        }
        Ok(contract)
    }

    pub async fn countersign(
        &self,
        target: impl Into<Target>,
        signature: BusinessSignature,
    ) -> Result<Contract, LifecycleError> {
        let (contract, ()) = self
            .mutate(target.into(), None, |c, now| c.countersign(signature, now))
            .await?;
        Ok(contract)
    }

    pub async fn mark_viewed(&self, target: impl Into<Target>) -> Result<Contract, LifecycleError> {
        let (contract, ()) = self
            .mutate(target.into(), None, |c, now| {
                c.mark_viewed(now);
                Ok(())
            })
            .await?;
        Ok(contract)
    }

    /// Stamps the reminder and re-sends the signing notification.
    pub async fn remind(&self, target: impl Into<Target>) -> Result<Contract, LifecycleError> {
        let (contract, ()) = self
            .mutate(target.into(), None, |c, now| c.record_reminder(now))
            .await?;
        let mut notification = contract_notification(&contract, NotificationKind::ContractSent);
        notification.subject = format!("Reminder: {}", notification.subject);
        self.shared.deliver(notification).await;
        Ok(contract)
    }

    /// Renders the current contract, stores the PDF by content hash and
    /// repoints the cached document reference when the content changed.
    pub async fn render_pdf(&self, id: Uuid) -> Result<RenderedContract, LifecycleError> {
        let contract = self.get(id).await?;
        let now = self.shared.clock.now();
        let bytes = shine_docs::render_contract(&contract, now.date_naive())?;
        let stored = self
            .shared
            .documents
            .store_pdf(contract.contract_number.as_str(), &bytes)
            .await?;
        if contract.document.as_ref().map(|d| d.sha256.as_str()) == Some(stored.sha256.as_str()) {
            return Ok(RenderedContract { contract, bytes });
        }
        let reference = DocumentRef {
            path: stored.relative_path.display().to_string(),
            sha256: stored.sha256.clone(),
            generated_at: now,
        };
        let (contract, ()) = self
            .mutate(id.into(), None, move |c, _| {
                c.document = Some(reference);
                Ok(())
            })
            .await?;
        Ok(RenderedContract { contract, bytes })
    }

    /// Load under the entity lock, check the pinned version, apply `op` and
    /// persist. Lazy expiry is persisted even when `op` is refused.
    async fn mutate<T>(
        &self,
        target: Target,
        intent: Option<ContractStatus>,
        op: impl FnOnce(&mut Contract, DateTime<Utc>) -> Result<T, ContractError> + Send,
    ) -> Result<(Contract, T), LifecycleError>
    where
        T: Send,
    {
        let _guard = self.shared.locks.acquire(target.id).await;
        let mut contract = self.shared.store.get_contract(target.id).await?;
        let now = self.shared.clock.now();
        check_version(&contract, target, intent)?;
        let expired = contract.refresh_expiry(now);
        match op(&mut contract, now) {
            Ok(out) => Ok((self.shared.save_contract(&contract).await?, out)),
            Err(err) => {
                if expired {
                    self.shared.save_contract(&contract).await?;
                }
                Err(err.into())
            }
        }
    }
}

fn check_version(contract: &Contract, target: Target, intent: Option<ContractStatus>) -> Result<(), ContractError> {
    match target.expected_version {
        Some(expected) if expected != contract.version => Err(ContractError::InvalidStateTransition {
            from: contract.status,
            to: intent.unwrap_or(contract.status),
            reason: format!(
                "contract {} is at version {}, not {expected}",
                contract.contract_number, contract.version
            ),
        }),
        _ => Ok(()),
    }
}

impl Shared {
    /// Create (or recover) the contract's payment link. The contract number
    /// is the idempotency key, so a repeat never makes a second link.
    pub(crate) async fn ensure_payment_link(
        &self,
        mut contract: Contract,
        now: DateTime<Utc>,
    ) -> Result<Contract, LifecycleError> {
        let key = contract.contract_number.to_string();
        if contract.payment.is_ambiguous() {
            match self.gateway.lookup(&key).await {
                Ok(Some(artifact)) => {
                    info!(%key, external_id = %artifact.external_id, "ambiguous payment link found at the processor");
                    contract
                        .payment
                        .record_artifact(artifact.external_id, artifact.order_id, artifact.url);
                    return self.save_contract(&contract).await;
                }
                Ok(None) => {}
                Err(err) => return Err(LifecycleError::gateway(&key, err)),
            }
        }

        let request = payment_link_request(&contract, self.payment_redirect_url.clone())?;
        contract.payment.begin_attempt(key.clone(), now);
        contract = self.save_contract(&contract).await?;

        match self.gateway.create_payment_link(&request).await {
            Ok(artifact) => {
                info!(%key, external_id = %artifact.external_id, "payment link created");
                contract
                    .payment
                    .record_artifact(artifact.external_id, artifact.order_id, artifact.url);
                self.save_contract(&contract).await
            }
            Err(err) => {
                warn!(%key, error = %err, "payment link attempt did not complete");
                contract.payment.mark_attempt(attempt_state_for(&err));
                self.save_contract(&contract).await?;
                Err(LifecycleError::gateway(&key, err))
            }
        }
    }

    /// Status change and the once-only client notification, in one write.
    pub(crate) async fn finish_contract_send(
        &self,
        mut contract: Contract,
        now: DateTime<Utc>,
    ) -> Result<Contract, LifecycleError> {
        if contract.status == ContractStatus::Draft {
            contract.send(now)?;
        }
        let newly_notified = contract.notifications.insert(NotificationKind::ContractSent);
        let contract = self.save_contract(&contract).await?;
        info!(contract = %contract.contract_number, "contract sent");
        if newly_notified {
            self.deliver(contract_notification(&contract, NotificationKind::ContractSent))
                .await;
        }
        Ok(contract)
    }
}

pub(crate) fn attempt_state_for(err: &GatewayError) -> AttemptState {
    match err {
        GatewayError::Ambiguous(_) => AttemptState::Ambiguous,
        other => AttemptState::Failed {
            reason: other.to_string(),
            retryable: other.is_retryable(),
        },
    }
}

/// The link collects the deposit; contracts too small to carry one collect
/// their first period instead.
fn payment_link_request(
    contract: &Contract,
    redirect_url: Option<String>,
) -> Result<PaymentLinkRequest, ContractError> {
    let f = &contract.financials;
    let number = contract.contract_number.as_str();
    let (name, amount) = if f.deposit > Decimal::ZERO {
        (format!("Deposit for service agreement {number}"), f.deposit)
    } else {
        (
            format!("{} service, agreement {number}", f.payment_frequency.label()),
            f.payment_amount_per_period,
        )
    };
    let unit_amount_minor = to_minor_units(amount)
        .ok_or_else(|| ContractError::Validation(format!("{amount} cannot be charged")))?;
    Ok(PaymentLinkRequest {
        idempotency_key: number.to_string(),
        reference: number.to_string(),
        description: format!("Service agreement {number}: {}", contract.service.description),
        currency: f.currency.clone(),
        line_items: vec![GatewayLineItem {
            name,
            quantity: 1,
            unit_amount_minor,
        }],
        buyer: Buyer {
            name: contract.client.name.clone(),
            email: contract.client.email.clone(),
        },
        redirect_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_versions_reject_stale_callers() {
        let json = serde_json::json!({"id": Uuid::nil(), "expected_version": 3});
        let target: Target = serde_json::from_value(json).unwrap();
        assert_eq!(target, Target::at(Uuid::nil(), 3));
        let bare: Target = Uuid::nil().into();
        assert_eq!(bare.expected_version, None);
    }

    #[test]
    fn ambiguous_errors_park_the_attempt() {
        assert_eq!(attempt_state_for(&GatewayError::Ambiguous("t".into())), AttemptState::Ambiguous);
        assert_eq!(
            attempt_state_for(&GatewayError::Unavailable("down".into())),
            AttemptState::Failed {
                reason: "payment gateway unavailable: down".into(),
                retryable: true
            }
        );
    }
}
