//! Contract and invoice lifecycle orchestration.
//!
//! The services here are the only writers of contracts and invoices. Each
//! operation on an entity runs under that entity's lock and ends with a
//! version-checked store update, so two transitions on the same record can
//! never both apply. Sending is a saga whose every step is recorded on the
//! entity before the next one starts; an interrupted send resumes where it
//! stopped and reuses the same idempotency keys.

mod clock;
mod config;
mod contracts;
mod error;
mod invoices;
mod locks;
mod notify;
mod numbering;
mod reconcile;
mod webhook;

use std::sync::Arc;

use anyhow::{bail, Context};
use shine_core::contract::NotificationKind;
use shine_core::{Contract, ContractError, Invoice, PricingRuleTable, RuleTableError};
use shine_core::numbering::NumberFormatError;
use shine_gateway::{HttpGateway, HttpGatewayConfig, PaymentGateway, RecordingGateway};
use shine_storage::{DocumentCache, MemoryStore, PgStore, Store, StoreError};
use tracing::{info, warn};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ShineConfig;
pub use contracts::{ContractService, NewContract, RenderedContract, Target};
pub use error::LifecycleError;
pub use invoices::{InvoiceService, NewInvoice};
pub use notify::{LogNotifier, Notification, Notifier, RecordingNotifier};
pub use numbering::{AllocatedNumber, DocumentKind, NumberingService};
pub use reconcile::ReconcileReport;
pub use webhook::{ReconcileOutcome, WebhookData, WebhookEvent, WebhookReconciler};

pub const CRATE_NAME: &str = "shine-lifecycle";

/// Allocation retries when a fallback number collides with an existing one.
const MAX_NUMBER_ATTEMPTS: usize = 3;

/// Collaborators the engine is wired from.
pub struct Dependencies {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub rules: Arc<PricingRuleTable>,
    pub documents: DocumentCache,
    pub contract_prefix: String,
    pub invoice_prefix: String,
    pub payment_redirect_url: Option<String>,
}

impl Dependencies {
    /// Embedded pricing rules, the system clock, log notifications and the
    /// default `CSA`/`INV` prefixes.
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        documents: DocumentCache,
    ) -> Result<Self, RuleTableError> {
        Ok(Self {
            store,
            gateway,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            rules: Arc::new(PricingRuleTable::embedded()?),
            documents,
            contract_prefix: "CSA".to_string(),
            invoice_prefix: "INV".to_string(),
            payment_redirect_url: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub(crate) struct Shared {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    rules: Arc<PricingRuleTable>,
    documents: DocumentCache,
    numbering: NumberingService,
    locks: locks::EntityLocks,
    payment_redirect_url: Option<String>,
}

impl Shared {
    /// Version-checked write. Losing a race to another writer surfaces as an
    /// illegal transition from whatever state the winner left behind.
    async fn save_contract(&self, contract: &Contract) -> Result<Contract, LifecycleError> {
        match self.store.update_contract(contract).await {
            Ok(saved) => Ok(saved),
            Err(StoreError::Conflict { .. }) => {
                let current = self.store.get_contract(contract.id).await?;
                Err(ContractError::InvalidStateTransition {
                    from: current.status,
                    to: contract.status,
                    reason: format!(
                        "contract {} was changed concurrently (now version {})",
                        current.contract_number, current.version
                    ),
                }
                .into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_invoice(&self, invoice: &Invoice) -> Result<Invoice, LifecycleError> {
        match self.store.update_invoice(invoice).await {
            Ok(saved) => Ok(saved),
            Err(StoreError::Conflict { key, .. }) => Err(ContractError::Validation(format!(
                "invoice {key} was changed concurrently; reload and retry"
            ))
            .into()),
            Err(err) => Err(err.into()),
        }
    }

    /// At most once: the caller has already persisted the notification mark.
    async fn deliver(&self, notification: Notification) {
        if let Err(err) = self.notifier.notify(&notification).await {
            warn!(
                kind = ?notification.kind,
                reference = %notification.reference,
                error = %err,
                "notification could not be delivered"
            );
        }
    }
}

fn contract_notification(contract: &Contract, kind: NotificationKind) -> Notification {
    let number = &contract.contract_number;
    let subject = match kind {
        NotificationKind::ContractSent => format!("Your service agreement {number} is ready to sign"),
        NotificationKind::PaymentConfirmed => format!("Payment received for service agreement {number}"),
        NotificationKind::InvoiceSent => format!("Invoice for service agreement {number}"),
    };
    Notification {
        kind,
        reference: number.to_string(),
        recipient: contract.client.email.clone(),
        subject,
        link: contract.payment.url.clone(),
    }
}

fn invoice_notification(invoice: &Invoice, kind: NotificationKind) -> Notification {
    let number = &invoice.invoice_number;
    let subject = match kind {
        NotificationKind::PaymentConfirmed => format!("Payment received for invoice {number}"),
        _ => format!("Invoice {number} from Shine Cleaning"),
    };
    Notification {
        kind,
        reference: number.to_string(),
        recipient: invoice.client.email.clone(),
        subject,
        link: invoice.payment.url.clone(),
    }
}

/// The assembled services over one set of collaborators.
pub struct Engine {
    pub contracts: ContractService,
    pub invoices: InvoiceService,
    pub webhooks: WebhookReconciler,
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(deps: Dependencies) -> Result<Self, NumberFormatError> {
        let numbering = NumberingService::new(
            deps.store.clone(),
            deps.clock.clone(),
            &deps.contract_prefix,
            &deps.invoice_prefix,
        )?;
        let shared = Arc::new(Shared {
            store: deps.store,
            gateway: deps.gateway,
            notifier: deps.notifier,
            clock: deps.clock,
            rules: deps.rules,
            documents: deps.documents,
            numbering,
            locks: locks::EntityLocks::default(),
            payment_redirect_url: deps.payment_redirect_url,
        });
        Ok(Self {
            contracts: ContractService::new(shared.clone()),
            invoices: InvoiceService::new(shared.clone()),
            webhooks: WebhookReconciler::new(shared.clone()),
            shared,
        })
    }

    /// The engine's clock, for callers stamping signatures.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.shared.clock.now()
    }

    pub fn rules(&self) -> &PricingRuleTable {
        &self.shared.rules
    }

    pub fn documents(&self) -> &DocumentCache {
        &self.shared.documents
    }
}

pub async fn connect_store(config: &ShineConfig) -> anyhow::Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL is not set; records live in memory and vanish on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn migrate(config: &ShineConfig) -> anyhow::Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to run migrations")?;
    let store = PgStore::connect(url).await.context("connecting to postgres")?;
    store.migrate().await?;
    info!("migrations applied");
    Ok(())
}

/// The HTTP gateway when a URL is configured. The in-process sandbox hands
/// out links nobody can pay, so it is only used when asked for by name.
fn gateway_from_config(config: &ShineConfig) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    match &config.gateway_url {
        Some(url) => {
            let mut gateway_config = HttpGatewayConfig::new(url.clone(), config.gateway_token.clone());
            gateway_config.timeout = config.gateway_timeout();
            Ok(Arc::new(HttpGateway::new(gateway_config)?))
        }
        None if config.gateway_sandbox => {
            warn!("SHINE_GATEWAY_SANDBOX is set; payment links come from the in-process sandbox and cannot be paid");
            Ok(Arc::new(RecordingGateway::new()))
        }
        None => bail!(
            "SHINE_GATEWAY_URL is not set; configure the payment processor or set SHINE_GATEWAY_SANDBOX=1 for local use"
        ),
    }
}

pub async fn engine_from_config(config: &ShineConfig) -> anyhow::Result<Engine> {
    let store = connect_store(config).await?;
    let gateway = gateway_from_config(config)?;
    let deps = Dependencies {
        store,
        gateway,
        notifier: Arc::new(LogNotifier),
        clock: Arc::new(SystemClock),
        rules: Arc::new(config.load_pricing_rules()?),
        documents: DocumentCache::new(config.documents_dir.clone()),
        contract_prefix: config.contract_prefix.clone(),
        invoice_prefix: config.invoice_prefix.clone(),
        payment_redirect_url: config.payment_redirect_url.clone(),
    };
    Engine::new(deps).context("invalid document number prefix")
}

pub async fn engine_from_env() -> anyhow::Result<Engine> {
    engine_from_config(&ShineConfig::from_env()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_gateway_must_be_requested() {
        let config = ShineConfig::default();
        let err = gateway_from_config(&config).err().unwrap();
        assert!(err.to_string().contains("SHINE_GATEWAY_SANDBOX"));

        let sandbox = ShineConfig {
            gateway_sandbox: true,
            ..ShineConfig::default()
        };
        assert!(gateway_from_config(&sandbox).is_ok());

        let real = ShineConfig {
            gateway_url: Some("https://payments.internal.example".into()),
            ..ShineConfig::default()
        };
        assert!(gateway_from_config(&real).is_ok());
    }
}
