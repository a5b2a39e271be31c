//! Axum JSON API over the contract engine.

mod error;

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shine_core::contract::{BusinessSignature, ClientSignature, SignatureImage};
use shine_core::{Contract, ContractEdit, ContractStatus, Invoice, PriceBreakdown, ServiceAttributes};
use shine_lifecycle::{
    Engine, NewContract, NewInvoice, ReconcileOutcome, ReconcileReport, ShineConfig, Target, WebhookEvent,
};
use shine_storage::ContractFilter;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub use error::{AppError, ErrorBody, ErrorDetail};

pub const CRATE_NAME: &str = "shine-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/quotes", post(quote_handler))
        .route("/api/contracts", get(list_contracts_handler).post(create_contract_handler))
        .route("/api/contracts/{id}", get(get_contract_handler).patch(edit_contract_handler))
        .route("/api/contracts/{id}/send", post(send_contract_handler))
        .route("/api/contracts/{id}/sign", post(sign_contract_handler))
        .route("/api/contracts/{id}/activate", post(activate_contract_handler))
        .route("/api/contracts/{id}/complete", post(complete_contract_handler))
        .route("/api/contracts/{id}/cancel", post(cancel_contract_handler))
        .route("/api/contracts/{id}/countersign", post(countersign_contract_handler))
        .route("/api/contracts/{id}/viewed", post(viewed_contract_handler))
        .route("/api/contracts/{id}/remind", post(remind_contract_handler))
        .route("/api/contracts/{id}/pdf", get(contract_pdf_handler))
        .route("/api/invoices", post(create_invoice_handler))
        .route("/api/invoices/{id}", get(get_invoice_handler))
        .route("/api/invoices/{id}/send", post(send_invoice_handler))
        .route("/api/invoices/{id}/cancel", post(cancel_invoice_handler))
        .route("/api/reconcile", post(reconcile_handler))
        .route("/webhooks/payments", post(webhook_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Engine, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ShineConfig::from_env();
    let engine = shine_lifecycle::engine_from_config(&config).await?;
    serve(engine, config.web_port).await
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    Ok(payload?.0)
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    Ok(params?.0)
}

/// `?expected_version=N` pins a mutation to the version the caller last saw.
#[derive(Debug, Default, Deserialize)]
struct VersionQuery {
    expected_version: Option<u64>,
    #[serde(default)]
    manual: bool,
}

impl VersionQuery {
    fn target(&self, id: Uuid) -> Target {
        Target {
            id,
            expected_version: self.expected_version,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListContractsQuery {
    status: Option<String>,
    client_email: Option<String>,
    contract_number: Option<String>,
    limit: Option<usize>,
}

impl ListContractsQuery {
    fn filter(self) -> ApiResult<ContractFilter> {
        let status = match self.status.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                ContractStatus::parse(raw).ok_or_else(|| AppError::Validation(format!("unknown status `{raw}`")))?,
            ),
        };
        Ok(ContractFilter {
            status,
            client_email: self.client_email,
            contract_number: self.contract_number,
            limit: self.limit,
            ..ContractFilter::default()
        })
    }
}

#[derive(Debug, Deserialize)]
struct SignRequest {
    /// `data:image/png;base64,...` or JPEG.
    signature: String,
    #[serde(default)]
    ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountersignRequest {
    signature: String,
    signer: String,
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    reason: String,
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn quote_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ServiceAttributes>, JsonRejection>,
) -> ApiResult<Json<PriceBreakdown>> {
    let attrs = body(payload)?;
    Ok(Json(state.engine.contracts.quote(&attrs)?))
}

async fn create_contract_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewContract>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Contract>)> {
    let contract = state.engine.contracts.create(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

async fn list_contracts_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ListContractsQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Contract>>> {
    let filter = query(params)?.filter()?;
    Ok(Json(state.engine.contracts.list(&filter).await?))
}

async fn get_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Contract>> {
    Ok(Json(state.engine.contracts.get(id).await?))
}

async fn edit_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    params: Result<Query<VersionQuery>, QueryRejection>,
    payload: Result<Json<ContractEdit>, JsonRejection>,
) -> ApiResult<Json<Contract>> {
    let target = query(params)?.target(id);
    Ok(Json(state.engine.contracts.edit(target, body(payload)?).await?))
}

async fn send_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    params: Result<Query<VersionQuery>, QueryRejection>,
) -> ApiResult<Json<Contract>> {
    let target = query(params)?.target(id);
    Ok(Json(state.engine.contracts.send(target).await?))
}

/// The signer's address comes from the body, else the proxy's forwarding header.
async fn sign_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    params: Result<Query<VersionQuery>, QueryRejection>,
    payload: Result<Json<SignRequest>, JsonRejection>,
) -> ApiResult<Json<Contract>> {
    let target = query(params)?.target(id);
    let request = body(payload)?;
    let ip_address = request
        .ip_address
        .or_else(|| forwarded_for(&headers))
        .unwrap_or_default();
    let signature = ClientSignature {
        image: SignatureImage::from_data_url(&request.signature).map_err(shine_lifecycle::LifecycleError::from)?,
        signed_at: state.engine.now(),
        ip_address,
    };
    Ok(Json(state.engine.contracts.sign(target, signature).await?))
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn activate_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    params: Result<Query<VersionQuery>, QueryRejection>,
) -> ApiResult<Json<Contract>> {
    let params = query(params)?;
    Ok(Json(state.engine.contracts.activate(params.target(id), params.manual).await?))
}

async fn complete_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    params: Result<Query<VersionQuery>, QueryRejection>,
) -> ApiResult<Json<Contract>> {
    let params = query(params)?;
    Ok(Json(state.engine.contracts.complete(params.target(id), params.manual).await?))
}

async fn cancel_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    params: Result<Query<VersionQuery>, QueryRejection>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> ApiResult<Json<Contract>> {
    let target = query(params)?.target(id);
    let request = body(payload)?;
    Ok(Json(state.engine.contracts.cancel(target, &request.reason).await?))
}

async fn countersign_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    params: Result<Query<VersionQuery>, QueryRejection>,
    payload: Result<Json<CountersignRequest>, JsonRejection>,
) -> ApiResult<Json<Contract>> {
    let target = query(params)?.target(id);
    let request = body(payload)?;
    let signature = BusinessSignature {
        image: SignatureImage::from_data_url(&request.signature).map_err(shine_lifecycle::LifecycleError::from)?,
        signed_at: state.engine.now(),
        signer: request.signer,
    };
    Ok(Json(state.engine.contracts.countersign(target, signature).await?))
}

async fn viewed_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Contract>> {
    Ok(Json(state.engine.contracts.mark_viewed(id).await?))
}

async fn remind_contract_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Contract>> {
    Ok(Json(state.engine.contracts.remind(id).await?))
}

async fn contract_pdf_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Response> {
    let rendered = state.engine.contracts.render_pdf(id).await?;
    let disposition = format!(
        "inline; filename=\"{}.pdf\"",
        rendered.contract.contract_number
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        rendered.bytes,
    )
        .into_response())
}

async fn create_invoice_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewInvoice>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Invoice>)> {
    let invoice = state.engine.invoices.create(body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

async fn get_invoice_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Invoice>> {
    Ok(Json(state.engine.invoices.get(id).await?))
}

async fn send_invoice_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Json<Invoice>> {
    Ok(Json(state.engine.invoices.send(id).await?))
}

async fn cancel_invoice_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    Ok(Json(state.engine.invoices.cancel(id).await?))
}

async fn reconcile_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.engine.reconcile_ambiguous().await?))
}

/// Always answers 200 once the event is understood so the processor stops
/// redelivering it; unmatched and stale events are reported in the body.
async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<WebhookEvent>, JsonRejection>,
) -> ApiResult<Json<ReconcileOutcome>> {
    Ok(Json(state.engine.webhooks.handle(body(payload)?).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{Days, Utc};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use shine_gateway::RecordingGateway;
    use shine_lifecycle::Dependencies;
    use shine_storage::{DocumentCache, MemoryStore};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const PIXEL_PNG: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

    fn test_app() -> (Router, Arc<RecordingGateway>, TempDir) {
        let documents = tempfile::tempdir().unwrap();
        let gateway = Arc::new(RecordingGateway::new());
        let deps = Dependencies::new(
            Arc::new(MemoryStore::new()),
            gateway.clone(),
            DocumentCache::new(documents.path()),
        )
        .unwrap();
        let engine = Engine::new(deps).unwrap();
        (app(AppState::new(engine)), gateway, documents)
    }

    fn attributes() -> Value {
        json!({
            "category": "residential",
            "service_tier": "regular",
            "size": {"bedrooms": 3},
            "frequency": "monthly"
        })
    }

    fn contract_request() -> Value {
        let start = (Utc::now().date_naive() + Days::new(30)).to_string();
        json!({
            "service_attributes": attributes(),
            "contract_type": "residential_recurring",
            "client": {"name": "Priya Raman", "email": "priya@example.com"},
            "service": {"description": "Monthly regular clean of a three bedroom townhouse"},
            "term": {"start_date": start, "duration_months": 12},
            "payment_frequency": "monthly",
            "price_point": {"kind": "low"}
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, payload: Option<Value>) -> (StatusCode, Value, Vec<u8>) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match payload {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json, bytes)
    }

    #[tokio::test]
    async fn health_and_quotes() {
        let (app, _gateway, _dir) = test_app();
        let (status, json, _) = call(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (status, json, _) = call(&app, "POST", "/api/quotes", Some(attributes())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["currency"], "AUD");
        assert!(json["total"]["low"].is_string() || json["total"]["low"].is_number());
    }

    #[tokio::test]
    async fn malformed_bodies_are_unprocessable_json_errors() {
        let (app, _gateway, _dir) = test_app();
        let (status, json, _) = call(&app, "POST", "/api/quotes", Some(json!({"category": "castle"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn contract_flow_over_http() {
        let (app, _gateway, _dir) = test_app();
        let (status, created, _) = call(&app, "POST", "/api/contracts", Some(contract_request())).await;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "draft");

        let (status, sent, _) = call(&app, "POST", &format!("/api/contracts/{id}/send"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["status"], "sent");

        let (status, json, _) = call(&app, "POST", &format!("/api/contracts/{id}/send"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "INVALID_STATE");

        let (status, signed, _) = call(
            &app,
            "POST",
            &format!("/api/contracts/{id}/sign"),
            Some(json!({"signature": PIXEL_PNG, "ip_address": "203.0.113.9"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{signed}");
        assert_eq!(signed["status"], "signed");

        let (status, _, bytes) = call(&app, "GET", &format!("/api/contracts/{id}/pdf"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(bytes.starts_with(b"%PDF-"));

        let (status, listed, _) = call(&app, "GET", "/api/contracts?status=signed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_versions_and_unknown_ids() {
        let (app, _gateway, _dir) = test_app();
        let (_, created, _) = call(&app, "POST", "/api/contracts", Some(contract_request())).await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, _, _) = call(&app, "POST", &format!("/api/contracts/{id}/send?expected_version=7"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json, _) = call(&app, "GET", &format!("/api/contracts/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "NOT_FOUND");

        let (status, _, _) = call(&app, "GET", "/api/contracts?status=haunted", None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn ambiguous_sends_are_accepted_then_reconciled() {
        let (app, gateway, _dir) = test_app();
        let (_, created, _) = call(&app, "POST", "/api/contracts", Some(contract_request())).await;
        let id = created["id"].as_str().unwrap().to_string();

        gateway.time_out_after_commit().await;
        let (status, json, _) = call(&app, "POST", &format!("/api/contracts/{id}/send"), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["error"]["code"], "PENDING_RECONCILIATION");

        let (status, report, _) = call(&app, "POST", "/api/reconcile", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["resolved"], 1);

        let (_, contract, _) = call(&app, "GET", &format!("/api/contracts/{id}"), None).await;
        assert_eq!(contract["status"], "sent");
    }

    #[tokio::test]
    async fn webhooks_report_their_outcome() {
        let (app, _gateway, _dir) = test_app();
        let (status, json, _) = call(
            &app,
            "POST",
            "/webhooks/payments",
            Some(json!({"type": "customer.created", "data": {"object": {}}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "ignored");
    }
}
