use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info_span, warn, Instrument};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, GatewayError, InvoiceRequest,
    PaymentArtifact, PaymentGateway, PaymentLinkRequest,
};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl HttpGatewayConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// JSON-over-HTTP client for the processor API.
#[derive(Debug)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct ArtifactBody {
    id: String,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

impl ArtifactBody {
    fn into_artifact(self, operation: &str) -> Result<PaymentArtifact, GatewayError> {
        let url = self.url.ok_or_else(|| {
            GatewayError::Ambiguous(format!("{operation}: response for {} has no url", self.id))
        })?;
        Ok(PaymentArtifact {
            external_id: self.id,
            order_id: self.order_id,
            url,
        })
    }
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.token))
                .context("gateway token contains invalid header characters")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building gateway http client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }

    /// POST with an idempotency key. Only `Unavailable` outcomes are retried;
    /// the key makes the repeat harmless.
    async fn post<B, R>(&self, path: &str, key: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let span = info_span!("gateway_call", method = "POST", path, idempotency_key = key);
        self.post_with_retries(path, key, body).instrument(span).await
    }

    async fn post_with_retries<B, R>(&self, path: &str, key: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0;
        loop {
            let sent = self
                .client
                .post(&url)
                .header(IDEMPOTENCY_HEADER, key)
                .json(body)
                .send()
                .await;
            let err = match sent {
                Ok(resp) if resp.status().is_success() => return read_success(resp).await,
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    classify_status(status, &text)
                }
                Err(err) => classify_reqwest_error(&err),
            };
            if !err.is_retryable() || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            warn!(attempt, error = %err, "gateway unavailable, retrying");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    async fn get_artifact(&self, idempotency_key: &str) -> Result<Option<PaymentArtifact>, GatewayError> {
        let url = format!("{}/v1/idempotency/{idempotency_key}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: ArtifactBody = read_success(resp).await?;
                body.into_artifact("lookup").map(Some)
            }
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(classify_status(status, &text))
            }
        }
    }
}

/// An empty success body reads as JSON `null`.
async fn read_success<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, GatewayError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| GatewayError::Ambiguous(format!("success response cut short: {err}")))?;
    let body: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
    serde_json::from_slice(body)
        .map_err(|err| GatewayError::Ambiguous(format!("unreadable success response: {err}")))
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment_link(
        &self,
        request: &PaymentLinkRequest,
    ) -> Result<PaymentArtifact, GatewayError> {
        let body: ArtifactBody = self
            .post("/v1/payment-links", &request.idempotency_key, request)
            .await?;
        body.into_artifact("create payment link")
    }

    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<PaymentArtifact, GatewayError> {
        let shell: ArtifactBody = self
            .post(
                "/v1/invoices",
                &request.shell_key(),
                &json!({
                    "reference": request.reference,
                    "currency": request.currency,
                    "buyer": request.buyer,
                    "due_date": request.due_date,
                    "payment_terms": request.payment_terms,
                    "description": request.description,
                }),
            )
            .await?;

        let _: serde_json::Value = self
            .post(
                &format!("/v1/invoices/{}/line-items", shell.id),
                &request.lines_key(),
                &json!({ "line_items": request.line_items }),
            )
            .await?;

        let published: ArtifactBody = self
            .post(
                &format!("/v1/invoices/{}/publish", shell.id),
                &request.publish_key(),
                &json!({}),
            )
            .await?;
        published.into_artifact("publish invoice")
    }

    async fn lookup(&self, idempotency_key: &str) -> Result<Option<PaymentArtifact>, GatewayError> {
        let span = info_span!("gateway_call", method = "GET", idempotency_key);
        self.get_artifact(idempotency_key).instrument(span).await
    }

    async fn cancel(&self, external_id: &str) -> Result<(), GatewayError> {
        let key = format!("cancel-{external_id}");
        let _: serde_json::Value = self
            .post(&format!("/v1/payments/{external_id}/cancel"), &key, &json!({}))
            .await?;
        Ok(())
    }
}
