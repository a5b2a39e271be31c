use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;
use shine_gateway::{
    BackoffPolicy, Buyer, GatewayError, GatewayLineItem, HttpGateway, HttpGatewayConfig,
    InvoiceRequest, PaymentGateway, PaymentLinkRequest,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway(server: &MockServer, timeout: Duration) -> HttpGateway {
    HttpGateway::new(HttpGatewayConfig {
        base_url: server.uri(),
        token: "test-token".into(),
        timeout,
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    })
    .expect("gateway build")
}

fn buyer() -> Buyer {
    Buyer {
        name: "Priya Raman".into(),
        email: "priya@example.com".into(),
    }
}

fn link_request() -> PaymentLinkRequest {
    PaymentLinkRequest {
        idempotency_key: "CSA-26-0042".into(),
        reference: "CSA-26-0042".into(),
        description: "Service agreement CSA-26-0042".into(),
        currency: "AUD".into(),
        line_items: vec![GatewayLineItem {
            name: "Monthly regular clean".into(),
            quantity: 1,
            unit_amount_minor: 18050,
        }],
        buyer: buyer(),
        redirect_url: Some("https://shinecleaning.com.au/thanks".into()),
    }
}

#[tokio::test]
async fn payment_link_sends_token_and_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment-links"))
        .and(header("Authorization", "Bearer test-token"))
        .and(header("Idempotency-Key", "CSA-26-0042"))
        .and(body_partial_json(json!({"reference": "CSA-26-0042", "currency": "AUD"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pl_9001",
            "order_id": "ord_9001",
            "url": "https://pay.example.test/pl_9001"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let artifact = gateway(&server, Duration::from_secs(5))
        .create_payment_link(&link_request())
        .await
        .expect("link");
    assert_eq!(artifact.external_id, "pl_9001");
    assert_eq!(artifact.order_id.as_deref(), Some("ord_9001"));
}

#[tokio::test]
async fn validation_failures_are_rejected_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment-links"))
        .respond_with(ResponseTemplate::new(422).set_body_string("amount must be positive"))
        .expect(1)
        .mount(&server)
        .await;

    let err = gateway(&server, Duration::from_secs(5))
        .create_payment_link(&link_request())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::Rejected {
            status: 422,
            message: "amount must be positive".into()
        }
    );
}

#[tokio::test]
async fn server_errors_are_retried_with_the_same_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment-links"))
        .and(header("Idempotency-Key", "CSA-26-0042"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/payment-links"))
        .and(header("Idempotency-Key", "CSA-26-0042"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "pl_1",
            "url": "https://pay.example.test/pl_1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let artifact = gateway(&server, Duration::from_secs(5))
        .create_payment_link(&link_request())
        .await
        .expect("second attempt succeeds");
    assert_eq!(artifact.external_id, "pl_1");
    assert_eq!(artifact.order_id, None);
}

#[tokio::test]
async fn timeouts_are_ambiguous_and_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payment-links"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(500))
                .set_body_json(json!({"id": "pl_slow", "url": "https://pay.example.test/pl_slow"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = gateway(&server, Duration::from_millis(100))
        .create_payment_link(&link_request())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Ambiguous(_)), "{err:?}");
}

#[tokio::test]
async fn invoices_are_built_in_three_keyed_steps() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/invoices"))
        .and(header("Idempotency-Key", "INV-26-0007-shell"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "inv_77"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/invoices/inv_77/line-items"))
        .and(header("Idempotency-Key", "INV-26-0007-lines"))
        .and(body_partial_json(json!({"line_items": [{"name": "Clinic deep clean", "quantity": 1, "unit_amount_minor": 64000}]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/invoices/inv_77/publish"))
        .and(header("Idempotency-Key", "publish-INV-26-0007"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "inv_77",
            "order_id": "ord_77",
            "url": "https://pay.example.test/inv_77"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let request = InvoiceRequest {
        reference: "INV-26-0007".into(),
        currency: "AUD".into(),
        buyer: buyer(),
        line_items: vec![GatewayLineItem {
            name: "Clinic deep clean".into(),
            quantity: 1,
            unit_amount_minor: 64000,
        }],
        due_date: NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
        payment_terms: "14 days".into(),
        description: None,
    };
    let artifact = gateway(&server, Duration::from_secs(5))
        .create_invoice(&request)
        .await
        .expect("invoice");
    assert_eq!(artifact.external_id, "inv_77");
    assert_eq!(artifact.url, "https://pay.example.test/inv_77");
}

#[tokio::test]
async fn lookup_distinguishes_missing_from_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/idempotency/CSA-26-0042"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pl_5",
            "url": "https://pay.example.test/pl_5"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/idempotency/CSA-26-0043"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let gateway = gateway(&server, Duration::from_secs(5));
    let found = gateway.lookup("CSA-26-0042").await.expect("lookup");
    assert_eq!(found.map(|a| a.external_id).as_deref(), Some("pl_5"));
    assert_eq!(gateway.lookup("CSA-26-0043").await.expect("lookup"), None);
}
