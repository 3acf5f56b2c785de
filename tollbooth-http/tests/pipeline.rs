//! End-to-end pipeline tests over an in-memory store and a scripted
//! payment provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::any;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use tollbooth::config::{GatewayConfig, RouteDescriptor};
use tollbooth::encoding;
use tollbooth::error::{SettleError, VerifyError};
use tollbooth::networks::NetworkRegistry;
use tollbooth::provider::{BoxFuture, PaymentContext, PaymentProvider, Settlement, Verified};
use tollbooth::proto::SettlementReceipt;
use tollbooth::store::nonce::NonceStatus;
use tollbooth::store::{Kv, KvError, MemoryKv};
use tollbooth_http::headers::{
    CREDIT_CONSUMED, CREDIT_HEADER, PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER,
    PAYMENT_SIGNATURE_HEADER,
};
use tollbooth_http::{Gateway, PaymentGate};

const PAYER: &str = "0x1111111111111111111111111111111111111111";

/// Scripted provider: configurable verdicts, counted settlements.
struct MockProvider {
    verify_error: Option<String>,
    settle_error: Option<String>,
    settle_delay: Duration,
    settlements: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            verify_error: None,
            settle_error: None,
            settle_delay: Duration::ZERO,
            settlements: AtomicUsize::new(0),
        }
    }
}

impl PaymentProvider for MockProvider {
    fn verify<'a>(
        &'a self,
        _ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Verified, VerifyError>> {
        Box::pin(async move {
            match &self.verify_error {
                Some(reason) => Err(VerifyError::new(reason.clone())),
                None => Ok(Verified {
                    payer: PAYER.to_owned(),
                }),
            }
        })
    }

    fn settle<'a>(
        &'a self,
        _ctx: &'a PaymentContext,
    ) -> BoxFuture<'a, Result<Settlement, SettleError>> {
        Box::pin(async move {
            tokio::time::sleep(self.settle_delay).await;
            match &self.settle_error {
                Some(reason) => Err(SettleError::new(reason.clone())),
                None => {
                    self.settlements.fetch_add(1, Ordering::SeqCst);
                    Ok(Settlement {
                        tx_hash: "0xfeedbeef".to_owned(),
                        network: "eip155:8453".to_owned(),
                        block_number: Some(42),
                        facilitator: None,
                    })
                }
            }
        })
    }
}

/// Store wrapper whose conditional set can be forced to fail, for the
/// fail-closed reservation path.
struct FlakyKv {
    inner: MemoryKv,
    fail_reserve: AtomicBool,
}

impl FlakyKv {
    fn new() -> Self {
        Self {
            inner: MemoryKv::new(),
            fail_reserve: AtomicBool::new(false),
        }
    }

    fn outage() -> KvError {
        KvError::Transport(std::io::Error::other("store is down").into())
    }
}

impl Kv for FlakyKv {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Box::pin(async { Err(Self::outage()) });
        }
        self.inner.set_if_absent(key, value, ttl)
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), KvError>> {
        self.inner.set(key, value, ttl)
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, KvError>> {
        self.inner.get(key)
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), KvError>> {
        self.inner.del(key)
    }

    fn decr_if_positive<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, KvError>> {
        self.inner.decr_if_positive(key)
    }

    fn incr_capped<'a>(
        &'a self,
        key: &'a str,
        cap: i64,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<i64, KvError>> {
        self.inner.incr_capped(key, cap, ttl)
    }
}

struct Harness {
    gateway: Arc<Gateway>,
    provider: Arc<MockProvider>,
    route: Arc<RouteDescriptor>,
}

fn harness_with_kv(
    provider: MockProvider,
    credit_enabled: bool,
    kv: Arc<dyn Kv>,
) -> Harness {
    let config = GatewayConfig::from_toml(
        r#"
        [rpc]
        base = "https://mainnet.base.org"

        [[routes]]
        route_key = "v1"
        backend_base_url = "https://api.internal.example"
        price_atomic = 10000
        display_price = "$0.01"
        description = "Example API"
        pay_to_evm = "0x2222222222222222222222222222222222222222"

        [routes.credit]
        credit_on_status_codes = [503]
        max_credits_per_payer = 2
        "#,
    )
    .unwrap();
    let registry = NetworkRegistry::from_config(&config, None).unwrap();
    let route = Arc::new(config.routes[0].clone());

    let provider = Arc::new(provider);
    let mut gateway = Gateway::new(registry, kv, credit_enabled);
    gateway.register(
        "eip155:8453".parse().unwrap(),
        Arc::clone(&provider) as Arc<dyn PaymentProvider>,
    );
    Harness {
        gateway: Arc::new(gateway),
        provider,
        route,
    }
}

fn harness(provider: MockProvider, credit_enabled: bool) -> Harness {
    harness_with_kv(provider, credit_enabled, Arc::new(MemoryKv::new()))
}

/// A router whose backend handler answers with a fixed status.
fn app(harness: &Harness, backend_status: StatusCode) -> Router {
    let gate = PaymentGate::new(Arc::clone(&harness.gateway), Arc::clone(&harness.route))
        .with_base_url("https://gw.example/".parse().unwrap());
    Router::new()
        .route(
            "/v1/{*rest}",
            any(move || async move { (backend_status, "backend") }),
        )
        .layer(gate)
}

fn evm_envelope(nonce_byte: u8, payment_id: Option<&str>) -> String {
    let mut envelope = serde_json::json!({
        "x402Version": 1,
        "scheme": "exact",
        "network": "eip155:8453",
        "payload": {
            "authorization": {
                "from": PAYER,
                "to": "0x2222222222222222222222222222222222222222",
                "value": "10000",
                "validAfter": "0",
                "validBefore": "99999999999",
                "nonce": format!("0x{}", hex(&[nonce_byte; 32])),
            },
            "signature": format!("0x{}", hex(&[0xabu8; 65])),
        }
    });
    if let Some(id) = payment_id {
        envelope["extensions"] = serde_json::json!({"payment-identifier": {"paymentId": id}});
    }
    encoding::encode_json(&envelope).unwrap()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn paid_request(envelope: &str) -> Request<axum::body::Body> {
    Request::builder()
        .uri("/v1/api/x")
        .header(PAYMENT_SIGNATURE_HEADER, envelope)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn bare_request() -> Request<axum::body::Body> {
    Request::builder()
        .uri("/v1/api/x")
        .body(axum::body::Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn cold_request_gets_a_402_challenge() {
    let hx = harness(MockProvider::default(), false);
    let response = app(&hx, StatusCode::OK).oneshot(bare_request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let header = response
        .headers()
        .get(PAYMENT_REQUIRED_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    let body = body_json(response).await;

    let accepts = body["accepts"].as_array().unwrap();
    assert!(!accepts.is_empty());
    assert!(accepts.iter().all(|a| a["scheme"] == "exact"));
    assert!(
        accepts
            .iter()
            .any(|a| a["resource"] == "https://gw.example/v1/api/x")
    );

    // The header decodes to the same payload.
    let decoded: serde_json::Value = encoding::decode_json(&header).unwrap();
    assert_eq!(decoded["accepts"], body["accepts"]);
    assert_eq!(decoded["extensions"]["payment-identifier"]["supported"], true);
}

#[tokio::test]
async fn malformed_envelope_is_a_400() {
    let hx = harness(MockProvider::default(), false);
    let response = app(&hx, StatusCode::OK)
        .oneshot(paid_request("&&& not base64 &&&"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn happy_path_settles_and_emits_a_receipt() {
    let hx = harness(MockProvider::default(), false);
    let response = app(&hx, StatusCode::OK)
        .oneshot(paid_request(&evm_envelope(1, None)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let receipt: SettlementReceipt = encoding::decode_json(
        response
            .headers()
            .get(PAYMENT_RESPONSE_HEADER)
            .unwrap()
            .to_str()
            .unwrap(),
    )
    .unwrap();
    assert!(receipt.success);
    assert_eq!(receipt.tx_hash, "0xfeedbeef");
    assert_eq!(receipt.network, "eip155:8453");
    assert_eq!(receipt.block_number, Some(42));

    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 1);

    // The nonce is tombstoned as confirmed.
    let key = format!("0x{}", hex(&[1u8; 32]));
    assert_eq!(
        hx.gateway.nonces.status(&key).await,
        Some(NonceStatus::Confirmed)
    );
}

#[tokio::test]
async fn verify_failure_regenerates_the_challenge() {
    let hx = harness(
        MockProvider {
            verify_error: Some("invalid_signature".into()),
            ..MockProvider::default()
        },
        false,
    );
    let response = app(&hx, StatusCode::OK)
        .oneshot(paid_request(&evm_envelope(2, None)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body = body_json(response).await;
    assert!(body["reason"].as_str().unwrap().contains("invalid_signature"));
    assert!(!body["accepts"].as_array().unwrap().is_empty());
    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_network_is_rejected_with_the_challenge() {
    let hx = harness(MockProvider::default(), false);
    let envelope = {
        let mut value: serde_json::Value =
            encoding::decode_json(&evm_envelope(3, None)).unwrap();
        value["network"] = serde_json::json!("eip155:10");
        encoding::encode_json(&value).unwrap()
    };
    let response = app(&hx, StatusCode::OK)
        .oneshot(paid_request(&envelope))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert!(body["reason"].as_str().unwrap().contains("unknown"));
}

#[tokio::test]
async fn settlement_failure_releases_the_nonce() {
    let hx = harness(
        MockProvider {
            settle_error: Some("transaction_reverted".into()),
            ..MockProvider::default()
        },
        false,
    );
    let response = app(&hx, StatusCode::OK)
        .oneshot(paid_request(&evm_envelope(4, None)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert!(body["reason"].as_str().unwrap().contains("settlement failed"));

    // The reservation is gone, so a retry reaches settlement again.
    let key = format!("0x{}", hex(&[4u8; 32]));
    assert_eq!(hx.gateway.nonces.status(&key).await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_nonce_settles_exactly_once() {
    let hx = harness(
        MockProvider {
            settle_delay: Duration::from_millis(100),
            ..MockProvider::default()
        },
        false,
    );
    let envelope = evm_envelope(5, None);

    let app_a = app(&hx, StatusCode::OK);
    let app_b = app(&hx, StatusCode::OK);
    let env_a = envelope.clone();
    let env_b = envelope.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { app_a.oneshot(paid_request(&env_a)).await.unwrap() }),
        tokio::spawn(async move { app_b.oneshot(paid_request(&env_b)).await.unwrap() }),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let mut statuses = [ra.status(), rb.status()];
    statuses.sort();
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::PAYMENT_REQUIRED],
        "exactly one request may settle"
    );
    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 1);

    let loser = if ra.status() == StatusCode::PAYMENT_REQUIRED { ra } else { rb };
    let body = body_json(loser).await;
    let reason = body["reason"].as_str().unwrap();
    assert!(
        reason.contains("already used") || reason.contains("in progress"),
        "unexpected reason: {reason}"
    );
}

#[tokio::test]
async fn idempotent_replay_reuses_the_receipt() {
    let hx = harness(MockProvider::default(), false);
    let envelope = evm_envelope(6, Some("retry-0123456789abcdef"));

    let first = app(&hx, StatusCode::OK)
        .oneshot(paid_request(&envelope))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_receipt = first
        .headers()
        .get(PAYMENT_RESPONSE_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    let second = app(&hx, StatusCode::OK)
        .oneshot(paid_request(&envelope))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_receipt = second
        .headers()
        .get(PAYMENT_RESPONSE_HEADER)
        .unwrap()
        .to_str()
        .unwrap();

    assert_eq!(second_receipt, first_receipt, "receipt replays verbatim");
    assert_eq!(
        hx.provider.settlements.load(Ordering::SeqCst),
        1,
        "no second on-chain submission"
    );
}

#[tokio::test]
async fn credit_cycle_compensates_backend_failures() {
    let hx = harness(MockProvider::default(), true);
    let failing_backend = app(&hx, StatusCode::SERVICE_UNAVAILABLE);

    // Request 1 pays; the backend fails; a credit is issued afterwards.
    let first = failing_backend
        .clone()
        .oneshot(paid_request(&evm_envelope(7, None)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(first.headers().contains_key(PAYMENT_RESPONSE_HEADER));
    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hx.gateway.credits.balance(PAYER, "v1").await.unwrap(), 1);

    // Request 2 from the same payer consumes the credit: no settlement,
    // sentinel header instead of a receipt.
    let second = failing_backend
        .clone()
        .oneshot(paid_request(&evm_envelope(8, None)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        second.headers().get(CREDIT_HEADER).unwrap(),
        CREDIT_CONSUMED
    );
    assert!(!second.headers().contains_key(PAYMENT_RESPONSE_HEADER));
    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 1);

    // A consumed credit never triggers issuance, even on a failing status.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hx.gateway.credits.balance(PAYER, "v1").await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn credit_issuance_respects_the_cap() {
    let hx = harness(
        MockProvider {
            settle_delay: Duration::from_millis(50),
            ..MockProvider::default()
        },
        true,
    );
    let failing_backend = app(&hx, StatusCode::SERVICE_UNAVAILABLE);

    // Three concurrent paid requests all pass the credit check before any
    // issuance lands, so all three settle and trigger issuance; the capped
    // counter absorbs only two.
    let mut handles = Vec::new();
    for nonce in [9u8, 10, 11] {
        let app = failing_backend.clone();
        handles.push(tokio::spawn(async move {
            app.oneshot(paid_request(&evm_envelope(nonce, None)))
                .await
                .unwrap()
                .status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hx.gateway.credits.balance(PAYER, "v1").await.unwrap(), 2);
}

#[tokio::test]
async fn store_outage_fails_reservation_closed() {
    let kv = Arc::new(FlakyKv::new());
    kv.fail_reserve.store(true, Ordering::SeqCst);
    let hx = harness_with_kv(MockProvider::default(), false, kv);

    let response = app(&hx, StatusCode::OK)
        .oneshot(paid_request(&evm_envelope(12, None)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert!(body["reason"].as_str().unwrap().contains("in progress"));
    assert_eq!(hx.provider.settlements.load(Ordering::SeqCst), 0);
}
