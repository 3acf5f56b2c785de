//! Tower middleware enforcing payment on a protected route.
//!
//! One [`PaymentGate`] is built per route from the shared [`Gateway`] state
//! and layered over the route's handler. The wrapped handler runs only for
//! admitted requests; the gate attaches the receipt header to its response
//! and schedules credit issuance after the downstream status is known.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum_core::body::Body;
use axum_core::extract::Request;
use axum_core::response::Response;
use http::{HeaderValue, StatusCode, header};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use url::Url;

use tollbooth::challenge::Challenge;
use tollbooth::config::RouteDescriptor;

use crate::gateway::Gateway;
use crate::headers;
use crate::pipeline::{Admission, Grant, Receipt, admit};

/// Payment enforcement layer for one protected route.
#[derive(Clone)]
pub struct PaymentGate {
    gateway: Arc<Gateway>,
    route: Arc<RouteDescriptor>,
    base_url: Option<Arc<Url>>,
}

impl std::fmt::Debug for PaymentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGate")
            .field("route", &self.route.route_key)
            .finish_non_exhaustive()
    }
}

impl PaymentGate {
    /// Creates a gate for one route.
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, route: Arc<RouteDescriptor>) -> Self {
        Self {
            gateway,
            route,
            base_url: None,
        }
    }

    /// Sets the public base URL used to build resource URLs in challenges.
    /// Without it, resources default to `http://localhost/` plus the
    /// request path; set it in production.
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(Arc::new(base_url));
        self
    }
}

impl<S> Layer<S> for PaymentGate
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = PaymentGateService;

    fn layer(&self, inner: S) -> Self::Service {
        PaymentGateService {
            gateway: Arc::clone(&self.gateway),
            route: Arc::clone(&self.route),
            base_url: self.base_url.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// The service produced by [`PaymentGate`].
#[derive(Clone)]
pub struct PaymentGateService {
    gateway: Arc<Gateway>,
    route: Arc<RouteDescriptor>,
    base_url: Option<Arc<Url>>,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl std::fmt::Debug for PaymentGateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentGateService")
            .field("route", &self.route.route_key)
            .finish_non_exhaustive()
    }
}

impl Service<Request> for PaymentGateService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let gateway = Arc::clone(&self.gateway);
        let route = Arc::clone(&self.route);
        let base_url = self.base_url.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let resource = resource_url(base_url.as_deref(), req.uri());
            let payment = headers::payment_header(req.headers()).map(str::to_owned);

            let grant = match admit(&gateway, &route, &resource, payment.as_deref()).await {
                Admission::Malformed { message } => return Ok(bad_request(&message)),
                Admission::Challenge(challenge) => return Ok(payment_required(&challenge)),
                Admission::Proceed(grant) => grant,
            };

            let mut response = inner.call(req).await?;
            attach_receipt(&mut response, &grant);
            schedule_credit(&gateway, &route, &grant, response.status());
            Ok(response)
        })
    }
}

/// Builds the public resource URL for challenge bodies.
fn resource_url(base_url: Option<&Url>, uri: &http::Uri) -> String {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_owned(), |pq| pq.as_str().to_owned());
    match base_url {
        Some(base) => base
            .join(path.trim_start_matches('/'))
            .map_or_else(|_| base.to_string(), |joined| joined.to_string()),
        None => format!("http://localhost{path}"),
    }
}

/// Attaches the receipt header matching the grant.
fn attach_receipt(response: &mut Response, grant: &Grant) {
    match &grant.receipt {
        Receipt::Settled { header } | Receipt::Cached { header } => {
            if let Ok(value) = HeaderValue::from_str(header) {
                response
                    .headers_mut()
                    .insert(headers::PAYMENT_RESPONSE_HEADER, value);
            }
        }
        Receipt::Credit => {
            response.headers_mut().insert(
                headers::CREDIT_HEADER,
                HeaderValue::from_static(headers::CREDIT_CONSUMED),
            );
        }
    }
}

/// Schedules best-effort credit issuance after the downstream status is
/// known. Fires only when settlement happened in this request and the
/// status is in the route's policy; the response never waits on it.
fn schedule_credit(gateway: &Arc<Gateway>, route: &Arc<RouteDescriptor>, grant: &Grant, status: StatusCode) {
    if !gateway.credit_enabled || !grant.settled_now() {
        return;
    }
    let Some(payer) = grant.payer.clone() else {
        return;
    };
    if !route.credit.credit_on_status_codes.contains(&status.as_u16()) {
        return;
    }

    let gateway = Arc::clone(gateway);
    let route = Arc::clone(route);
    tokio::spawn(async move {
        match gateway
            .credits
            .issue(&payer, &route.route_key, &route.credit)
            .await
        {
            Ok(count) => tracing::info!(
                route = %route.route_key,
                %payer,
                count,
                status = status.as_u16(),
                "issued backend-failure credit"
            ),
            Err(err) => tracing::warn!(
                route = %route.route_key,
                %payer,
                %err,
                "credit issuance failed"
            ),
        }
    });
}

/// 400 response for undecodable envelopes.
fn bad_request(message: &str) -> Response {
    let body = serde_json::json!({
        "error": "invalid_payment_header",
        "message": message,
    });
    json_response(StatusCode::BAD_REQUEST, &body, None)
}

/// 402 response carrying the challenge body and header.
fn payment_required(challenge: &Challenge) -> Response {
    let body = serde_json::to_value(&challenge.body)
        .expect("challenge body serializes to JSON");
    json_response(
        StatusCode::PAYMENT_REQUIRED,
        &body,
        Some((headers::PAYMENT_REQUIRED_HEADER, challenge.header.as_str())),
    )
}

fn json_response(
    status: StatusCode,
    body: &serde_json::Value,
    extra_header: Option<(&str, &str)>,
) -> Response {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut builder = http::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((name, value)) = extra_header {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
