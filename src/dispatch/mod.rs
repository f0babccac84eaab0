//! Request dispatcher: selects a healthy, closed-breaker endpoint, builds
//! the upstream request, round-trips it, and hands the response off to
//! the streaming engine.

pub mod context;
pub mod retry;
pub mod url;

use crate::balancer::SharedSelector;
use crate::breaker::CircuitBreakerRegistry;
use crate::discovery::SharedDiscovery;
use crate::dispatch::context::{RequestContext, RequestContextPool};
use crate::domain::Endpoint;
use crate::errors::{DispatchError, OllaError};
use crate::events::{Event, EventBus};
use crate::pool::EndpointPoolRegistry;
use crate::stats::StatsAggregator;
use crate::streaming::{self, StreamOutcome, StreamingConfig};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Hop-by-hop headers that must never be forwarded verbatim (RFC 7230
/// §6.1), plus `host`, which is re-derived from the upstream URL.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub struct DispatchRequest {
    pub method: Method,
    /// Raw inbound path, still carrying the configured proxy prefix.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub model: Option<String>,
    pub client_id: String,
}

pub struct RequestDispatcher {
    discovery: SharedDiscovery,
    selector: SharedSelector,
    breakers: Arc<CircuitBreakerRegistry>,
    pools: Arc<EndpointPoolRegistry>,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    contexts: RequestContextPool,
    proxy_prefix: String,
    streaming_config: StreamingConfig,
}

impl RequestDispatcher {
    pub fn new(
        discovery: SharedDiscovery,
        selector: SharedSelector,
        breakers: Arc<CircuitBreakerRegistry>,
        pools: Arc<EndpointPoolRegistry>,
        stats: Arc<StatsAggregator>,
        events: EventBus,
        proxy_prefix: String,
        streaming_config: StreamingConfig,
    ) -> Self {
        Self {
            discovery,
            selector,
            breakers,
            pools,
            stats,
            events,
            contexts: RequestContextPool::new(),
            proxy_prefix,
            streaming_config,
        }
    }

    /// Runs the full admit-to-stream dispatch algorithm. Any panic inside
    /// is caught by the caller's panic-recovery layer (see `web::handlers`);
    /// this function itself never unwinds past its own call frame.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Response, OllaError> {
        let request_id = uuid_like_id();
        let mut ctx = self.contexts.checkout(request_id.clone());
        let outcome = self.dispatch_inner(&request, &mut ctx).await;
        self.contexts.release(ctx);
        outcome
    }

    async fn dispatch_inner(
        &self,
        request: &DispatchRequest,
        ctx: &mut RequestContext,
    ) -> Result<Response, OllaError> {
        let selection_started = Instant::now();

        let healthy = self.discovery.healthy_endpoints().await;
        if healthy.is_empty() {
            return Err(OllaError::NoHealthyEndpoints);
        }

        let stripped_path = url::strip_prefix(&request.path, &self.proxy_prefix).to_string();

        let mut candidates = healthy;
        let mut last_error: Option<DispatchError> = None;
        let max_attempts = candidates.len();

        for _ in 0..max_attempts {
            let Some(endpoint) = self.selector.select(&candidates).await else {
                break;
            };
            if self.breakers.is_open(&endpoint.name) {
                candidates.retain(|e| e.name != endpoint.name);
                continue;
            }

            ctx.endpoint_name = Some(endpoint.name.clone());
            ctx.selection_ms = Some(selection_started.elapsed().as_millis() as u64);

            self.selector.increment_connections(&endpoint.name);
            self.stats.record_connection(&endpoint.name, 1);
            let attempt_result = self
                .attempt(&endpoint, request, &stripped_path, ctx)
                .await;
            self.selector.decrement_connections(&endpoint.name);
            self.stats.record_connection(&endpoint.name, -1);

            match attempt_result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    self.breakers.record_failure(&endpoint.name);
                    self.stats.record_request(&endpoint.name, false, 0, 0);

                    // `attempt` only ever maps pre-response failures to
                    // `DispatchError::Connection`; anything after the
                    // upstream started responding is `Backend`/`Stream`,
                    // which `should_retry` already excludes.
                    let retry = retry::should_retry(&err, false);

                    last_error = Some(err);
                    candidates.retain(|e| e.name != endpoint.name);
                    if !retry || candidates.is_empty() {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(err) => Err(OllaError::Dispatch(err)),
            None => Err(OllaError::AllEndpointsUnavailable),
        }
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: &DispatchRequest,
        stripped_path: &str,
        ctx: &mut RequestContext,
    ) -> Result<Response, DispatchError> {
        let target = url::compose_target_url(endpoint, stripped_path, request.query.as_deref());
        ctx.target_url = Some(target.to_string());

        let pool = self
            .pools
            .get_or_create(&endpoint.name)
            .map_err(|err| DispatchError::Connection {
                endpoint: endpoint.name.clone(),
                elapsed: Duration::from_millis(0),
                message: err.to_string(),
            })?;

        let mut upstream_headers = reqwest::header::HeaderMap::new();
        for (name, value) in request.headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                upstream_headers.insert(name, value);
            }
        }
        if let Some(model) = &request.model {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(model) {
                upstream_headers.insert(
                    reqwest::header::HeaderName::from_static("x-model"),
                    value,
                );
            }
        }

        let backend_started = Instant::now();
        let method =
            reqwest::Method::from_bytes(request.method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

        let upstream_response = pool
            .client
            .request(method, target.clone())
            .headers(upstream_headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(|err| DispatchError::Connection {
                endpoint: endpoint.name.clone(),
                elapsed: backend_started.elapsed(),
                message: err.to_string(),
            })?;

        ctx.backend_response_ms = Some(backend_started.elapsed().as_millis() as u64);

        // An HTTP error status from upstream is passed through verbatim to
        // the client; it is not a transport failure and never trips the
        // breaker or the retry policy.
        let status = upstream_response.status();
        let response_headers = upstream_response.headers().clone();
        let content_type = response_headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if streaming::is_streaming_mode(content_type, false) {
            tracing::debug!(endpoint = %endpoint.name, "streaming mode detected, flushing per chunk");
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let byte_stream: std::pin::Pin<
            Box<dyn futures::Stream<Item = reqwest::Result<Bytes>> + Send>,
        > = Box::pin(upstream_response.bytes_stream());

        let upstream_cancel = CancellationToken::new();
        let streaming_config = self.streaming_config.clone();
        let endpoint_name = endpoint.name.clone();
        let breakers = Arc::clone(&self.breakers);
        let stats = self.stats.clone();
        let events = self.events.clone();
        let request_id = ctx.request_id.clone();
        let model = request.model.clone();
        let client_id = request.client_id.clone();
        let stream_started = Instant::now();

        tokio::spawn(async move {
            let outcome = streaming::pump(
                byte_stream,
                tx,
                upstream_cancel,
                &streaming_config,
                &endpoint_name,
            )
            .await;

            match outcome {
                Ok(StreamOutcome {
                    total_bytes,
                    bytes_delivered,
                    client_disconnected,
                    ..
                }) => {
                    breakers.record_success(&endpoint_name);
                    stats.record_request(&endpoint_name, true, stream_started.elapsed().as_millis() as u64, total_bytes);
                    if let Some(model) = &model {
                        stats.record_model_request(
                            model,
                            stream_started.elapsed().as_millis() as u64,
                            total_bytes,
                            Some(&client_id),
                        );
                    }
                    if client_disconnected {
                        events.publish(Event::ClientDisconnect {
                            request_id,
                            bytes_sent: bytes_delivered,
                        });
                    } else {
                        events.publish(Event::ProxySuccess {
                            request_id,
                            endpoint: endpoint_name,
                            duration: stream_started.elapsed(),
                            bytes_sent: total_bytes,
                            status: status.as_u16(),
                            model,
                        });
                    }
                }
                Err(err) => {
                    warn!(endpoint = %endpoint_name, error = %err, "stream terminated with error");
                    breakers.record_failure(&endpoint_name);
                    stats.record_request(&endpoint_name, false, 0, 0);
                }
            }
        });

        let body_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut builder = Response::builder().status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
        for (name, value) in response_headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str().to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from_stream(body_stream))
            .map_err(|err| DispatchError::Stream {
                phase: "response-build",
                elapsed: backend_started.elapsed(),
                message: err.to_string(),
            })
    }
}

fn uuid_like_id() -> String {
    format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..))
}

impl IntoResponse for OllaError {
    fn into_response(self) -> Response {
        use crate::errors::AdmissionError;

        let retry_after = match &self {
            OllaError::Admission(AdmissionError::RateLimited { retry_after }) => Some(*retry_after),
            _ => None,
        };

        let (status, message) = match &self {
            OllaError::NoHealthyEndpoints | OllaError::AllEndpointsUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            OllaError::Admission(err) => match err {
                AdmissionError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
                AdmissionError::PayloadTooLarge { .. } => {
                    (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
                }
                AdmissionError::HeadersTooLarge { .. } => {
                    (StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE, self.to_string())
                }
            },
            OllaError::Dispatch(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            OllaError::PanicRecovered { .. } => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            OllaError::Configuration { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        error!(status = %status, "dispatch rejected request: {}", message);
        let mut response = (status, message).into_response();
        if let Some(retry_after) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
