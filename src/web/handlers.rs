use super::AppState;
use crate::admission::size_validator::SizeValidator;
use crate::admission::{AdmissionRequest, Verdict};
use crate::dispatch::url::strip_prefix;
use crate::dispatch::DispatchRequest;
use crate::errors::OllaError;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let is_health_check = strip_prefix(request.uri().path(), &state.proxy_prefix) == "/health";
    let (parts, body) = request.into_parts();

    let header_byte_size = SizeValidator::header_byte_size(
        parts.method.as_str(),
        &parts.uri.to_string(),
        "HTTP/1.1",
        parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or(""))),
    );

    let declared_body_size = parts
        .headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let forwarded_for = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let client_id = state
        .rate_limiter
        .client_identity(peer.ip(), forwarded_for);

    let admission_request = AdmissionRequest {
        client_id: &client_id,
        is_health_check,
        declared_body_size,
        header_byte_size,
    };

    match state.admission.admit(&admission_request).await {
        Verdict::Deny(reason) => {
            return attach_rate_limit_headers(
                OllaError::Admission(reason).into_response(),
                &state,
                &client_id,
                is_health_check,
            );
        }
        Verdict::Allow => {}
    }

    let body_limit = if state.max_body_size > 0 {
        state.max_body_size as usize
    } else {
        usize::MAX
    };
    let body_bytes = match to_bytes(body, body_limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "request body exceeded the configured cap or failed to read");
            return attach_rate_limit_headers(
                OllaError::Admission(crate::errors::AdmissionError::PayloadTooLarge {
                    size: body_limit as u64 + 1,
                    max: body_limit as u64,
                })
                .into_response(),
                &state,
                &client_id,
                is_health_check,
            );
        }
    };

    let model = parts
        .headers
        .get("x-requested-model")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let dispatch_request = DispatchRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        body: body_bytes,
        model,
        client_id: client_id.clone(),
    };

    let dispatcher = &state.dispatcher;
    let result = AssertUnwindSafe(dispatcher.dispatch(dispatch_request))
        .catch_unwind()
        .await;

    let response = match result {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => err.into_response(),
        Err(panic) => {
            let message = panic_message(&panic);
            error!(message, "panic recovered in dispatch");
            OllaError::PanicRecovered { message }.into_response()
        }
    };

    attach_rate_limit_headers(response, &state, &client_id, is_health_check)
}

fn attach_rate_limit_headers(
    mut response: Response,
    state: &AppState,
    client_id: &str,
    is_health_check: bool,
) -> Response {
    let limit = state.rate_limiter.limit(is_health_check);
    let remaining = state.rate_limiter.remaining(client_id, is_health_check);
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
    response
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
