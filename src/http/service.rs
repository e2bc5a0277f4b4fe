//! Admission middleware and request handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, instrument, warn};

use crate::ratelimit::{Decision, RateLimitKey, RateLimiter, ACCOUNT_HEADER};

/// Body of a throttled or refused response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Build the router: every path is served by the same handler behind the
/// admission middleware.
pub fn router(limiter: Arc<RateLimiter>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", any(hello))
        .fallback(hello)
        .layer(middleware::from_fn_with_state(limiter, admission_control))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
}

async fn hello() -> &'static str {
    "Hello World!"
}

/// Admit or throttle a request before it reaches the handler.
///
/// The caller is identified by the `X-Account-ID` header when present and by
/// its peer address otherwise. Throttled callers get `429 Too Many Requests`,
/// with `Retry-After` when waiting would help.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn admission_control(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let account = request
        .headers()
        .get(ACCOUNT_HEADER)
        .and_then(|value| value.to_str().ok());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let Some(key) = RateLimitKey::from_parts(account, peer) else {
        warn!("Request carries neither an account ID nor a peer address");
        return refused(StatusCode::BAD_REQUEST, "unable to identify caller");
    };
    let key = key.to_string_key();

    let now = limiter.clock().now();
    match limiter.try_acquire_or_delay(&key, 1, now) {
        Ok(Decision::Admit) => next.run(request).await,
        Ok(Decision::Delay(delay)) => {
            debug!(key = %key, delay_ms = delay.as_millis() as u64, "Request throttled");
            throttled(Some(delay))
        }
        Ok(Decision::Reject) => {
            debug!(key = %key, "Request rejected");
            throttled(None)
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Rate limit check failed");
            refused(StatusCode::BAD_REQUEST, &e.to_string())
        }
    }
}

/// `429` response; `Retry-After` is rounded up to whole seconds.
fn throttled(retry_after: Option<Duration>) -> Response {
    let retry_after_secs = retry_after.map(|d| (d.as_secs_f64().ceil() as u64).max(1));
    let body = ThrottleBody {
        error: "too many requests".to_string(),
        retry_after_secs,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    if let Some(secs) = retry_after_secs {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

fn refused(status: StatusCode, reason: &str) -> Response {
    let body = ThrottleBody {
        error: reason.to_string(),
        retry_after_secs: None,
    };
    (status, Json(body)).into_response()
}
