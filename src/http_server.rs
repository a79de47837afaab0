use crate::deployer::{millis, Busy, Deployer};
use crate::error::HookError;
use crate::types::{RunSummary, Trigger};
use crate::verification::{Verifier, SHA1_HEADER, SHA256_HEADER};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Liveness route; not available as a trigger path.
pub const HEALTH_PATH: &str = "/healthz";

const DELIVERY_HEADER: &str = "x-github-delivery";
const EVENT_HEADER: &str = "x-github-event";

/// Request-level limits for the trigger route.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub path: String,
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
}

#[derive(Clone)]
pub struct ServerState {
    verifier: Arc<Verifier>,
    deployer: Deployer,
    branch: Option<Arc<str>>,
}

impl ServerState {
    pub fn new(verifier: Verifier, deployer: Deployer) -> Self {
        Self {
            verifier: Arc::new(verifier),
            deployer,
            branch: None,
        }
    }

    /// Only deploy pushes to `refs/heads/<branch>`.
    pub fn only_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch.map(Arc::from);
        self
    }
}

pub fn router(state: ServerState, settings: &HttpSettings) -> Router {
    let trigger = post(handle_deploy)
        .layer::<_, Infallible>(middleware::from_fn_with_state(settings.read_timeout, read_deadline))
        .layer::<_, Infallible>(DefaultBodyLimit::max(settings.max_body_bytes));

    Router::new()
        .route(&settings.path, trigger)
        .route(HEALTH_PATH, get(health))
        .fallback(not_found)
        .with_state(state)
}

/// Serve until `shutdown` resolves. In-flight requests are allowed to finish.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

/// Spawn the server on 127.0.0.1:0 and return the bound address.
pub async fn start(app: Router) -> Result<SocketAddr, String> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| format!("failed to bind HTTP server: {e}"))?;
    let addr = listener
        .local_addr()
        .map_err(|e| format!("failed to read bound address: {e}"))?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    Ok(addr)
}

/// Bounds the time a sender may take to deliver the request body.
async fn read_deadline(State(limit): State<Duration>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(limit, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => {
            warn!(timeout_ms = millis(limit), "rejected delivery: body not received in time");
            HookError::ReadTimeout.into_response()
        }
    }
}

async fn handle_deploy(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, String), HookError> {
    let received_at = Utc::now();
    let delivery = header_str(&headers, DELIVERY_HEADER).map(str::to_string);
    let delivery_label = delivery.clone().unwrap_or_else(|| "-".to_string());

    let body = body.map_err(|rejection| {
        let err = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            HookError::PayloadTooLarge
        } else {
            HookError::BadRequest(rejection.body_text())
        };
        warn!(delivery = %delivery_label, reason = %err, "rejected delivery: unreadable body");
        err
    })?;

    // Verify against the exact bytes received; nothing is decoded before this.
    let verdict = state.verifier.verify(
        &body,
        header_str(&headers, SHA1_HEADER),
        header_str(&headers, SHA256_HEADER),
    );
    if !verdict.is_verified() {
        warn!(delivery = %delivery_label, reason = verdict.reason(), "rejected delivery: authentication failed");
        return Err(HookError::Unauthorized(verdict.reason()));
    }

    let event = header_str(&headers, EVENT_HEADER).map(str::to_string);
    if event.as_deref() == Some("ping") {
        info!(delivery = %delivery_label, "ping received");
        return Ok((StatusCode::OK, "pong\n".to_string()));
    }

    let git_ref = push_ref(&body);
    if let Some(branch) = &state.branch {
        let wanted = format!("refs/heads/{branch}");
        match git_ref.as_deref() {
            Some(r) if r == wanted => {}
            Some(r) => {
                info!(delivery = %delivery_label, git_ref = r, "push to other ref ignored");
                return Ok((StatusCode::OK, format!("ignored: {r}\n")));
            }
            None => {
                warn!(delivery = %delivery_label, "rejected delivery: payload carries no ref");
                return Err(HookError::BadRequest("payload carries no ref".to_string()));
            }
        }
    }

    let trigger = Trigger {
        received_at,
        delivery,
        event,
        git_ref,
    };
    match state.deployer.try_start(trigger) {
        Ok(run_id) => {
            info!(delivery = %delivery_label, %run_id, "deploy admitted");
            Ok((StatusCode::ACCEPTED, format!("deploy started: {run_id}\n")))
        }
        Err(Busy) => {
            info!(delivery = %delivery_label, "deploy already in progress, delivery skipped");
            Err(HookError::Busy)
        }
    }
}

async fn health(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let last_run = state.deployer.journal().last();
    Json(serde_json::json!({
        "status": "ok",
        "deploying": state.deployer.is_running(),
        "last_run": last_run.as_ref().map(RunSummary::from),
    }))
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found\n")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

/// `ref` of a JSON push payload, if the body is one.
fn push_ref(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<PushPayload>(body).ok()?.git_ref
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ref_from_push_payload() {
        assert_eq!(
            push_ref(br#"{"ref":"refs/heads/main","after":"abc"}"#).as_deref(),
            Some("refs/heads/main")
        );
        assert_eq!(push_ref(b"{}"), None);
        assert_eq!(push_ref(b"payload=%7B%7D"), None);
    }

    #[test]
    fn header_lookup_ignores_non_ascii_values() {
        let mut headers = HeaderMap::new();
        headers.insert(DELIVERY_HEADER, "72d3162e".parse().unwrap());
        headers.insert(EVENT_HEADER, axum::http::HeaderValue::from_bytes(b"p\xffsh").unwrap());
        assert_eq!(header_str(&headers, DELIVERY_HEADER), Some("72d3162e"));
        assert_eq!(header_str(&headers, EVENT_HEADER), None);
        assert_eq!(header_str(&headers, SHA1_HEADER), None);
    }
}
