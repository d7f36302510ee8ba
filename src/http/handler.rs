//! Axum router and the push request handler.
//!
//! Routes:
//! - `GET  /healthz`                                   - Health check
//! - `GET  /metrics`                                   - Prometheus metrics
//! - `GET  /:owner/:name.git/info/refs?service=...`    - Ref advertisement
//! - `POST /:owner/:name.git/git-receive-pack`         - Pack upload
//!
//! Everything except health and metrics goes through [`handle`], which does
//! its own method and URL validation so that malformed requests get the same
//! error bodies whether or not they look like a repository path.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{extract_identity, Identity};
use crate::config::RetentionPolicy;
use crate::error::BridgeError;
use crate::git::{PackStream, ProtocolOperation, RepoLease};
use crate::http::classify::classify;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_git)
        .with_state(state)
}

/// Attach the repository identifier derived from the path, then [`handle`].
async fn handle_git(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let repo_id = extract_repo_id(request.uri().path());
    handle(&state, request, repo_id).await
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(axum::extract::State(Arc::clone(&state.config))).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the bridge.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Push handler
// ---------------------------------------------------------------------------

/// Serve one smart-HTTP push request.
///
/// `repo_id` is the identifier attached by the routing layer; `None` fails
/// with `InvalidRepository` once method and URL have been checked.
#[instrument(skip(state, request), fields(method = %request.method(), uri = %request.uri()))]
pub async fn handle(state: &Arc<AppState>, request: Request, repo_id: Option<String>) -> Response {
    match serve(state, request, repo_id).await {
        Ok(response) => response,
        Err(err) => {
            state.metrics.metrics.rejected(err.kind());
            AppError {
                err,
                legacy_status: state.config.http.legacy_error_status,
            }
            .into_response()
        }
    }
}

async fn serve(
    state: &Arc<AppState>,
    request: Request,
    repo_id: Option<String>,
) -> Result<Response, BridgeError> {
    let (parts, body) = request.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());

    // 1. Method, URL, repository identifier.
    let shape = classify(&parts.method, target, repo_id.as_deref())?;

    // 2. Authentication.
    let identity = extract_identity(&parts.headers, Some(&shape.repo_id));
    if !state.authenticator.authenticate(&identity).await {
        warn!(repo_id = %shape.repo_id, user = %identity.username, "authentication rejected");
        return Err(BridgeError::Unauthorized);
    }

    // 3. Repository resolution.
    let lease = state.store.ensure_ready(&shape.repo_id).await?;
    if lease.created() {
        state.metrics.metrics.repo_inits_total.inc();
    }

    // 4. Only pushes past this point.
    let operation = match shape.operation() {
        Ok(operation) => operation,
        Err(err) => {
            let created = lease.created();
            drop(lease);
            if created && state.config.push.retention == RetentionPolicy::DeleteAfterPush {
                match state.store.remove(&shape.repo_id).await {
                    Ok(()) => {
                        state.metrics.metrics.repo_removals_total.inc();
                    }
                    Err(e) => {
                        warn!(repo_id = %shape.repo_id, error = %e, "failed to remove bare repository")
                    }
                }
            }
            return Err(err);
        }
    };
    state.metrics.metrics.request(operation.as_str());
    debug!(repo_id = %shape.repo_id, op = operation.as_str(), "starting pack exchange");

    let body = start_session(Arc::clone(state), operation, lease, identity, body).await?;
    Ok(pack_response(
        operation,
        body,
        state.config.http.result_content_type,
    ))
}

/// Run the pack exchange (and, for pushes, the workflow after it) on its own
/// task and wait for the response body.
///
/// The task outlives this request future, so a client that hangs up early
/// still gets its subprocess reaped and its workflow cleanup run.
async fn start_session(
    state: Arc<AppState>,
    operation: ProtocolOperation,
    lease: RepoLease,
    identity: Identity,
    body: Body,
) -> Result<Body, BridgeError> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let repo_id = lease.repo_id().to_owned();
        let completion = match state.receive_pack.run(operation, lease, body).await {
            Ok(PackStream { body, completion }) => {
                if tx.send(Ok(body)).is_err() {
                    debug!(%repo_id, "client went away before the response started");
                }
                completion.await
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                if operation == ProtocolOperation::ReceivePack {
                    state.workflow.abandon(&repo_id).await;
                }
                return;
            }
        };

        match (operation, completion) {
            (ProtocolOperation::ReceivePack, Ok(done)) => {
                let report = state.workflow.run(identity, done).await;
                info!(%repo_id, final_phase = ?report.final_phase, "push handled");
            }
            (ProtocolOperation::ReceivePack, Err(e)) => {
                error!(%repo_id, error = %e, "pack forwarding task failed");
                state.workflow.abandon(&repo_id).await;
            }
            (ProtocolOperation::AdvertiseRefs, Ok(done)) => {
                debug!(%repo_id, bytes_out = done.outcome.bytes_out, "refs advertised");
            }
            (ProtocolOperation::AdvertiseRefs, Err(e)) => {
                error!(%repo_id, error = %e, "pack forwarding task failed");
            }
        }
    });

    rx.await.map_err(|_| {
        BridgeError::SubprocessError("pack session ended before producing a response".into())
    })?
}

fn pack_response(operation: ProtocolOperation, body: Body, result_type: bool) -> Response {
    let content_type = match operation {
        ProtocolOperation::ReceivePack if result_type => "application/x-git-receive-pack-result",
        _ => "application/x-git-receive-pack-advertisement",
    };

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Repository identifier for paths shaped `/<owner>/<name>.git/...`.
///
/// Returns `"owner/name"`, or `None` when the path does not have that shape
/// or a segment is unsafe to use.
pub fn extract_repo_id(path: &str) -> Option<String> {
    let path = path.trim_start_matches('/');
    let mut parts = path.splitn(3, '/');
    let owner = parts.next()?;
    let name = parts.next()?.strip_suffix(".git")?;
    if !is_safe_segment(owner) || !is_safe_segment(name) {
        return None;
    }
    Some(format!("{owner}/{name}"))
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains('\\')
        && !segment.contains('\0')
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A [`BridgeError`] on its way to the client.
#[derive(Debug)]
pub struct AppError {
    pub err: BridgeError,
    pub legacy_status: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.err.status_code(self.legacy_status);
        match self.err {
            BridgeError::Unauthorized => (
                status,
                [(
                    header::WWW_AUTHENTICATE,
                    "Basic realm=\"Authorization Required\"",
                )],
                "Unauthorized",
            )
                .into_response(),
            err => {
                if status.is_server_error() {
                    error!(error = %err, "request failed");
                } else {
                    debug!(error = %err, "request rejected");
                }
                (status, err.to_string()).into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
