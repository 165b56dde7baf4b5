//! HTTP API Server
//!
//! REST surface over the write coordinator, the reader and recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Json, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::coordinator::{RankReport, RecordReader, WriteCoordinator};
use crate::error::{Error, Result};
use crate::node::RankAggregate;
use crate::record::{IsolationLevel, Record};
use crate::recovery::{RecoveryManager, RecoveryReport};

/// Shared application state
pub struct AppState {
    pub writer: WriteCoordinator,
    pub reader: RecordReader,
    pub recovery: Arc<RecoveryManager>,
    pub gate: RecoveryGate,
}

/// Runs a recovery pass ahead of request handling, at most once per
/// `min_interval`.
pub struct RecoveryGate {
    enabled: bool,
    min_interval: Duration,
    last_pass: Mutex<Option<Instant>>,
}

impl RecoveryGate {
    pub fn new(enabled: bool, min_interval: Duration) -> Self {
        Self {
            enabled,
            min_interval,
            last_pass: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Duration::ZERO)
    }

    /// Whether a pass is due; a `true` answer reserves the slot
    async fn claim(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut last = self.last_pass.lock().await;
        match *last {
            Some(at) if at.elapsed() < self.min_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Build the router over shared state
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            // Reads
            .route("/records", get(handle_list).post(handle_create).put(handle_update))
            .route("/records/search", get(handle_search))
            .route("/records/report/:agg", get(handle_report))
            .route("/records/:id", get(handle_get).delete(handle_delete))
            // Admin
            .route("/admin/recover", post(handle_recover))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn_with_state(Arc::clone(&state), recovery_gate)),
            )
            .with_state(state)
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Isolation level for write routes, e.g. `?isolationLevel=READ%20COMMITTED`
#[derive(Debug, Default, Deserialize)]
pub struct WriteParams {
    #[serde(rename = "isolationLevel")]
    pub isolation_level: Option<String>,
}

impl WriteParams {
    fn level(&self) -> Result<IsolationLevel> {
        match &self.isolation_level {
            Some(level) => level.parse(),
            None => Ok(IsolationLevel::default()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub search: String,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub id: Uuid,
    pub deleted: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error wrapper mapping failures onto status codes
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::NodeUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "node_unavailable"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::RecordNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::TransactionError { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "transaction_failed"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Middleware ============

async fn recovery_gate(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if state.gate.claim().await {
        state.recovery.recover().await;
    }
    next.run(request).await
}

// ============ Handlers ============

async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn handle_list(State(state): State<Arc<AppState>>, Query(params): Query<ListParams>) -> ApiResult<Vec<Record>> {
    Ok(Json(state.reader.list(params.limit).await?))
}

async fn handle_search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Vec<Record>> {
    tracing::debug!("Searching records: {}", params.search);
    Ok(Json(state.reader.search(&params.search, params.limit).await?))
}

async fn handle_report(State(state): State<Arc<AppState>>, Path(agg): Path<String>) -> ApiResult<RankReport> {
    let aggregate: RankAggregate = agg.parse()?;
    Ok(Json(state.reader.report(aggregate).await?))
}

async fn handle_get(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<Record> {
    match state.reader.get(id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(Error::RecordNotFound(id.to_string()).into()),
    }
}

async fn handle_create(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WriteParams>,
    Json(record): Json<Record>,
) -> ApiResult<Record> {
    let level = params.level()?;
    Ok(Json(state.writer.create(record, level).await?))
}

async fn handle_update(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WriteParams>,
    Json(record): Json<Record>,
) -> ApiResult<Record> {
    let level = params.level()?;
    Ok(Json(state.writer.update(record, level).await?))
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<WriteParams>,
) -> ApiResult<DeleteResponse> {
    let level = params.level()?;
    if state.writer.delete(id, level).await? {
        Ok(Json(DeleteResponse { id, deleted: true }))
    } else {
        Err(Error::RecordNotFound(id.to_string()).into())
    }
}

async fn handle_recover(State(state): State<Arc<AppState>>) -> Json<RecoveryReport> {
    Json(state.recovery.recover().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method};
    use tower::ServiceExt;

    use crate::node::memory::MemoryNode;
    use crate::node::{NodeRegistry, NodeRole, RetryPolicy};
    use crate::shard::ShardRouter;

    struct Fixture {
        central: Arc<MemoryNode>,
        before: Arc<MemoryNode>,
        after: Arc<MemoryNode>,
        state: Arc<AppState>,
    }

    fn fixture(gate: RecoveryGate) -> Fixture {
        let central = MemoryNode::new(NodeRole::Central);
        let before = MemoryNode::new(NodeRole::BeforeCutoff);
        let after = MemoryNode::new(NodeRole::AfterCutoff);
        let registry = Arc::new(NodeRegistry::from_backends(
            central.clone(),
            before.clone(),
            after.clone(),
        ));
        let policy = RetryPolicy::immediate(1);
        let state = Arc::new(AppState {
            writer: WriteCoordinator::new(Arc::clone(&registry), ShardRouter::new(1980), policy.clone()),
            reader: RecordReader::new(Arc::clone(&registry), policy.clone()),
            recovery: Arc::new(RecoveryManager::new(registry, policy)),
            gate,
        });
        Fixture {
            central,
            before,
            after,
            state,
        }
    }

    async fn send(state: &Arc<AppState>, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = HttpServer::router(Arc::clone(state))
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let f = fixture(RecoveryGate::disabled());
        let (status, body) = send(&f.state, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let f = fixture(RecoveryGate::disabled());

        let (status, created) = send(
            &f.state,
            Method::POST,
            "/records?isolationLevel=READ%20COMMITTED",
            Some(serde_json::json!({"name": "Melanie Darrow", "year": 1997, "rank": 5.1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = created["id"].as_str().unwrap().to_string();
        assert!(f.central.history().contains(&"SET TRANSACTION ISOLATION LEVEL".to_string()));

        let (status, fetched) = send(&f.state, Method::GET, &format!("/records/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, created);
        assert_eq!(f.after.records().len(), 1);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let f = fixture(RecoveryGate::disabled());

        let (status, body) = send(
            &f.state,
            Method::POST,
            "/records",
            Some(serde_json::json!({"name": "  ", "year": 1997})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_request");

        let (status, _) = send(
            &f.state,
            Method::POST,
            "/records?isolationLevel=SNAPSHOT",
            Some(serde_json::json!({"name": "X", "year": 1975})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&f.state, Method::GET, &format!("/records/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&f.state, Method::GET, "/records/report/median", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        f.central.set_reachable(false);
        f.before.set_reachable(false);
        let (status, body) = send(
            &f.state,
            Method::POST,
            "/records",
            Some(serde_json::json!({"name": "X", "year": 1975})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "node_unavailable");
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let f = fixture(RecoveryGate::disabled());
        let created = f
            .state
            .writer
            .create(Record::new("$1,000 Reward", 1913), IsolationLevel::default())
            .await
            .unwrap();
        let id = created.id.unwrap();

        let mut body = serde_json::to_value(&created).unwrap();
        body["rank"] = serde_json::json!(6.4);
        let (status, updated) = send(&f.state, Method::PUT, "/records", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["rank"], 6.4);
        assert_eq!(f.before.record(id).unwrap().rank, Some(6.4));

        let (status, deleted) = send(&f.state, Method::DELETE, &format!("/records/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["deleted"], true);

        let (status, _) = send(&f.state, Method::DELETE, &format!("/records/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_search_and_report() {
        let f = fixture(RecoveryGate::disabled());
        for (name, year, rank) in [("Melanie Darrow", 1997, 4.0), ("Melanios letzte Liebe", 1991, 8.0)] {
            let mut record = Record::new(name, year);
            record.rank = Some(rank);
            f.state.writer.create(record, IsolationLevel::default()).await.unwrap();
        }

        let (status, found) = send(&f.state, Method::GET, "/records/search?search=darrow", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found.as_array().unwrap().len(), 1);

        let (status, report) = send(&f.state, Method::GET, "/records/report/avg", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["value"], 6.0);
        assert_eq!(report["aggregate"], "avg");

        let (_, listed) = send(&f.state, Method::GET, "/records?limit=1", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gate_recovers_before_handling() {
        let f = fixture(RecoveryGate::new(true, Duration::from_secs(60)));

        f.before.set_reachable(false);
        let first = f.state.writer.create(Record::new("X", 1975), IsolationLevel::default()).await.unwrap();
        f.before.set_reachable(true);

        send(&f.state, Method::GET, "/health", None).await;
        assert!(f.before.record(first.id.unwrap()).is_some());
        assert!(f.central.active_wal().is_empty());

        // Within the interval the gate stays shut
        f.before.set_reachable(false);
        let second = f.state.writer.create(Record::new("Y", 1970), IsolationLevel::default()).await.unwrap();
        f.before.set_reachable(true);

        send(&f.state, Method::GET, "/health", None).await;
        assert!(f.before.record(second.id.unwrap()).is_none());
        assert_eq!(f.central.active_wal().len(), 1);
    }

    #[tokio::test]
    async fn test_admin_recover() {
        let f = fixture(RecoveryGate::disabled());
        f.after.set_reachable(false);
        f.state
            .writer
            .create(Record::new("Melanie Darrow", 1997), IsolationLevel::default())
            .await
            .unwrap();
        f.after.set_reachable(true);

        let (status, report) = send(&f.state, Method::POST, "/admin/recover", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["replayed"], 1);
        assert_eq!(f.after.records().len(), 1);
    }
}
