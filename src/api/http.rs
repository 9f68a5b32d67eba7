//! HTTP API Server
//!
//! A single resource at `/`: GET lists every record, POST appends one.
//! Writes that land on a replica are handed to the primary region through
//! the replay header instead of being applied locally.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::store::{Record, RecordId, RecordStore};
use crate::topology::{Topology, WriteRoute, REPLAY_HEADER};

/// Body returned by GET when the table is empty
pub const NO_RECORDS_MESSAGE: &str = "No records found. Please POST to add one.\n";

/// Shared application state
pub struct AppState {
    /// Region topology of this node
    pub topology: Topology,
    /// Record storage
    pub store: Arc<dyn RecordStore>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, topology: Topology, store: Arc<dyn RecordStore>) -> Self {
        let state = Arc::new(AppState { topology, store });
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Build the router with this server's middleware
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), self.config.request_timeout())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let address = self.config.listen_address();
        let listener = tokio::net::TcpListener::bind(&address).await?;
        tracing::info!("listening on {}", address);

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: tokio::net::TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, request_timeout: std::time::Duration) -> Router {
    Router::new()
        .route(
            "/",
            get(handle_list)
                .post(handle_write)
                .fallback(handle_method_not_allowed),
        )
        .fallback(handle_not_found)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Handlers ============

async fn handle_list(State(state): State<Arc<AppState>>) -> Response {
    match state.store.records().await {
        Ok(records) => render_records(&records).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_write(State(state): State<Arc<AppState>>, body: Body) -> Response {
    // Routing precedes validation: a replica never looks at the body.
    match state.topology.route_write() {
        WriteRoute::Local => {}
        route @ WriteRoute::Replay { .. } => {
            tracing::info!(
                "redirecting write to primary region {}",
                state.topology.primary_region()
            );
            return replay_response(&route);
        }
    }

    match insert_body(state.store.as_ref(), body).await {
        Ok(id) => format!("Record #{} successfully inserted.\n", id).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found\n").into_response()
}

async fn handle_method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "GET, POST")],
        "Method not allowed\n",
    )
        .into_response()
}

// ============ Helpers ============

async fn insert_body(store: &dyn RecordStore, body: Body) -> Result<RecordId> {
    let bytes: Bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| Error::Body(e.to_string()))?;

    if bytes.is_empty() {
        return Err(Error::EmptyBody);
    }

    store.insert(&bytes).await
}

fn render_records(records: &[Record]) -> String {
    if records.is_empty() {
        return NO_RECORDS_MESSAGE.to_string();
    }

    records.iter().map(|record| format!("{}\n", record)).collect()
}

/// Encode a replay decision as an empty 200 carrying the replay header
fn replay_response(route: &WriteRoute) -> Response {
    let Some(value) = route.replay_header_value() else {
        return StatusCode::OK.into_response();
    };

    match HeaderValue::from_str(&value) {
        Ok(value) => (StatusCode::OK, [(REPLAY_HEADER, value)]).into_response(),
        Err(e) => error_response(&Error::Internal(format!("invalid replay header: {}", e))),
    }
}

fn error_response(err: &Error) -> Response {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        tracing::warn!("request failed: {}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, format!("{}\n", err)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::{HeaderMap, Method, Request};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    use crate::config::{DatabaseConfig, RegionConfig};
    use crate::store::SqliteStore;
    use crate::topology::NodeRole;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn topology(current: &str) -> Topology {
        Topology::new(RegionConfig {
            app_name: "records".into(),
            current_region: current.into(),
            primary_region: "ord".into(),
        })
    }

    /// In-memory store that counts inserts
    #[derive(Default)]
    struct MemoryStore {
        records: Mutex<Vec<Record>>,
        inserts: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn records(&self) -> Result<Vec<Record>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn insert(&self, value: &[u8]) -> Result<RecordId> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            let mut records = self.records.lock().unwrap();
            let id = records.len() as RecordId + 1;
            records.push(Record::new(id, value));
            Ok(id)
        }
    }

    /// Store whose every call fails
    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn records(&self) -> Result<Vec<Record>> {
            Err(Error::Database(rusqlite::Error::InvalidQuery))
        }

        async fn insert(&self, _value: &[u8]) -> Result<RecordId> {
            Err(Error::Database(rusqlite::Error::InvalidQuery))
        }
    }

    /// Store that never answers in time
    struct SlowStore;

    #[async_trait]
    impl RecordStore for SlowStore {
        async fn records(&self) -> Result<Vec<Record>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Vec::new())
        }

        async fn insert(&self, _value: &[u8]) -> Result<RecordId> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        }
    }

    fn router_with(topology: Topology, store: Arc<dyn RecordStore>) -> Router {
        create_router(Arc::new(AppState { topology, store }), TIMEOUT)
    }

    fn sqlite_primary() -> (TempDir, Router) {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new(dir.path().join("records.db").to_string_lossy().into_owned());
        let store = SqliteStore::open_for_role(&config, NodeRole::Primary).unwrap();
        (dir, router_with(topology("ord"), Arc::new(store)))
    }

    async fn send(router: &Router, method: Method, uri: &str, body: impl Into<Body>) -> (StatusCode, HeaderMap, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_empty_table_hint() {
        let (_dir, router) = sqlite_primary();

        let (status, _, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, NO_RECORDS_MESSAGE);
    }

    #[tokio::test]
    async fn test_insert_then_read() {
        let (_dir, router) = sqlite_primary();

        let (status, headers, body) = send(&router, Method::POST, "/", "hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Record #1 successfully inserted.\n");
        assert!(headers.get(REPLAY_HEADER).is_none());

        let (status, _, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Record #1: \"hello\"\n");
    }

    #[tokio::test]
    async fn test_reads_list_records_in_order() {
        let (_dir, router) = sqlite_primary();

        for value in ["first", "second", "third \"quoted\""] {
            let (status, _, _) = send(&router, Method::POST, "/", value).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, _, first) = send(&router, Method::GET, "/", Body::empty()).await;
        let (_, _, second) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(
            first,
            "Record #1: \"first\"\nRecord #2: \"second\"\nRecord #3: \"third \\\"quoted\\\"\"\n"
        );
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_body_is_rejected() {
        let (_dir, router) = sqlite_primary();

        let (status, _, body) = send(&router, Method::POST, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "request body required\n");

        let (_, _, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(body, NO_RECORDS_MESSAGE);
    }

    #[tokio::test]
    async fn test_single_space_is_a_value() {
        let (_dir, router) = sqlite_primary();

        let (status, _, body) = send(&router, Method::POST, "/", " ").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Record #1 successfully inserted.\n");

        let (_, _, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(body, "Record #1: \" \"\n");
    }

    #[tokio::test]
    async fn test_binary_body_is_stored_verbatim() {
        let (_dir, router) = sqlite_primary();

        let (status, _, body) = send(&router, Method::POST, "/", vec![0xffu8]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Record #1 successfully inserted.\n");

        let (status, _, _) = send(&router, Method::POST, "/", b"a\x01\x7f".to_vec()).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Record #1: \"\\xff\"\nRecord #2: \"a\\x01\\x7f\"\n");
    }

    #[tokio::test]
    async fn test_replica_without_database_fails_per_request() {
        let dir = tempdir().unwrap();
        let mut config = DatabaseConfig::new(dir.path().join("records.db").to_string_lossy().into_owned());
        config.connect_timeout_ms = 100;
        let store = SqliteStore::open_for_role(&config, NodeRole::Replica).unwrap();
        let router = router_with(topology("lhr"), Arc::new(store));

        let (status, _, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.is_empty());

        // Writes are still handed off without touching storage.
        let (status, headers, _) = send(&router, Method::POST, "/", "hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(REPLAY_HEADER).unwrap(), "region=ord");
    }

    #[tokio::test]
    async fn test_replica_redirects_writes() {
        let store = Arc::new(MemoryStore::default());
        let router = router_with(topology("lhr"), store.clone());

        for body in ["hello", ""] {
            let (status, headers, text) = send(&router, Method::POST, "/", body).await;
            assert_eq!(status, StatusCode::OK);
            assert!(text.is_empty());
            assert_eq!(headers.get(REPLAY_HEADER).unwrap(), "region=ord");
        }

        assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_replica_serves_reads() {
        let store = Arc::new(MemoryStore::default());
        store.insert(b"replicated").await.unwrap();
        let router = router_with(topology("lhr"), store);

        let (status, headers, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.get(REPLAY_HEADER).is_none());
        assert_eq!(body, "Record #1: \"replicated\"\n");
    }

    #[tokio::test]
    async fn test_unknown_path_on_any_node() {
        for region in ["ord", "lhr"] {
            let router = router_with(topology(region), Arc::new(MemoryStore::default()));
            let (status, _, _) = send(&router, Method::GET, "/unknown", Body::empty()).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            let (status, _, _) = send(&router, Method::POST, "/unknown", "x").await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_other_methods_not_allowed() {
        let router = router_with(topology("ord"), Arc::new(MemoryStore::default()));

        for method in [Method::DELETE, Method::PUT, Method::PATCH] {
            let (status, headers, body) = send(&router, method, "/", Body::empty()).await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(headers.get(header::ALLOW).unwrap(), "GET, POST");
            assert_eq!(body, "Method not allowed\n");
        }
    }

    #[tokio::test]
    async fn test_storage_errors_surface_as_500() {
        let router = router_with(topology("ord"), Arc::new(FailingStore));
        let expected = format!("{}\n", rusqlite::Error::InvalidQuery);

        let (status, _, body) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, expected);

        let (status, _, body) = send(&router, Method::POST, "/", "hello").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn test_slow_requests_time_out() {
        let state = Arc::new(AppState {
            topology: topology("ord"),
            store: Arc::new(SlowStore),
        });
        let router = create_router(state, Duration::from_millis(20));

        let (status, _, _) = send(&router, Method::GET, "/", Body::empty()).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_server_round_trip_over_tcp() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::new(dir.path().join("records.db").to_string_lossy().into_owned());
        let store = Arc::new(SqliteStore::open_for_role(&config, NodeRole::Primary).unwrap());

        let server = HttpServer::new(ApiConfig::default(), topology("ord"), store.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let client = reqwest::Client::new();
        let url = format!("http://{}/", address);
        let response = client.post(&url).body("over the wire").send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.text().await.unwrap(), "Record #1 successfully inserted.\n");

        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.text().await.unwrap(), "Record #1: \"over the wire\"\n");
        drop(client);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(store.records().await.unwrap().len(), 1);
    }
}
