//! HTTP server for the scrape and self-metrics endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};
use weatherflow_common::{DeviceId, redact};

use crate::metrics::ExporterMetrics;
use crate::session::SessionManager;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Rejected scrape request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("Missing or malformed query parameters: token is required")]
    MissingToken,
    #[error("Missing or malformed query parameters: device_id is required")]
    MissingDeviceId,
    #[error("Missing or malformed query parameters: device_id must be an integer, got {0:?}")]
    InvalidDeviceId(String),
}

impl IntoResponse for ScrapeError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, format!("{}\n", self)).into_response()
    }
}

/// Raw scrape query; validated by [`ScrapeParams::validate`].
#[derive(Debug, Default, Deserialize)]
struct ScrapeParams {
    token: Option<String>,
    device_id: Option<String>,
}

impl ScrapeParams {
    fn validate(self) -> Result<(String, DeviceId), ScrapeError> {
        let token = self
            .token
            .filter(|t| !t.is_empty())
            .ok_or(ScrapeError::MissingToken)?;

        let raw = self
            .device_id
            .filter(|d| !d.is_empty())
            .ok_or(ScrapeError::MissingDeviceId)?;
        let device_id = raw
            .parse::<DeviceId>()
            .map_err(|_| ScrapeError::InvalidDeviceId(raw.clone()))?;

        Ok((token, device_id))
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    sessions: Arc<SessionManager>,
    metrics: Arc<ExporterMetrics>,
}

/// Create the HTTP router.
fn create_router(
    sessions: Arc<SessionManager>,
    metrics: Arc<ExporterMetrics>,
    scrape_path: &str,
    metrics_path: &str,
) -> Router {
    let state = AppState { sessions, metrics };

    Router::new()
        .route(scrape_path, get(scrape_handler))
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the per-device scrape endpoint.
async fn scrape_handler(
    State(state): State<AppState>,
    Query(params): Query<ScrapeParams>,
) -> Result<Response, ScrapeError> {
    let (token, device_id) = params.validate().inspect_err(|e| {
        state.metrics.record_rejected_scrape();
        debug!(error = %e, "Rejected scrape request");
    })?;

    state.metrics.record_scrape();
    let (_collector, registry) = state.sessions.get_or_create(&token, device_id);
    let body = registry.render();

    debug!(token = %redact(&token), device_id, bytes = body.len(), "Served scrape");

    Ok((
        StatusCode::OK,
        [("content-type", EXPOSITION_CONTENT_TYPE)],
        body,
    )
        .into_response())
}

/// Handler for the self-metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [("content-type", OPENMETRICS_CONTENT_TYPE)],
        state.metrics.render(),
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    sessions: Arc<SessionManager>,
    metrics: Arc<ExporterMetrics>,
    listen_addr: SocketAddr,
    scrape_path: String,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        sessions: Arc<SessionManager>,
        metrics: Arc<ExporterMetrics>,
        listen_addr: SocketAddr,
        scrape_path: String,
        metrics_path: String,
    ) -> Self {
        Self {
            sessions,
            metrics,
            listen_addr,
            scrape_path,
            metrics_path,
        }
    }

    /// Build the router without binding a socket.
    pub fn router(&self) -> Router {
        create_router(
            self.sessions.clone(),
            self.metrics.clone(),
            &self.scrape_path,
            &self.metrics_path,
        )
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let router = self.router();
        let addr = listener.local_addr()?;

        info!(
            addr = %addr,
            scrape_path = %self.scrape_path,
            metrics_path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DEFAULT_PREFIX, MetricCatalog};
    use crate::config::ExporterConfig;
    use crate::feed::{FeedConnector, FeedHandle, MessageHandler};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    struct NullFeed;

    impl FeedHandle for NullFeed {
        fn add_device(&self, _device_id: DeviceId) {}
        fn remove_device(&self, _device_id: DeviceId) {}
        fn device_count(&self) -> usize {
            0
        }
        fn close(&self) {}
    }

    struct NullConnector;

    impl FeedConnector for NullConnector {
        fn open(&self, _token: &str, _on_message: MessageHandler) -> Box<dyn FeedHandle> {
            Box::new(NullFeed)
        }
    }

    fn make_router() -> (Router, Arc<SessionManager>) {
        let catalog = Arc::new(MetricCatalog::standard(DEFAULT_PREFIX).unwrap());
        let metrics = Arc::new(ExporterMetrics::new());
        let sessions = Arc::new(SessionManager::new(
            &ExporterConfig::default(),
            catalog,
            Arc::new(NullConnector),
            metrics.clone(),
        ));
        let router = create_router(sessions.clone(), metrics, "/scrape", "/metrics");
        (router, sessions)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_scrape_missing_parameters() {
        let (router, sessions) = make_router();

        for uri in [
            "/scrape",
            "/scrape?device_id=42",
            "/scrape?token=&device_id=42",
            "/scrape?token=abc",
            "/scrape?token=abc&device_id=",
        ] {
            let (status, body) = get(router.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
            assert!(body.starts_with("Missing or malformed query parameters"));
        }

        assert_eq!(sessions.stats().created, 0);
    }

    #[tokio::test]
    async fn test_scrape_non_integer_device_id() {
        let (router, sessions) = make_router();

        let (status, body) = get(router, "/scrape?token=abc&device_id=tempest").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("device_id must be an integer"));
        assert_eq!(sessions.stats().devices, 0);
    }

    #[tokio::test]
    async fn test_scrape_creates_session() {
        let (router, sessions) = make_router();

        let response = router
            .oneshot(
                Request::get("/scrape?token=abc&device_id=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert_eq!(content_type.to_str().unwrap(), EXPOSITION_CONTENT_TYPE);
        assert!(sessions.contains("abc", 42));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (router, _) = make_router();

        get(router.clone(), "/scrape").await;
        get(router.clone(), "/scrape?token=abc&device_id=1").await;
        let (status, body) = get(router, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("weatherflow_exporter_scrape_requests_total 1"));
        assert!(body.contains("weatherflow_exporter_scrape_rejected_total 1"));
        assert!(body.contains("weatherflow_exporter_active_devices 1"));
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (router, _) = make_router();

        let (status, body) = get(router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "healthy\n");
    }

    #[tokio::test]
    async fn test_scrape_padded_device_id_rejected() {
        let (router, sessions) = make_router();

        let (status, body) = get(router, "/scrape?token=abc&device_id=%2042%20").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("device_id must be an integer"));
        assert_eq!(sessions.stats().devices, 0);
    }

    #[test]
    fn test_validate_device_id_verbatim() {
        let params = ScrapeParams {
            token: Some("abc".to_string()),
            device_id: Some(" -17 ".to_string()),
        };
        assert_eq!(
            params.validate(),
            Err(ScrapeError::InvalidDeviceId(" -17 ".to_string()))
        );

        let params = ScrapeParams {
            token: Some("abc".to_string()),
            device_id: Some("-17".to_string()),
        };
        assert_eq!(params.validate(), Ok(("abc".to_string(), -17)));
    }

    #[test]
    fn test_validate_whitespace_token_accepted() {
        let params = ScrapeParams {
            token: Some("   ".to_string()),
            device_id: Some("42".to_string()),
        };
        assert_eq!(params.validate(), Ok(("   ".to_string(), 42)));

        let params = ScrapeParams {
            token: Some(String::new()),
            device_id: Some("42".to_string()),
        };
        assert_eq!(params.validate(), Err(ScrapeError::MissingToken));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_includes_process_metrics() {
        let (router, _) = make_router();

        let (status, body) = get(router, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE process_resident_memory_bytes gauge"));
        assert!(body.contains("# TYPE weatherflow_exporter_scrape_requests counter"));
    }
}
