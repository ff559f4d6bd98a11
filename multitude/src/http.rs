//! HTTP server exposing the scrape endpoint and diagnostics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use axum::routing::get;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::{CacheStats, TargetSnapshot};
use crate::dispatch::Dispatcher;
use crate::exporter::ExporterFactory;

/// Application state shared across handlers.
struct AppState<F: ExporterFactory> {
    dispatcher: Arc<Dispatcher<F>>,
}

impl<F: ExporterFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

/// Body of the `/targets` endpoint.
#[derive(Debug, Serialize)]
struct TargetsReport {
    count: usize,
    stats: CacheStats,
    targets: Vec<TargetSnapshot>,
}

/// Create the HTTP router.
pub fn create_router<F: ExporterFactory>(dispatcher: Arc<Dispatcher<F>>) -> Router {
    let telemetry_path = dispatcher.config().web.telemetry_path.clone();
    let state = AppState { dispatcher };

    Router::new()
        .route(&telemetry_path, get(scrape_handler::<F>))
        .route("/health", get(health_handler))
        .route("/targets", get(targets_handler::<F>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handler for scrape requests.
async fn scrape_handler<F: ExporterFactory>(
    State(state): State<AppState<F>>,
    request: Request,
) -> Response {
    state.dispatcher.handle(request).await
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Handler for the /targets endpoint.
async fn targets_handler<F: ExporterFactory>(State(state): State<AppState<F>>) -> Response {
    let cache = state.dispatcher.cache();
    let targets = cache.entries();

    Json(TargetsReport {
        count: targets.len(),
        stats: cache.stats(),
        targets,
    })
    .into_response()
}

/// HTTP server configuration.
pub struct HttpServer<F: ExporterFactory> {
    dispatcher: Arc<Dispatcher<F>>,
    listen_addr: SocketAddr,
}

impl<F: ExporterFactory> HttpServer<F> {
    /// Create a new HTTP server.
    pub fn new(dispatcher: Arc<Dispatcher<F>>, listen_addr: SocketAddr) -> Self {
        Self {
            dispatcher,
            listen_addr,
        }
    }

    /// Bind the listen address and serve until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let path = self.dispatcher.config().web.telemetry_path.clone();
        let router = create_router(self.dispatcher);

        info!(addr = %addr, path = %path, "HTTP server listening");

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
    use crate::config::ProxyConfig;
    use crate::exporter::{ConstructionError, Exporter, ExporterOptions};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use multitude_common::Credentials;
    use tower::ServiceExt;

    struct FixedExporter;

    impl Exporter for FixedExporter {
        async fn serve(&self, _request: Request<Body>) -> Response {
            (StatusCode::OK, "mongodb_up 1\n").into_response()
        }
    }

    struct FixedFactory;

    impl ExporterFactory for FixedFactory {
        type Exporter = FixedExporter;

        async fn construct(
            &self,
            _options: ExporterOptions,
        ) -> Result<FixedExporter, ConstructionError> {
            Ok(FixedExporter)
        }
    }

    fn router_with_path(path: &str) -> (Router, Arc<Dispatcher<FixedFactory>>) {
        let mut config = ProxyConfig::default();
        config.credentials = Credentials::new("u", "p");
        config.web.telemetry_path = path.to_string();
        let dispatcher = Arc::new(Dispatcher::new(FixedFactory, config));
        (create_router(dispatcher.clone()), dispatcher)
    }

    #[tokio::test]
    async fn test_scrape_endpoint() {
        let (router, dispatcher) = router_with_path("/metrics");

        let response = router
            .oneshot(
                Request::get("/metrics?target=10.0.0.1:27017")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(dispatcher.cache().count(), 1);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"mongodb_up 1\n");
    }

    #[tokio::test]
    async fn test_scrape_endpoint_malformed() {
        let (router, dispatcher) = router_with_path("/metrics");

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(dispatcher.cache().count(), 0);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (router, _) = router_with_path("/metrics");

        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_targets_endpoint() {
        let (router, _) = router_with_path("/metrics");

        for _ in 0..2 {
            router
                .clone()
                .oneshot(
                    Request::get("/metrics?target=db01")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
        }

        let response = router
            .oneshot(Request::get("/targets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(report["count"], 1);
        assert_eq!(report["stats"]["constructions"], 1);
        assert_eq!(report["stats"]["hits"], 1);
        assert_eq!(report["targets"][0]["target"], "db01:27017");
    }

    #[tokio::test]
    async fn test_custom_telemetry_path() {
        let (router, _) = router_with_path("/scrape");

        let response = router
            .clone()
            .oneshot(
                Request::get("/scrape?target=db01")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Default path should 404
        let response = router
            .oneshot(
                Request::get("/metrics?target=db01")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
