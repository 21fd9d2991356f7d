//! HTTP health endpoints.
//!
//! Every configured path answers `GET` from the shared `BridgeState`:
//! a dead child wins over readiness, so a killed bridge never reports
//! "not ready" while it is actually gone.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, route_paths};
use crate::state::{BridgePhase, BridgeState};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub host: String,
    pub port: u16,
    pub paths: Vec<String>,
    pub cors: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            paths: Vec::new(),
            cors: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("failed to bind health server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    InvalidPath(#[from] ConfigError),
}

async fn health(State(state): State<Arc<BridgeState>>) -> Response {
    let snapshot = state.snapshot();
    if !snapshot.process_alive && snapshot.phase != BridgePhase::Starting {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Child process has been killed").into_response();
    }
    if !snapshot.is_ready() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Server is not ready").into_response();
    }
    (StatusCode::OK, "OK").into_response()
}

/// Router answering `GET` on each path. Duplicates are served once.
pub fn routes(
    paths: &[String],
    state: Arc<BridgeState>,
    cors: bool,
) -> Result<Router, HealthError> {
    let router = route_paths(paths)?
        .iter()
        .fold(Router::new(), |router, path| router.route(path, get(health)))
        .with_state(state);
    if cors {
        Ok(router.layer(CorsLayer::permissive()))
    } else {
        Ok(router)
    }
}

/// A running health server.
#[derive(Debug)]
pub struct HealthServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl HealthServer {
    /// Bind and serve. Returns `None` when no paths are configured.
    pub async fn start(
        config: &HealthConfig,
        state: Arc<BridgeState>,
    ) -> Result<Option<Self>, HealthError> {
        if config.paths.is_empty() {
            return Ok(None);
        }

        let paths = route_paths(&config.paths)?;
        let app = routes(&paths, state, config.cors)?;

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| HealthError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HealthError::Bind { addr, source })?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await
        });

        for path in &paths {
            info!("Health endpoint: http://{}{}", local_addr, path);
        }

        Ok(Some(Self {
            local_addr,
            shutdown,
            task,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, self.task).await {
            Ok(Ok(Ok(()))) => debug!("Health server stopped"),
            Ok(Ok(Err(e))) => warn!(error = %e, "Health server failed"),
            Ok(Err(e)) => warn!(error = %e, "Health server task failed"),
            Err(_) => warn!("Timed out stopping health server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn response_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn check(state: &Arc<BridgeState>, path: &str) -> (StatusCode, String) {
        let app = routes(&["/healthz".to_string()], Arc::clone(state), false).unwrap();
        let response = app
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, response_text(response).await)
    }

    #[tokio::test]
    async fn not_ready_while_starting() {
        let state = Arc::new(BridgeState::new());
        state.mark_process_started();

        let (status, body) = check(&state, "/healthz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Server is not ready");
    }

    #[tokio::test]
    async fn not_ready_before_spawn() {
        let state = Arc::new(BridgeState::new());

        let (status, body) = check(&state, "/healthz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Server is not ready");
    }

    #[tokio::test]
    async fn ok_when_ready_and_alive() {
        let state = Arc::new(BridgeState::new());
        state.mark_process_started();
        state.mark_ready();

        let (status, body) = check(&state, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn killed_child_takes_precedence() {
        let state = Arc::new(BridgeState::new());
        state.mark_process_started();
        state.mark_ready();
        state.mark_process_gone();
        state.begin_shutdown();

        let (status, body) = check(&state, "/healthz").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Child process has been killed");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let state = Arc::new(BridgeState::new());
        let (status, _) = check(&state, "/other").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn post_is_405() {
        let state = Arc::new(BridgeState::new());
        let app = routes(&["/healthz".to_string()], state, false).unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn every_path_is_served_and_duplicates_tolerated() {
        let state = Arc::new(BridgeState::new());
        state.mark_process_started();
        state.mark_ready();
        let paths = vec![
            "/healthz".to_string(),
            "ready".to_string(),
            "/healthz".to_string(),
        ];

        for path in ["/healthz", "/ready"] {
            let app = routes(&paths, Arc::clone(&state), false).unwrap();
            let response = app
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "path {}", path);
        }
    }

    #[tokio::test]
    async fn cors_headers_when_enabled() {
        let state = Arc::new(BridgeState::new());
        let app = routes(&["/healthz".to_string()], state, true).unwrap();
        let response = app
            .oneshot(
                Request::get("/healthz")
                    .header("origin", "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn no_paths_starts_nothing() {
        let config = HealthConfig::default();
        let server = HealthServer::start(&config, Arc::new(BridgeState::new()))
            .await
            .unwrap();
        assert!(server.is_none());
    }

    #[tokio::test]
    async fn server_binds_and_stops() {
        let config = HealthConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            paths: vec!["/healthz".to_string()],
            cors: false,
        };
        let server = HealthServer::start(&config, Arc::new(BridgeState::new()))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn port_in_use_is_bind_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = HealthConfig {
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
            paths: vec!["/healthz".to_string()],
            cors: false,
        };
        let err = HealthServer::start(&config, Arc::new(BridgeState::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::Bind { .. }));
    }

    #[test]
    fn router_syntax_in_paths_is_rejected() {
        for path in ["/:status", "/{x", "/{*rest}"] {
            let err = routes(&[path.to_string()], Arc::new(BridgeState::new()), false)
                .err()
                .unwrap();
            assert!(matches!(err, HealthError::InvalidPath(_)), "{}", path);
        }
    }

    #[tokio::test]
    async fn invalid_path_fails_before_binding() {
        let config = HealthConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            paths: vec!["/ok".to_string(), "/{x".to_string()],
            cors: false,
        };
        let err = HealthServer::start(&config, Arc::new(BridgeState::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::InvalidPath(_)));
    }
}
