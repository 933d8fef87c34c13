//! HTTP API Server
//!
//! Read-only status endpoints for operators and orchestrators.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::store::{Role, Store};

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    store: Store,
}

impl HttpServer {
    pub fn new(config: ApiConfig, store: Store) -> Self {
        Self { config, store }
    }

    /// Create the router
    pub fn router(store: Store) -> Router {
        Router::new()
            .route("/status", get(handle_status))
            .route("/ready", get(handle_ready))
            .route("/health", get(handle_health))
            .route("/databases/:name", get(handle_database))
            .layer(TraceLayer::new_for_http())
            .with_state(store)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::router(self.store.clone());

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

/// Readiness response
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub role: Role,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub role: Role,
}

async fn handle_status(State(store): State<Store>) -> impl IntoResponse {
    Json(store.status().await)
}

async fn handle_ready(State(store): State<Store>) -> impl IntoResponse {
    let body = ReadyResponse {
        ready: store.ready(),
        role: store.role(),
    };
    let code = if body.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

async fn handle_health(State(store): State<Store>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: store.node_id().to_string(),
        role: store.role(),
    })
}

async fn handle_database(
    State(store): State<Store>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let status = store.status().await;
    match status.databases.into_iter().find(|db| db.name == name) {
        Some(db) => (StatusCode::OK, Json(serde_json::json!(db))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("database {} not found", name) })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{NoopInvalidator, Page, PageDiff};
    use crate::config::{StaticConfig, WolfLiteConfig};
    use crate::lease::StaticLeaser;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn store(dir: &std::path::Path) -> Store {
        let mut config = WolfLiteConfig::new("node-1", dir);
        config.node.bind_address = "127.0.0.1:0".into();
        config.log.fsync = false;
        let leaser = Arc::new(StaticLeaser::new(
            &StaticConfig {
                primary: true,
                hostname: "node-1".into(),
                advertise_address: "127.0.0.1:1".into(),
            },
            "node-1",
        ));
        Store::open(config, leaser, Arc::new(NoopInvalidator)).await.unwrap()
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_ready_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;

        let (status, body) = get(HttpServer::router(store), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);
        assert_eq!(body["role"], "candidate");
    }

    #[tokio::test]
    async fn test_status_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.start().await.unwrap();
        store.wait_ready().await.unwrap();

        let diff = PageDiff::new(
            512,
            1,
            vec![Page {
                pgno: 1,
                data: vec![1; 512],
            }],
        );
        store.commit("app.db", diff).await.unwrap();

        let (status, body) = get(HttpServer::router(store.clone()), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "primary");

        let (status, body) = get(HttpServer::router(store.clone()), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "node-1");
        assert_eq!(body["lease"], "static");
        assert_eq!(body["databases"][0]["name"], "app.db");
        assert_eq!(body["databases"][0]["position"], 1);

        let (status, _) = get(HttpServer::router(store.clone()), "/databases/missing.db").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        store.close().await.unwrap();
    }
}
