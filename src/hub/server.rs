use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, HubDb};
use super::identity::provider_from_config;
use crate::config::HubToml;

/// Build the application router. Dev mode adds a permissive CORS layer so a
/// local front-end on another port can call the API.
pub fn build_router(state: Arc<AppState>) -> Router {
    let dev_mode = state.config.server.dev_mode;
    let app = api::api_router().fallback(not_found).with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "No such route"})),
    )
}

/// Open the database, wire the identity provider, and serve until Ctrl+C.
pub async fn start_server(config: HubToml) -> Result<()> {
    let db_path = config.server.db_path.clone();
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = HubDb::new(&db_path).context("Failed to initialize hub database")?;
    let identity = provider_from_config(&config.identity)?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        identity,
        config,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, db = %db_path.display(), "AgencyHub listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::identity::LocalIdentityProvider;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router(dev_mode: bool) -> Router {
        let mut config = HubToml::default();
        config.server.dev_mode = dev_mode;
        let state = Arc::new(AppState {
            db: DbHandle::new(HubDb::new_in_memory().unwrap()),
            identity: Arc::new(LocalIdentityProvider::new()),
            config,
        });
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_returns_json_404() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/nowhere")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "No such route");
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router(false);
        let req = Request::builder()
            .uri("/api/me")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_dev_mode_adds_cors_headers() {
        let req = || {
            Request::builder()
                .uri("/health")
                .header(header::ORIGIN, "http://localhost:3000")
                .body(Body::empty())
                .unwrap()
        };
        let resp = test_router(true).oneshot(req()).await.unwrap();
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

        let resp = test_router(false).oneshot(req()).await.unwrap();
        assert!(!resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
