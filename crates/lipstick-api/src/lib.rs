//! Agent-facing WebSocket endpoints and the administrative REST API
//!
//! One axum router serves both: `/ws` and `/ws/{token}` for agents,
//! `/health` and `/api/openapi.json` publicly, and the `/domains` and
//! `/tunnels` admin routes behind the shared admin key.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod ws;
pub mod ws_io;

use axum::{
    middleware as axum_middleware,
    routing::get,
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use lipstick_control::ManagerHandle;
use lipstick_proto::CONTROL_PATH;
use lipstick_store::DomainStore;

pub use error::ApiError;
pub use ws_io::WebSocketIo;

/// Application state shared across handlers
pub struct AppState {
    pub manager: ManagerHandle,
    pub store: Arc<dyn DomainStore>,
    pub admin_key: String,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Lipstick API",
        version = "0.1.0",
        description = "Administrative API for the lipstick tunnel broker"
    ),
    paths(
        handlers::health_check,
        handlers::list_domains,
        handlers::get_domain,
        handlers::create_domain,
        handlers::update_domain,
        handlers::delete_domain,
        handlers::list_tunnels,
    ),
    components(
        schemas(
            models::HealthResponse,
            models::DomainResponse,
            models::DomainList,
            models::CreateDomainRequest,
            models::UpdateDomainRequest,
            models::TunnelInfo,
            models::TunnelList,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "domains", description = "Authorized domain management endpoints"),
        (name = "tunnels", description = "Live control link endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(
        config: ApiServerConfig,
        manager: ManagerHandle,
        store: Arc<dyn DomainStore>,
        admin_key: impl Into<String>,
    ) -> Self {
        let state = Arc::new(AppState {
            manager,
            store,
            admin_key: admin_key.into(),
        });

        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        // Public routes: health, OpenAPI document and the agent endpoints
        let public_router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/api/openapi.json", get(openapi_json))
            .route(CONTROL_PATH, get(ws::control_upgrade))
            .route(&format!("{}/{{token}}", CONTROL_PATH), get(ws::proxy_upgrade))
            .with_state(self.state.clone());

        // Admin routes (require the admin key)
        let admin_router = Router::new()
            .route(
                "/domains",
                get(handlers::list_domains).post(handlers::create_domain),
            )
            .route(
                "/domains/{name}",
                get(handlers::get_domain)
                    .patch(handlers::update_domain)
                    .delete(handlers::delete_domain),
            )
            .route("/tunnels", get(handlers::list_tunnels))
            .route_layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::require_admin,
            ))
            .with_state(self.state.clone());

        public_router
            .merge(admin_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Start the API server
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
