use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use lipstick_router::normalize_domain;
use lipstick_store::{NewDomain, UpdateDomain};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::models::*;
use crate::AppState;

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_tunnels: state.manager.active_tunnels(),
        pending_connections: state.manager.pending_connections(),
        active_relays: state.manager.active_relays(),
    })
}

/// List authorized domains
#[utoipa::path(
    get,
    path = "/domains",
    responses(
        (status = 200, description = "List of domains", body = DomainList),
        (status = 401, description = "Missing or invalid admin key", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn list_domains(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DomainList>, ApiError> {
    debug!("Listing domains");

    let domains: Vec<DomainResponse> = state
        .store
        .list_domains()
        .await?
        .into_iter()
        .map(|domain| {
            let connected = state.manager.lookup(&domain.name).is_some();
            DomainResponse::new(domain, connected)
        })
        .collect();
    let total = domains.len();

    Ok(Json(DomainList { domains, total }))
}

/// Get a domain by name
#[utoipa::path(
    get,
    path = "/domains/{name}",
    params(
        ("name" = String, Path, description = "Domain name")
    ),
    responses(
        (status = 200, description = "Domain", body = DomainResponse),
        (status = 401, description = "Missing or invalid admin key", body = ErrorResponse),
        (status = 404, description = "Domain not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn get_domain(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<DomainResponse>, ApiError> {
    let domain = state.store.get_domain(&name).await?;
    let connected = state.manager.lookup(&domain.name).is_some();
    Ok(Json(DomainResponse::new(domain, connected)))
}

/// Authorize a new domain
#[utoipa::path(
    post,
    path = "/domains",
    request_body = CreateDomainRequest,
    responses(
        (status = 201, description = "Domain created", body = DomainResponse),
        (status = 400, description = "Invalid domain name", body = ErrorResponse),
        (status = 401, description = "Missing or invalid admin key", body = ErrorResponse),
        (status = 409, description = "Domain already exists", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn create_domain(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDomainRequest>,
) -> Result<(StatusCode, Json<DomainResponse>), ApiError> {
    let domain = state
        .store
        .add_domain(NewDomain {
            name: req.name,
            enabled: req.enabled,
        })
        .await?;

    info!("Authorized domain {}", domain.name);
    Ok((StatusCode::CREATED, Json(DomainResponse::new(domain, false))))
}

/// Update a domain
///
/// Disabling or renaming a domain closes its live control link.
#[utoipa::path(
    patch,
    path = "/domains/{name}",
    params(
        ("name" = String, Path, description = "Domain name")
    ),
    request_body = UpdateDomainRequest,
    responses(
        (status = 200, description = "Domain updated", body = DomainResponse),
        (status = 400, description = "Invalid domain name", body = ErrorResponse),
        (status = 401, description = "Missing or invalid admin key", body = ErrorResponse),
        (status = 404, description = "Domain not found", body = ErrorResponse),
        (status = 409, description = "Target name already exists", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn update_domain(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<UpdateDomainRequest>,
) -> Result<Json<DomainResponse>, ApiError> {
    let previous_name = normalize_domain(&name);
    let domain = state
        .store
        .update_domain(
            &previous_name,
            UpdateDomain {
                name: req.name,
                enabled: req.enabled,
            },
        )
        .await?;

    if domain.name != previous_name || !domain.enabled {
        state.manager.close_domain(&previous_name);
    }

    let connected = state.manager.lookup(&domain.name).is_some();
    Ok(Json(DomainResponse::new(domain, connected)))
}

/// Remove a domain
///
/// Closes its live control link, if any.
#[utoipa::path(
    delete,
    path = "/domains/{name}",
    params(
        ("name" = String, Path, description = "Domain name")
    ),
    responses(
        (status = 204, description = "Domain deleted"),
        (status = 401, description = "Missing or invalid admin key", body = ErrorResponse),
        (status = 404, description = "Domain not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "domains"
)]
pub async fn delete_domain(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let name = normalize_domain(&name);
    state.store.delete_domain(&name).await?;
    state.manager.close_domain(&name);

    info!("Removed domain {}", name);
    Ok(StatusCode::NO_CONTENT)
}

/// List live control links
#[utoipa::path(
    get,
    path = "/tunnels",
    responses(
        (status = 200, description = "Live control links", body = TunnelList),
        (status = 401, description = "Missing or invalid admin key", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn list_tunnels(State(state): State<Arc<AppState>>) -> Json<TunnelList> {
    let tunnels: Vec<TunnelInfo> = state
        .manager
        .list_links()
        .into_iter()
        .map(TunnelInfo::from)
        .collect();
    let total = tunnels.len();

    Json(TunnelList { tunnels, total })
}
