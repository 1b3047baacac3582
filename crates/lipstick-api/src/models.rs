use chrono::{DateTime, Utc};
use lipstick_control::LinkInfo;
use lipstick_store::Domain;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Number of live control links
    pub active_tunnels: usize,
    /// Inbound connections waiting for a proxy stream
    pub pending_connections: usize,
    /// Relay sessions in progress
    pub active_relays: usize,
}

/// Authorized domain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainResponse {
    pub id: String,
    /// Normalized hostname
    pub name: String,
    /// Whether agents may register this domain
    pub enabled: bool,
    /// Whether an agent currently holds a control link for it
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DomainResponse {
    pub fn new(domain: Domain, connected: bool) -> Self {
        Self {
            id: domain.id,
            name: domain.name,
            enabled: domain.enabled,
            connected,
            created_at: domain.created_at,
            updated_at: domain.updated_at,
        }
    }
}

/// List of domains
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DomainList {
    pub domains: Vec<DomainResponse>,
    pub total: usize,
}

fn default_enabled() -> bool {
    true
}

/// Request to authorize a new domain
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateDomainRequest {
    /// Hostname, e.g. "api.example.com"
    pub name: String,
    /// Defaults to true
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Partial update of a domain
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateDomainRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Live control link
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelInfo {
    pub domain: String,
    pub link_id: String,
    pub registered_at: DateTime<Utc>,
}

impl From<LinkInfo> for TunnelInfo {
    fn from(info: LinkInfo) -> Self {
        Self {
            domain: info.domain,
            link_id: info.id.to_string(),
            registered_at: info.registered_at,
        }
    }
}

/// List of live control links
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelInfo>,
    pub total: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
