//! Domain store trait and its SeaORM implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lipstick_router::{is_valid_domain, normalize_domain};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set, SqlErr,
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::domain;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Domain not found: {0}")]
    NotFound(String),

    #[error("Domain already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid domain name: {0}")]
    InvalidName(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

/// A domain agents may register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<domain::Model> for Domain {
    fn from(model: domain::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            enabled: model.enabled,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewDomain {
    pub name: String,
    pub enabled: bool,
}

impl NewDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct UpdateDomain {
    pub name: Option<String>,
    pub enabled: Option<bool>,
}

/// Authorization source for control link upgrades and the admin API
///
/// Names are normalized (trimmed, lower-cased, trailing dot removed) before
/// any lookup or write.
#[async_trait]
pub trait DomainStore: Send + Sync {
    async fn get_domain(&self, name: &str) -> Result<Domain, StoreError>;

    async fn list_domains(&self) -> Result<Vec<Domain>, StoreError>;

    async fn add_domain(&self, domain: NewDomain) -> Result<Domain, StoreError>;

    async fn update_domain(&self, name: &str, update: UpdateDomain)
        -> Result<Domain, StoreError>;

    async fn delete_domain(&self, name: &str) -> Result<(), StoreError>;

    /// True if `name` exists and is enabled
    async fn is_authorized(&self, name: &str) -> Result<bool, StoreError> {
        match self.get_domain(name).await {
            Ok(domain) => Ok(domain.enabled),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub struct SeaOrmDomainStore {
    db: DatabaseConnection,
}

impl SeaOrmDomainStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn find(&self, name: &str) -> Result<Option<domain::Model>, DbErr> {
        domain::Entity::find()
            .filter(domain::Column::Name.eq(name))
            .one(&self.db)
            .await
    }
}

fn validate_name(name: &str) -> Result<String, StoreError> {
    let normalized = normalize_domain(name);
    if !is_valid_domain(&normalized) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(normalized)
}

fn map_write_error(err: DbErr, name: &str) -> StoreError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => StoreError::AlreadyExists(name.to_string()),
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl DomainStore for SeaOrmDomainStore {
    async fn get_domain(&self, name: &str) -> Result<Domain, StoreError> {
        let name = normalize_domain(name);
        self.find(&name)
            .await?
            .map(Domain::from)
            .ok_or(StoreError::NotFound(name))
    }

    async fn list_domains(&self) -> Result<Vec<Domain>, StoreError> {
        let domains = domain::Entity::find()
            .order_by_asc(domain::Column::Name)
            .all(&self.db)
            .await?;
        Ok(domains.into_iter().map(Domain::from).collect())
    }

    async fn add_domain(&self, new_domain: NewDomain) -> Result<Domain, StoreError> {
        let name = validate_name(&new_domain.name)?;
        if self.find(&name).await?.is_some() {
            return Err(StoreError::AlreadyExists(name));
        }

        let now = Utc::now();
        let model = domain::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            name: Set(name.clone()),
            enabled: Set(new_domain.enabled),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
        .map_err(|e| map_write_error(e, &name))?;

        info!("Added domain {} (enabled: {})", model.name, model.enabled);
        Ok(model.into())
    }

    async fn update_domain(
        &self,
        name: &str,
        update: UpdateDomain,
    ) -> Result<Domain, StoreError> {
        let current_name = normalize_domain(name);
        let existing = self
            .find(&current_name)
            .await?
            .ok_or_else(|| StoreError::NotFound(current_name.clone()))?;

        let mut active: domain::ActiveModel = existing.into();
        let mut target_name = current_name.clone();

        if let Some(new_name) = update.name {
            let new_name = validate_name(&new_name)?;
            if new_name != current_name && self.find(&new_name).await?.is_some() {
                return Err(StoreError::AlreadyExists(new_name));
            }
            active.name = Set(new_name.clone());
            target_name = new_name;
        }
        if let Some(enabled) = update.enabled {
            active.enabled = Set(enabled);
        }
        active.updated_at = Set(Utc::now());

        let model = active
            .update(&self.db)
            .await
            .map_err(|e| map_write_error(e, &target_name))?;

        debug!("Updated domain {} -> {}", current_name, model.name);
        Ok(model.into())
    }

    async fn delete_domain(&self, name: &str) -> Result<(), StoreError> {
        let name = normalize_domain(name);
        let result = domain::Entity::delete_many()
            .filter(domain::Column::Name.eq(name.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(name));
        }

        info!("Deleted domain {}", name);
        Ok(())
    }
}
