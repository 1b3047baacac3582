//! Domain entity: a hostname agents are allowed to expose

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "domains")]
pub struct Model {
    /// UUID v4 as a string
    #[sea_orm(primary_key, auto_increment = false, column_type = "String(StringLen::N(36))")]
    pub id: String,

    /// Normalized (lower-case) hostname
    #[sea_orm(unique)]
    pub name: String,

    /// Disabled domains keep their record but cannot be registered by agents
    #[sea_orm(default_value = true)]
    pub enabled: bool,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
