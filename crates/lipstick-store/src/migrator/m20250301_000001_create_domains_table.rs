//! Migration to create the domains table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Domains::Table)
                    .if_not_exists()
                    .col(string_len(Domains::Id, 36).primary_key())
                    .col(string_len(Domains::Name, 253).not_null().unique_key())
                    .col(boolean(Domains::Enabled).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(Domains::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(Domains::UpdatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Enabled flag is checked on every control link upgrade
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_domains_enabled")
                    .table(Domains::Table)
                    .col(Domains::Enabled)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Domains::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Domains {
    Table,
    Id,
    Name,
    Enabled,
    CreatedAt,
    UpdatedAt,
}
