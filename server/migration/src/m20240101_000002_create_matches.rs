use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Matches::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Matches::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Matches::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Matches::Width).integer().not_null())
                    .col(ColumnDef::new(Matches::Height).integer().not_null())
                    .col(ColumnDef::new(Matches::Mines).integer().not_null())
                    .col(ColumnDef::new(Matches::Seed).text().not_null())
                    .col(ColumnDef::new(Matches::Difficulty).text().not_null())
                    .col(ColumnDef::new(Matches::SafeX).integer().not_null())
                    .col(ColumnDef::new(Matches::SafeY).integer().not_null())
                    // Set right after the host seat is inserted, inside the
                    // same transaction. Nullable to break the insert cycle.
                    .col(ColumnDef::new(Matches::HostId).big_integer().null())
                    .col(ColumnDef::new(Matches::CountdownSecs).integer().not_null())
                    .col(
                        ColumnDef::new(Matches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Matches::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Matches::EndedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Matches::LastActivityAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_matches_status")
                    .table(Matches::Table)
                    .col(Matches::Status)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_matches_created_at")
                    .table(Matches::Table)
                    .col(Matches::CreatedAt)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Matches::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum Matches {
    Table,
    Id,
    Status,
    Width,
    Height,
    Mines,
    Seed,
    Difficulty,
    SafeX,
    SafeY,
    HostId,
    CountdownSecs,
    CreatedAt,
    StartedAt,
    EndedAt,
    LastActivityAt,
}
