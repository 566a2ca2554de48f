use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LeaderboardEntries::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LeaderboardEntries::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(LeaderboardEntries::UserId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LeaderboardEntries::Difficulty)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LeaderboardEntries::TimeMs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(LeaderboardEntries::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_leaderboard_entries_user")
                            .from(LeaderboardEntries::Table, LeaderboardEntries::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_leaderboard_entries_user_difficulty")
                    .table(LeaderboardEntries::Table)
                    .col(LeaderboardEntries::UserId)
                    .col(LeaderboardEntries::Difficulty)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_leaderboard_entries_difficulty_time")
                    .table(LeaderboardEntries::Table)
                    .col(LeaderboardEntries::Difficulty)
                    .col(LeaderboardEntries::TimeMs)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LeaderboardEntries::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum LeaderboardEntries {
    Table,
    Id,
    UserId,
    Difficulty,
    TimeMs,
    CreatedAt,
}

#[derive(Iden)]
enum Users {
    Table,
    Id,
}
