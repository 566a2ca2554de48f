use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(LeaderboardReplays::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LeaderboardReplays::EntryId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LeaderboardReplays::Board).json().not_null())
                    .col(ColumnDef::new(LeaderboardReplays::Steps).json().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_leaderboard_replays_entry")
                            .from(LeaderboardReplays::Table, LeaderboardReplays::EntryId)
                            .to(LeaderboardEntries::Table, LeaderboardEntries::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(LeaderboardReplays::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum LeaderboardReplays {
    Table,
    EntryId,
    Board,
    Steps,
}

#[derive(Iden)]
enum LeaderboardEntries {
    Table,
    Id,
}
