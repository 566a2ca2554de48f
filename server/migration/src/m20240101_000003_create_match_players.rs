use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MatchPlayers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MatchPlayers::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MatchPlayers::MatchId).big_integer().not_null())
                    .col(ColumnDef::new(MatchPlayers::UserId).big_integer().not_null())
                    .col(
                        ColumnDef::new(MatchPlayers::Token)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(MatchPlayers::Ready)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(MatchPlayers::Result).text().null())
                    .col(ColumnDef::new(MatchPlayers::DurationMs).big_integer().null())
                    .col(
                        ColumnDef::new(MatchPlayers::StepsCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(MatchPlayers::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(MatchPlayers::Rank).integer().null())
                    .col(ColumnDef::new(MatchPlayers::Progress).json().null())
                    .col(
                        ColumnDef::new(MatchPlayers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_match_players_match")
                            .from(MatchPlayers::Table, MatchPlayers::MatchId)
                            .to(Matches::Table, Matches::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_match_players_user")
                            .from(MatchPlayers::Table, MatchPlayers::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_match_players_match")
                    .table(MatchPlayers::Table)
                    .col(MatchPlayers::MatchId)
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_match_players_user")
                    .table(MatchPlayers::Table)
                    .col(MatchPlayers::UserId)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MatchPlayers::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum MatchPlayers {
    Table,
    Id,
    MatchId,
    UserId,
    Token,
    Ready,
    Result,
    DurationMs,
    StepsCount,
    FinishedAt,
    Rank,
    Progress,
    CreatedAt,
}

#[derive(Iden)]
enum Matches {
    Table,
    Id,
}

#[derive(Iden)]
enum Users {
    Table,
    Id,
}
