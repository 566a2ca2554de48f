use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MatchSteps::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MatchSteps::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MatchSteps::MatchId).big_integer().not_null())
                    .col(ColumnDef::new(MatchSteps::PlayerId).big_integer().not_null())
                    .col(ColumnDef::new(MatchSteps::Seq).integer().not_null())
                    .col(ColumnDef::new(MatchSteps::Action).text().not_null())
                    .col(ColumnDef::new(MatchSteps::X).integer().not_null())
                    .col(ColumnDef::new(MatchSteps::Y).integer().not_null())
                    .col(ColumnDef::new(MatchSteps::ElapsedMs).big_integer().null())
                    .col(
                        ColumnDef::new(MatchSteps::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_match_steps_match")
                            .from(MatchSteps::Table, MatchSteps::MatchId)
                            .to(Matches::Table, Matches::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_match_steps_player")
                            .from(MatchSteps::Table, MatchSteps::PlayerId)
                            .to(MatchPlayers::Table, MatchPlayers::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;
        // The canonical replay order and the backstop for concurrent
        // allocation: one seq value per match, no gaps tolerated.
        manager
            .create_index(
                Index::create()
                    .name("idx_match_steps_match_seq")
                    .table(MatchSteps::Table)
                    .col(MatchSteps::MatchId)
                    .col(MatchSteps::Seq)
                    .unique()
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .name("idx_match_steps_player")
                    .table(MatchSteps::Table)
                    .col(MatchSteps::PlayerId)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MatchSteps::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(Iden)]
enum MatchSteps {
    Table,
    Id,
    MatchId,
    PlayerId,
    Seq,
    Action,
    X,
    Y,
    ElapsedMs,
    CreatedAt,
}

#[derive(Iden)]
enum Matches {
    Table,
    Id,
}

#[derive(Iden)]
enum MatchPlayers {
    Table,
    Id,
}
