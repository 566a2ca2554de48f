pub use sea_orm_migration::prelude::*;

mod m20240101_000001_create_users;
mod m20240101_000002_create_matches;
mod m20240101_000003_create_match_players;
mod m20240101_000004_create_match_steps;
mod m20240101_000005_create_leaderboard_entries;
mod m20240101_000006_create_leaderboard_replays;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_users::Migration),
            Box::new(m20240101_000002_create_matches::Migration),
            Box::new(m20240101_000003_create_match_players::Migration),
            Box::new(m20240101_000004_create_match_steps::Migration),
            Box::new(m20240101_000005_create_leaderboard_entries::Migration),
            Box::new(m20240101_000006_create_leaderboard_replays::Migration),
        ]
    }
}
