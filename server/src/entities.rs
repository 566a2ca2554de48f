use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

type DateTimeUtc = DateTime<Utc>;

pub mod users {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "users")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        #[sea_orm(unique)]
        pub handle: String,
        pub password_hash: String,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(has_many = "super::match_players::Entity")]
        MatchPlayers,
        #[sea_orm(has_many = "super::leaderboard_entries::Entity")]
        LeaderboardEntries,
    }

    impl Related<super::match_players::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::MatchPlayers.def()
        }
    }

    impl Related<super::leaderboard_entries::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::LeaderboardEntries.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod matches {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
    #[sea_orm(rs_type = "String", db_type = "Text")]
    #[serde(rename_all = "lowercase")]
    pub enum MatchStatus {
        #[sea_orm(string_value = "pending")]
        Pending,
        #[sea_orm(string_value = "active")]
        Active,
        #[sea_orm(string_value = "finished")]
        Finished,
    }

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "matches")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub status: MatchStatus,
        pub width: i32,
        pub height: i32,
        pub mines: i32,
        pub seed: String,
        pub difficulty: String,
        pub safe_x: i32,
        pub safe_y: i32,
        /// Seat id of the host. Nullable only inside the creating
        /// transaction, before the first seat exists.
        pub host_id: Option<i64>,
        pub countdown_secs: i32,
        pub created_at: DateTimeUtc,
        pub started_at: Option<DateTimeUtc>,
        pub ended_at: Option<DateTimeUtc>,
        pub last_activity_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(has_many = "super::match_players::Entity")]
        MatchPlayers,
        #[sea_orm(has_many = "super::match_steps::Entity")]
        MatchSteps,
    }

    impl Related<super::match_players::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::MatchPlayers.def()
        }
    }

    impl Related<super::match_steps::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::MatchSteps.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod match_players {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
    #[sea_orm(rs_type = "String", db_type = "Text")]
    #[serde(rename_all = "lowercase")]
    pub enum PlayerResult {
        #[sea_orm(string_value = "win")]
        Win,
        #[sea_orm(string_value = "lose")]
        Lose,
        #[sea_orm(string_value = "draw")]
        Draw,
        #[sea_orm(string_value = "forfeit")]
        Forfeit,
    }

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "match_players")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub match_id: i64,
        pub user_id: i64,
        /// Per-seat write secret, issued at create/join.
        #[sea_orm(unique)]
        pub token: String,
        pub ready: bool,
        pub result: Option<PlayerResult>,
        pub duration_ms: Option<i64>,
        pub steps_count: i32,
        pub finished_at: Option<DateTimeUtc>,
        pub rank: Option<i32>,
        /// Opaque client snapshot; parsed only for the win heuristic.
        pub progress: Option<JsonValue>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::matches::Entity",
            from = "Column::MatchId",
            to = "super::matches::Column::Id"
        )]
        Matches,
        #[sea_orm(
            belongs_to = "super::users::Entity",
            from = "Column::UserId",
            to = "super::users::Column::Id"
        )]
        Users,
        #[sea_orm(has_many = "super::match_steps::Entity")]
        MatchSteps,
    }

    impl Related<super::matches::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Matches.def()
        }
    }

    impl Related<super::users::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Users.def()
        }
    }

    impl Related<super::match_steps::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::MatchSteps.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod match_steps {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
    #[sea_orm(rs_type = "String", db_type = "Text")]
    #[serde(rename_all = "lowercase")]
    pub enum StepAction {
        #[sea_orm(string_value = "reveal")]
        Reveal,
        #[sea_orm(string_value = "flag")]
        Flag,
        #[sea_orm(string_value = "chord")]
        Chord,
    }

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "match_steps")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub match_id: i64,
        pub player_id: i64,
        /// Strictly increasing per match, not per player.
        pub seq: i32,
        pub action: StepAction,
        pub x: i32,
        pub y: i32,
        pub elapsed_ms: Option<i64>,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::matches::Entity",
            from = "Column::MatchId",
            to = "super::matches::Column::Id"
        )]
        Matches,
        #[sea_orm(
            belongs_to = "super::match_players::Entity",
            from = "Column::PlayerId",
            to = "super::match_players::Column::Id"
        )]
        MatchPlayers,
    }

    impl Related<super::matches::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Matches.def()
        }
    }

    impl Related<super::match_players::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::MatchPlayers.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod leaderboard_entries {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "leaderboard_entries")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub user_id: i64,
        pub difficulty: String,
        pub time_ms: i64,
        pub created_at: DateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::users::Entity",
            from = "Column::UserId",
            to = "super::users::Column::Id"
        )]
        Users,
        #[sea_orm(has_one = "super::leaderboard_replays::Entity")]
        LeaderboardReplays,
    }

    impl Related<super::users::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Users.def()
        }
    }

    impl Related<super::leaderboard_replays::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::LeaderboardReplays.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod leaderboard_replays {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
    #[sea_orm(table_name = "leaderboard_replays")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub entry_id: i64,
        pub board: JsonValue,
        pub steps: JsonValue,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::leaderboard_entries::Entity",
            from = "Column::EntryId",
            to = "super::leaderboard_entries::Column::Id"
        )]
        LeaderboardEntries,
    }

    impl Related<super::leaderboard_entries::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::LeaderboardEntries.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}
