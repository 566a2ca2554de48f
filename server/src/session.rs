use sea_orm::{
    ColumnTrait, ConnectionTrait, DbBackend, DbErr, EntityTrait, QueryFilter, QuerySelect,
};

use crate::entities::match_players;
use crate::entities::matches::{self, MatchStatus};
use crate::entities::users;

/// Serialize seat claims per user. The active-session predicate below is
/// check-then-insert, so every transaction that may add a seat must hold
/// the user's row lock before consulting it; otherwise two concurrent
/// create/join calls could both observe "no session" and both insert.
pub async fn lock_user<C: ConnectionTrait>(conn: &C, user_id: i64) -> Result<(), DbErr> {
    let mut query = users::Entity::find_by_id(user_id);
    // sqlite has no row locks; its single-writer model already serializes
    // these transactions there.
    if conn.get_database_backend() == DbBackend::Postgres {
        query = query.lock_exclusive();
    }
    query.one(conn).await?;
    Ok(())
}

/// The one-active-session predicate: a user may hold at most one seat in a
/// match that is not finished, across the whole system. `create_match` and
/// `join_match` refuse while this returns a row (behind [`lock_user`]); it
/// also powers the reconnect path (`GET /api/match/active`).
pub async fn active_session_for<C: ConnectionTrait>(
    conn: &C,
    user_id: i64,
) -> Result<Option<(match_players::Model, matches::Model)>, DbErr> {
    let row = match_players::Entity::find()
        .filter(match_players::Column::UserId.eq(user_id))
        .find_also_related(matches::Entity)
        .filter(matches::Column::Status.ne(MatchStatus::Finished))
        .one(conn)
        .await?;
    Ok(row.and_then(|(seat, m)| m.map(|m| (seat, m))))
}
