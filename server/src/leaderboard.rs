//! Single-player leaderboard: one best time per user per difficulty, with
//! replay blobs kept only for entries inside the configured top-N. Pruning
//! happens synchronously in the submit transaction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::auth::CurrentUser;
use crate::entities::{leaderboard_entries, leaderboard_replays, users};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list).post(submit))
        .route("/:entry_id/replay", get(replay))
}

#[derive(Debug, Deserialize)]
pub struct ReplayPayload {
    pub board: JsonValue,
    pub steps: JsonValue,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub difficulty: String,
    pub time_ms: i64,
    #[serde(default)]
    pub replay: Option<ReplayPayload>,
}

#[derive(Debug, Serialize)]
pub struct EntryRead {
    pub id: i64,
    pub user_id: i64,
    pub handle: String,
    pub difficulty: String,
    pub time_ms: i64,
    pub created_at: DateTime<Utc>,
    pub has_replay: bool,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<SubmitRequest>,
) -> ApiResult<Json<EntryRead>> {
    if payload.time_ms <= 0 {
        return Err(ApiError::BadRequest("time_ms must be positive".into()));
    }

    let txn = state.db.begin().await?;
    let existing = leaderboard_entries::Entity::find()
        .filter(leaderboard_entries::Column::UserId.eq(user.id))
        .filter(leaderboard_entries::Column::Difficulty.eq(payload.difficulty.as_str()))
        .one(&txn)
        .await?;

    if let Some(ref best) = existing {
        if payload.time_ms >= best.time_ms {
            // Not an improvement; the stored best (and its replay) stand.
            let has_replay = replay_exists(&txn, best.id).await?;
            let entry = best.clone();
            txn.commit().await?;
            return Ok(Json(entry_read(entry, user.handle, has_replay)));
        }
    }

    let now = Utc::now();
    let entry = match existing {
        Some(best) => {
            let mut am = best.into_active_model();
            am.time_ms = Set(payload.time_ms);
            am.created_at = Set(now);
            am.update(&txn).await?
        }
        None => {
            leaderboard_entries::ActiveModel {
                user_id: Set(user.id),
                difficulty: Set(payload.difficulty.clone()),
                time_ms: Set(payload.time_ms),
                created_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?
        }
    };

    // Any previous replay describes the beaten run; drop it before deciding
    // whether the new one may be kept.
    leaderboard_replays::Entity::delete_by_id(entry.id)
        .exec(&txn)
        .await?;

    let top_ids = top_entry_ids(&txn, &entry.difficulty, state.cfg.leaderboard_top_n).await?;
    let mut has_replay = false;
    if top_ids.contains(&entry.id) {
        if let Some(replay) = payload.replay {
            leaderboard_replays::ActiveModel {
                entry_id: Set(entry.id),
                board: Set(replay.board),
                steps: Set(replay.steps),
            }
            .insert(&txn)
            .await?;
            has_replay = true;
        }
    }

    prune_replays(&txn, &entry.difficulty, &top_ids).await?;
    txn.commit().await?;

    tracing::info!(
        user_id = user.id,
        difficulty = %entry.difficulty,
        time_ms = entry.time_ms,
        "leaderboard entry recorded"
    );
    Ok(Json(entry_read(entry, user.handle, has_replay)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub difficulty: String,
    #[serde(default)]
    pub limit: Option<u64>,
}

async fn list(
    Query(query): Query<ListQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<EntryRead>>> {
    let limit = query.limit.unwrap_or(state.cfg.leaderboard_top_n).clamp(1, 100);
    let entries = leaderboard_entries::Entity::find()
        .filter(leaderboard_entries::Column::Difficulty.eq(query.difficulty.as_str()))
        .order_by_asc(leaderboard_entries::Column::TimeMs)
        .order_by_asc(leaderboard_entries::Column::CreatedAt)
        .order_by_asc(leaderboard_entries::Column::Id)
        .limit(limit)
        .all(&state.db)
        .await?;

    let entry_ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
    let with_replay: HashSet<i64> = leaderboard_replays::Entity::find()
        .filter(leaderboard_replays::Column::EntryId.is_in(entry_ids))
        .all(&state.db)
        .await?
        .into_iter()
        .map(|r| r.entry_id)
        .collect();

    let user_ids: Vec<i64> = entries.iter().map(|e| e.user_id).collect();
    let handles: HashMap<i64, String> = users::Entity::find()
        .filter(users::Column::Id.is_in(user_ids))
        .all(&state.db)
        .await?
        .into_iter()
        .map(|u| (u.id, u.handle))
        .collect();

    let out = entries
        .into_iter()
        .map(|e| {
            let handle = handles.get(&e.user_id).cloned().unwrap_or_default();
            let has_replay = with_replay.contains(&e.id);
            entry_read(e, handle, has_replay)
        })
        .collect();
    Ok(Json(out))
}

#[derive(Debug, Serialize)]
pub struct ReplayRead {
    pub board: JsonValue,
    pub steps: JsonValue,
}

async fn replay(
    Path(entry_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ReplayRead>> {
    let row = leaderboard_replays::Entity::find_by_id(entry_id)
        .one(&state.db)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(ReplayRead {
        board: row.board,
        steps: row.steps,
    }))
}

fn entry_read(entry: leaderboard_entries::Model, handle: String, has_replay: bool) -> EntryRead {
    EntryRead {
        id: entry.id,
        user_id: entry.user_id,
        handle,
        difficulty: entry.difficulty,
        time_ms: entry.time_ms,
        created_at: entry.created_at,
        has_replay,
    }
}

async fn replay_exists<C: ConnectionTrait>(conn: &C, entry_id: i64) -> Result<bool, ApiError> {
    Ok(leaderboard_replays::Entity::find_by_id(entry_id)
        .one(conn)
        .await?
        .is_some())
}

/// The entry ids currently inside the top-N window for a difficulty, in
/// leaderboard order.
async fn top_entry_ids(
    txn: &DatabaseTransaction,
    difficulty: &str,
    top_n: u64,
) -> Result<Vec<i64>, ApiError> {
    Ok(leaderboard_entries::Entity::find()
        .filter(leaderboard_entries::Column::Difficulty.eq(difficulty))
        .order_by_asc(leaderboard_entries::Column::TimeMs)
        .order_by_asc(leaderboard_entries::Column::CreatedAt)
        .order_by_asc(leaderboard_entries::Column::Id)
        .limit(top_n)
        .all(txn)
        .await?
        .into_iter()
        .map(|e| e.id)
        .collect())
}

/// Drop replays whose entries were pushed out of the top-N window.
async fn prune_replays(
    txn: &DatabaseTransaction,
    difficulty: &str,
    top_ids: &[i64],
) -> Result<(), ApiError> {
    let stale: Vec<i64> = leaderboard_entries::Entity::find()
        .filter(leaderboard_entries::Column::Difficulty.eq(difficulty))
        .filter(leaderboard_entries::Column::Id.is_not_in(top_ids.iter().copied()))
        .all(txn)
        .await?
        .into_iter()
        .map(|e| e.id)
        .collect();
    if stale.is_empty() {
        return Ok(());
    }
    let pruned = leaderboard_replays::Entity::delete_many()
        .filter(leaderboard_replays::Column::EntryId.is_in(stale))
        .exec(txn)
        .await?;
    if pruned.rows_affected > 0 {
        tracing::info!(%difficulty, pruned = pruned.rows_affected, "pruned out-of-window replays");
    }
    Ok(())
}
