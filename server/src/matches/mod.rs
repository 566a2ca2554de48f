//! Match HTTP surface: payload shapes, handlers and the read-side views.
//! Handlers stay thin; the state machine lives in [`engine`].

pub mod engine;
pub mod ranking;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::auth::CurrentUser;
use crate::board::BoardPayload;
use crate::entities::match_players::{self, PlayerResult};
use crate::entities::match_steps::{self, StepAction};
use crate::entities::matches::{self, MatchStatus};
use crate::entities::users;
use crate::error::{ApiError, ApiResult};
use crate::session;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create))
        .route("/recent", get(recent))
        .route("/active", get(active))
        .route("/history", get(history))
        .route("/:id", delete(leave))
        .route("/:id/join", post(join))
        .route("/:id/ready", post(ready))
        .route("/:id/start", post(start))
        .route("/:id/step", post(step))
        .route("/:id/finish", post(finish))
        .route("/:id/leave", post(leave))
        .route("/:id/state", get(state_view))
        .route("/:id/steps", get(steps_view))
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub difficulty: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SeatGrantResponse {
    pub match_id: i64,
    pub player_id: i64,
    pub player_token: String,
    pub board: BoardPayload,
    pub status: MatchStatus,
    pub countdown_secs: i32,
}

impl From<engine::SeatGrant> for SeatGrantResponse {
    fn from(grant: engine::SeatGrant) -> Self {
        Self {
            match_id: grant.match_id,
            player_id: grant.player_id,
            player_token: grant.player_token,
            board: grant.board,
            status: grant.status,
            countdown_secs: grant.countdown_secs,
        }
    }
}

async fn create(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(payload): Json<CreateRequest>,
) -> ApiResult<Json<SeatGrantResponse>> {
    let grant = engine::create_match(&state.db, &state.cfg, &user, payload.difficulty).await?;
    Ok(Json(grant.into()))
}

async fn join(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<SeatGrantResponse>> {
    let grant = engine::join_match(&state.db, &state.cfg, &user, id).await?;
    Ok(Json(grant.into()))
}

#[derive(Debug, Deserialize)]
pub struct ReadyRequest {
    pub player_token: String,
    pub ready: bool,
}

async fn ready(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReadyRequest>,
) -> ApiResult<Json<JsonValue>> {
    engine::set_ready(&state.db, &state.cfg, id, &payload.player_token, payload.ready).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub player_token: String,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub status: MatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub countdown_secs: i32,
}

async fn start(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TokenBody>,
) -> ApiResult<Json<StartResponse>> {
    let m = engine::start_match(&state.db, &state.cfg, id, &payload.player_token).await?;
    Ok(Json(StartResponse {
        status: m.status,
        started_at: m.started_at,
        countdown_secs: m.countdown_secs,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StepRequest {
    pub player_token: String,
    pub action: StepAction,
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub elapsed_ms: Option<i64>,
}

async fn step(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StepRequest>,
) -> ApiResult<Json<JsonValue>> {
    let seq = engine::submit_step(
        &state.db,
        &state.cfg,
        id,
        &payload.player_token,
        payload.action,
        payload.x,
        payload.y,
        payload.elapsed_ms,
    )
    .await?;
    Ok(Json(serde_json::json!({ "seq": seq })))
}

#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    pub player_token: String,
    pub outcome: PlayerResult,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub steps_count: Option<i32>,
    #[serde(default)]
    pub progress: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct FinishResponse {
    pub status: MatchStatus,
    pub rank: Option<i32>,
}

async fn finish(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FinishRequest>,
) -> ApiResult<Json<FinishResponse>> {
    let (status, rank) = engine::finish(
        &state.db,
        &state.cfg,
        id,
        &payload.player_token,
        payload.outcome,
        payload.duration_ms,
        payload.steps_count,
        payload.progress,
    )
    .await?;
    Ok(Json(FinishResponse { status, rank }))
}

async fn leave(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TokenBody>,
) -> ApiResult<Json<JsonValue>> {
    let outcome = engine::leave_match(&state.db, &state.cfg, id, &payload.player_token).await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "deleted": outcome == engine::LeaveOutcome::Deleted,
    })))
}

#[derive(Debug, Serialize)]
pub struct PlayerView {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub ready: bool,
    pub result: Option<PlayerResult>,
    pub rank: Option<i32>,
    pub steps_count: i32,
    pub duration_ms: Option<i64>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Option<JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct MatchStateResponse {
    pub id: i64,
    pub status: MatchStatus,
    pub board: BoardPayload,
    pub host_id: Option<i64>,
    pub countdown_secs: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub players: Vec<PlayerView>,
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    #[serde(default)]
    pub player_token: Option<String>,
}

async fn state_view(
    Path(id): Path<i64>,
    Query(query): Query<StateQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<MatchStateResponse>> {
    let (m, seats) = engine::current_state(&state.db, &state.cfg, id).await?;
    let names = handles_for(&state.db, seats.iter().map(|s| s.user_id)).await?;
    let viewer_seat = query
        .player_token
        .as_deref()
        .and_then(|token| seats.iter().find(|s| s.token == token))
        .map(|s| s.id);

    let finished = m.status == MatchStatus::Finished;
    let players = seats
        .into_iter()
        .map(|seat| {
            // Opponent snapshots stay hidden until the whole match is over.
            let progress = if finished || viewer_seat == Some(seat.id) {
                seat.progress
            } else {
                None
            };
            PlayerView {
                id: seat.id,
                user_id: seat.user_id,
                name: names.get(&seat.user_id).cloned().unwrap_or_default(),
                ready: seat.ready,
                result: seat.result,
                rank: seat.rank,
                steps_count: seat.steps_count,
                duration_ms: seat.duration_ms,
                finished_at: seat.finished_at,
                progress,
            }
        })
        .collect();

    Ok(Json(MatchStateResponse {
        id: m.id,
        status: m.status,
        board: BoardPayload::from_match(&m),
        host_id: m.host_id,
        countdown_secs: m.countdown_secs,
        created_at: m.created_at,
        started_at: m.started_at,
        ended_at: m.ended_at,
        players,
    }))
}

#[derive(Debug, Serialize)]
pub struct StepRead {
    pub seq: i32,
    pub player_id: i64,
    pub player_name: String,
    pub action: StepAction,
    pub x: i32,
    pub y: i32,
    pub elapsed_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

async fn steps_view(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<StepRead>>> {
    engine::refresh_deadlines(&state.db, &state.cfg, id).await?;
    let seats = match_players::Entity::find()
        .filter(match_players::Column::MatchId.eq(id))
        .all(&state.db)
        .await?;
    let names = handles_for(&state.db, seats.iter().map(|s| s.user_id)).await?;
    let by_seat: HashMap<i64, String> = seats
        .iter()
        .map(|s| {
            (
                s.id,
                names.get(&s.user_id).cloned().unwrap_or_default(),
            )
        })
        .collect();

    let steps = match_steps::Entity::find()
        .filter(match_steps::Column::MatchId.eq(id))
        .order_by_asc(match_steps::Column::Seq)
        .all(&state.db)
        .await?;
    let out = steps
        .into_iter()
        .map(|s| StepRead {
            seq: s.seq,
            player_id: s.player_id,
            player_name: by_seat.get(&s.player_id).cloned().unwrap_or_default(),
            action: s.action,
            x: s.x,
            y: s.y,
            elapsed_ms: s.elapsed_ms,
            created_at: s.created_at,
        })
        .collect();
    Ok(Json(out))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RecentPlayer {
    pub name: String,
    pub result: Option<PlayerResult>,
    pub rank: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct RecentMatch {
    pub id: i64,
    pub status: MatchStatus,
    pub difficulty: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub players: Vec<RecentPlayer>,
}

async fn recent(
    Query(query): Query<RecentQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<RecentMatch>>> {
    let limit = query.limit.unwrap_or(10).clamp(1, 50);
    let ms = matches::Entity::find()
        .order_by_desc(matches::Column::CreatedAt)
        .order_by_desc(matches::Column::Id)
        .limit(limit)
        .all(&state.db)
        .await?;

    let mut out = Vec::with_capacity(ms.len());
    for m in ms {
        let m = if m.status == MatchStatus::Active {
            engine::refresh_deadlines(&state.db, &state.cfg, m.id).await?
        } else {
            m
        };
        let seats = match_players::Entity::find()
            .filter(match_players::Column::MatchId.eq(m.id))
            .order_by_asc(match_players::Column::CreatedAt)
            .all(&state.db)
            .await?;
        let names = handles_for(&state.db, seats.iter().map(|s| s.user_id)).await?;
        out.push(RecentMatch {
            id: m.id,
            status: m.status,
            difficulty: m.difficulty,
            created_at: m.created_at,
            ended_at: m.ended_at,
            players: seats
                .into_iter()
                .map(|s| RecentPlayer {
                    name: names.get(&s.user_id).cloned().unwrap_or_default(),
                    result: s.result,
                    rank: s.rank,
                })
                .collect(),
        });
    }
    Ok(Json(out))
}

#[derive(Debug, Serialize, Default)]
pub struct ActiveSessionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board: Option<BoardPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MatchStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<i64>,
}

async fn active(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<ActiveSessionResponse>> {
    let Some((seat, m)) = session::active_session_for(&state.db, user.id).await? else {
        return Ok(Json(ActiveSessionResponse::default()));
    };
    // The session may be stale: a deadline pass can close it right here.
    let m = engine::refresh_deadlines(&state.db, &state.cfg, m.id).await?;
    if m.status == MatchStatus::Finished {
        return Ok(Json(ActiveSessionResponse::default()));
    }
    Ok(Json(ActiveSessionResponse {
        active: true,
        match_id: Some(m.id),
        player_id: Some(seat.id),
        player_token: Some(seat.token),
        board: Some(BoardPayload::from_match(&m)),
        status: Some(m.status),
        host_id: m.host_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub player: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub match_id: i64,
    pub status: MatchStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub difficulty: String,
    pub width: i32,
    pub height: i32,
    pub mines: i32,
    pub result: Option<PlayerResult>,
    pub duration_ms: Option<i64>,
    pub rank: Option<i32>,
}

async fn history(
    Query(query): Query<HistoryQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<HistoryItem>>> {
    let Some(user) = users::Entity::find()
        .filter(users::Column::Handle.eq(query.player.as_str()))
        .one(&state.db)
        .await?
    else {
        return Ok(Json(Vec::new()));
    };
    let rows = match_players::Entity::find()
        .filter(match_players::Column::UserId.eq(user.id))
        .find_also_related(matches::Entity)
        .order_by_desc(matches::Column::CreatedAt)
        .all(&state.db)
        .await?;
    let out = rows
        .into_iter()
        .filter_map(|(seat, m)| m.map(|m| (seat, m)))
        .map(|(seat, m)| HistoryItem {
            match_id: m.id,
            status: m.status,
            created_at: m.created_at,
            ended_at: m.ended_at,
            difficulty: m.difficulty,
            width: m.width,
            height: m.height,
            mines: m.mines,
            result: seat.result,
            duration_ms: seat.duration_ms,
            rank: seat.rank,
        })
        .collect();
    Ok(Json(out))
}

async fn handles_for<C, I>(conn: &C, user_ids: I) -> Result<HashMap<i64, String>, ApiError>
where
    C: ConnectionTrait,
    I: Iterator<Item = i64>,
{
    let ids: Vec<i64> = user_ids.collect();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = users::Entity::find()
        .filter(users::Column::Id.is_in(ids))
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(|u| (u.id, u.handle)).collect())
}
