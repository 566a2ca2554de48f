//! The match lifecycle state machine. Every operation runs inside one
//! transaction that first takes the match row lock, evaluates the idle and
//! countdown deadlines, then applies its transition. The lock also
//! serializes `seq` allocation, which is the only ordering guarantee the
//! store provides across seats.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    DbBackend, EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    SqlErr, TransactionTrait,
};
use serde_json::Value as JsonValue;

use crate::board::{self, BoardPayload};
use crate::config::RuntimeConfig;
use crate::entities::match_players::{self, PlayerResult};
use crate::entities::match_steps::{self, StepAction};
use crate::entities::matches::{self, MatchStatus};
use crate::entities::users;
use crate::error::{ApiError, ApiResult};
use crate::session;

use super::ranking;

const SEQ_RETRIES: u32 = 3;

/// Everything a client needs after claiming a seat.
#[derive(Debug)]
pub struct SeatGrant {
    pub match_id: i64,
    pub player_id: i64,
    pub player_token: String,
    pub board: BoardPayload,
    pub status: MatchStatus,
    pub countdown_secs: i32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The leaver was the only seat; the match is gone.
    Deleted,
    Left,
}

fn new_seat_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) async fn locked_match(
    txn: &DatabaseTransaction,
    id: i64,
) -> ApiResult<matches::Model> {
    let mut query = matches::Entity::find_by_id(id);
    // sqlite has no row locks; its single-writer model already serializes
    // match transactions there.
    if txn.get_database_backend() == DbBackend::Postgres {
        query = query.lock_exclusive();
    }
    query.one(txn).await?.ok_or(ApiError::NotFound)
}

async fn seat_by_token(
    txn: &DatabaseTransaction,
    match_id: i64,
    token: &str,
) -> ApiResult<match_players::Model> {
    match_players::Entity::find()
        .filter(match_players::Column::MatchId.eq(match_id))
        .filter(match_players::Column::Token.eq(token))
        .one(txn)
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// All seats of a match, earliest joined first. The order doubles as the
/// host re-election order.
pub(crate) async fn seats_of(
    txn: &DatabaseTransaction,
    match_id: i64,
) -> ApiResult<Vec<match_players::Model>> {
    Ok(match_players::Entity::find()
        .filter(match_players::Column::MatchId.eq(match_id))
        .order_by_asc(match_players::Column::CreatedAt)
        .order_by_asc(match_players::Column::Id)
        .all(txn)
        .await?)
}

async fn touch(
    txn: &DatabaseTransaction,
    m: matches::Model,
    now: DateTime<Utc>,
) -> ApiResult<matches::Model> {
    let mut am = m.into_active_model();
    am.last_activity_at = Set(now);
    Ok(am.update(txn).await?)
}

/// Lazy timeout evaluation: called with the match row lock held before any
/// transition or read. Once a deadline has passed, every unfinished seat
/// forfeits and the finish-all path runs. Re-evaluation after that is a
/// no-op because the match is no longer active.
pub(crate) async fn enforce_deadlines(
    txn: &DatabaseTransaction,
    cfg: &RuntimeConfig,
    m: matches::Model,
    now: DateTime<Utc>,
) -> ApiResult<matches::Model> {
    if m.status != MatchStatus::Active {
        return Ok(m);
    }
    let idle_deadline = m.last_activity_at + Duration::minutes(cfg.idle_minutes);
    let countdown_deadline = m
        .started_at
        .map(|s| s + Duration::seconds(i64::from(m.countdown_secs)));
    let expired = idle_deadline < now || countdown_deadline.map_or(false, |d| d < now);
    if !expired {
        return Ok(m);
    }
    tracing::warn!(match_id = m.id, "deadline passed, forcing finish");
    for seat in seats_of(txn, m.id).await? {
        if seat.finished_at.is_none() {
            let mut am = seat.into_active_model();
            am.result = Set(Some(PlayerResult::Forfeit));
            am.finished_at = Set(Some(now));
            am.update(txn).await?;
        }
    }
    finalize(txn, m, now).await
}

/// The finish-all path: every seat has a finished_at. Ranks are computed
/// from the step log plus any submitted snapshots, then the match closes.
async fn finalize(
    txn: &DatabaseTransaction,
    m: matches::Model,
    now: DateTime<Utc>,
) -> ApiResult<matches::Model> {
    let seats = seats_of(txn, m.id).await?;
    let steps = match_steps::Entity::find()
        .filter(match_steps::Column::MatchId.eq(m.id))
        .all(txn)
        .await?;
    let ranks = ranking::rank_seats(&seats, &steps);
    for seat in seats {
        let rank = ranks
            .iter()
            .find(|(id, _)| *id == seat.id)
            .map(|(_, rank)| *rank);
        let mut am = seat.into_active_model();
        am.rank = Set(rank);
        am.update(txn).await?;
    }
    let mut am = m.into_active_model();
    am.status = Set(MatchStatus::Finished);
    am.ended_at = Set(Some(now));
    am.last_activity_at = Set(now);
    let m = am.update(txn).await?;
    tracing::info!(match_id = m.id, "match finished");
    Ok(m)
}

pub async fn create_match(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    user: &users::Model,
    difficulty: Option<String>,
) -> ApiResult<SeatGrant> {
    let difficulty = difficulty.unwrap_or_else(|| "beginner".to_owned());
    let preset = board::preset(&difficulty)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown difficulty {difficulty:?}")))?;

    let txn = db.begin().await?;
    session::lock_user(&txn, user.id).await?;
    if session::active_session_for(&txn, user.id).await?.is_some() {
        return Err(ApiError::AlreadyInMatch);
    }

    let now = Utc::now();
    let seed = board::generate_seed();
    let (safe_x, safe_y) = board::safe_start(preset.width, preset.height, &seed);
    let m = matches::ActiveModel {
        status: Set(MatchStatus::Pending),
        width: Set(preset.width),
        height: Set(preset.height),
        mines: Set(preset.mines),
        seed: Set(seed),
        difficulty: Set(difficulty),
        safe_x: Set(safe_x),
        safe_y: Set(safe_y),
        host_id: Set(None),
        countdown_secs: Set(cfg.countdown_secs),
        created_at: Set(now),
        started_at: Set(None),
        ended_at: Set(None),
        last_activity_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let token = new_seat_token();
    let seat = match_players::ActiveModel {
        match_id: Set(m.id),
        user_id: Set(user.id),
        token: Set(token.clone()),
        ready: Set(false),
        result: Set(None),
        duration_ms: Set(None),
        steps_count: Set(0),
        finished_at: Set(None),
        rank: Set(None),
        progress: Set(None),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let mut am = m.into_active_model();
    am.host_id = Set(Some(seat.id));
    let m = am.update(&txn).await?;
    txn.commit().await?;

    tracing::info!(
        match_id = m.id,
        host_seat = seat.id,
        difficulty = %m.difficulty,
        "match created"
    );
    Ok(SeatGrant {
        match_id: m.id,
        player_id: seat.id,
        player_token: token,
        board: BoardPayload::from_match(&m),
        status: m.status,
        countdown_secs: m.countdown_secs,
    })
}

pub async fn join_match(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    user: &users::Model,
    match_id: i64,
) -> ApiResult<SeatGrant> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    if m.status != MatchStatus::Pending {
        return Err(ApiError::InvalidState("match is not joinable".into()));
    }
    session::lock_user(&txn, user.id).await?;
    if session::active_session_for(&txn, user.id).await?.is_some() {
        return Err(ApiError::AlreadyInMatch);
    }
    let seated = match_players::Entity::find()
        .filter(match_players::Column::MatchId.eq(m.id))
        .count(&txn)
        .await?;
    if seated >= cfg.max_players_per_match {
        return Err(ApiError::InvalidState("match is full".into()));
    }

    let token = new_seat_token();
    let seat = match_players::ActiveModel {
        match_id: Set(m.id),
        user_id: Set(user.id),
        token: Set(token.clone()),
        ready: Set(false),
        result: Set(None),
        duration_ms: Set(None),
        steps_count: Set(0),
        finished_at: Set(None),
        rank: Set(None),
        progress: Set(None),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;
    txn.commit().await?;

    tracing::info!(match_id = m.id, seat_id = seat.id, "player joined");
    Ok(SeatGrant {
        match_id: m.id,
        player_id: seat.id,
        player_token: token,
        board: BoardPayload::from_match(&m),
        status: m.status,
        countdown_secs: m.countdown_secs,
    })
}

pub async fn set_ready(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
    token: &str,
    ready: bool,
) -> ApiResult<()> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    let seat = seat_by_token(&txn, m.id, token).await?;
    if m.status != MatchStatus::Pending {
        return Err(ApiError::InvalidState(
            "readiness is fixed once the match starts".into(),
        ));
    }
    // The host is implicitly ready; the toggle only exists for joiners.
    if m.host_id != Some(seat.id) && seat.ready != ready {
        let mut am = seat.into_active_model();
        am.ready = Set(ready);
        am.update(&txn).await?;
    }
    txn.commit().await?;
    Ok(())
}

pub async fn start_match(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
    token: &str,
) -> ApiResult<matches::Model> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    let seat = seat_by_token(&txn, m.id, token).await?;
    if m.host_id != Some(seat.id) {
        return Err(ApiError::InvalidState("only the host can start".into()));
    }
    if m.status == MatchStatus::Active {
        // A repeated start from the host reports the running match.
        txn.commit().await?;
        return Ok(m);
    }
    if m.status != MatchStatus::Pending {
        return Err(ApiError::InvalidState("match already finished".into()));
    }
    let seats = seats_of(&txn, m.id).await?;
    if seats.len() < 2 {
        return Err(ApiError::InvalidState(
            "at least two players are required".into(),
        ));
    }
    if seats.iter().any(|s| Some(s.id) != m.host_id && !s.ready) {
        return Err(ApiError::InvalidState(
            "every joined player must be ready".into(),
        ));
    }

    let mut am = m.into_active_model();
    am.status = Set(MatchStatus::Active);
    am.started_at = Set(Some(now + Duration::seconds(cfg.pre_start_delay_secs)));
    am.last_activity_at = Set(now);
    let m = am.update(&txn).await?;
    txn.commit().await?;

    tracing::info!(match_id = m.id, "match started");
    Ok(m)
}

/// Append one step. Seq collisions (possible only when the row lock is
/// unavailable) are retried a bounded number of times before surfacing as
/// Conflict.
#[allow(clippy::too_many_arguments)]
pub async fn submit_step(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
    token: &str,
    action: StepAction,
    x: i32,
    y: i32,
    elapsed_ms: Option<i64>,
) -> ApiResult<i32> {
    for attempt in 1..=SEQ_RETRIES {
        match try_submit_step(db, cfg, match_id, token, action, x, y, elapsed_ms).await {
            Err(ApiError::Unavailable(err))
                if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) =>
            {
                tracing::warn!(match_id, attempt, "seq collision, retrying");
            }
            other => return other,
        }
    }
    Err(ApiError::Conflict)
}

#[allow(clippy::too_many_arguments)]
async fn try_submit_step(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
    token: &str,
    action: StepAction,
    x: i32,
    y: i32,
    elapsed_ms: Option<i64>,
) -> ApiResult<i32> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    if m.status != MatchStatus::Active {
        return Err(ApiError::InvalidState("match is not active".into()));
    }
    if m.started_at.map_or(true, |s| now < s) {
        return Err(ApiError::InvalidState(
            "the pre-start countdown has not elapsed".into(),
        ));
    }
    let seat = seat_by_token(&txn, m.id, token).await?;
    if seat.finished_at.is_some() {
        return Err(ApiError::InvalidState("player already finished".into()));
    }
    if x < 0 || y < 0 || x >= m.width || y >= m.height {
        return Err(ApiError::BadRequest(format!(
            "coordinate ({x}, {y}) outside the {}x{} board",
            m.width, m.height
        )));
    }

    let last = match_steps::Entity::find()
        .filter(match_steps::Column::MatchId.eq(m.id))
        .order_by_desc(match_steps::Column::Seq)
        .one(&txn)
        .await?;
    let seq = last.map_or(1, |s| s.seq + 1);

    match_steps::ActiveModel {
        match_id: Set(m.id),
        player_id: Set(seat.id),
        seq: Set(seq),
        action: Set(action),
        x: Set(x),
        y: Set(y),
        elapsed_ms: Set(elapsed_ms),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;

    let steps_count = seat.steps_count + 1;
    let mut am = seat.into_active_model();
    am.steps_count = Set(steps_count);
    am.update(&txn).await?;

    touch(&txn, m, now).await?;
    txn.commit().await?;
    Ok(seq)
}

pub async fn finish(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
    token: &str,
    outcome: PlayerResult,
    duration_ms: Option<i64>,
    steps_count: Option<i32>,
    progress: Option<JsonValue>,
) -> ApiResult<(MatchStatus, Option<i32>)> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    let seat = seat_by_token(&txn, m.id, token).await?;

    if seat.result.is_some() {
        // A repeat of a committed finish: report, change nothing.
        txn.commit().await?;
        return Ok((m.status, seat.rank));
    }
    if m.status != MatchStatus::Active {
        return Err(ApiError::InvalidState("match is not active".into()));
    }

    let mut outcome = outcome;
    if outcome == PlayerResult::Win && !ranking::evidences_win(progress.as_ref(), &m) {
        tracing::warn!(
            match_id = m.id,
            seat_id = seat.id,
            "win claim without a fully revealed snapshot, recording forfeit"
        );
        outcome = PlayerResult::Forfeit;
    }

    let seat_id = seat.id;
    let mut am = seat.into_active_model();
    am.result = Set(Some(outcome));
    am.duration_ms = Set(duration_ms);
    if let Some(count) = steps_count {
        am.steps_count = Set(count);
    }
    am.finished_at = Set(Some(now));
    am.progress = Set(progress);
    am.update(&txn).await?;

    let m = touch(&txn, m, now).await?;

    let seats = seats_of(&txn, m.id).await?;
    let (status, rank) = if seats.iter().all(|s| s.finished_at.is_some()) {
        let m = finalize(&txn, m, now).await?;
        let rank = match_players::Entity::find_by_id(seat_id)
            .one(&txn)
            .await?
            .and_then(|s| s.rank);
        (m.status, rank)
    } else {
        (m.status, None)
    };
    txn.commit().await?;
    Ok((status, rank))
}

pub async fn leave_match(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
    token: &str,
) -> ApiResult<LeaveOutcome> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    let seat = seat_by_token(&txn, m.id, token).await?;

    let leavable = m.status == MatchStatus::Pending
        || (m.status == MatchStatus::Active && m.started_at.map_or(false, |s| now < s));
    if !leavable {
        return Err(ApiError::InvalidState("cannot leave once play has begun".into()));
    }

    let seats = seats_of(&txn, m.id).await?;
    if seats.len() <= 1 {
        matches::Entity::delete_by_id(m.id).exec(&txn).await?;
        txn.commit().await?;
        tracing::info!(match_id, "match deleted by its last player leaving");
        return Ok(LeaveOutcome::Deleted);
    }

    match_players::Entity::delete_by_id(seat.id).exec(&txn).await?;
    if m.host_id == Some(seat.id) {
        // Deterministic re-election: the earliest-joined remaining seat.
        let new_host = seats
            .iter()
            .find(|s| s.id != seat.id)
            .map(|s| s.id)
            .ok_or(ApiError::Internal)?;
        let mut am = m.into_active_model();
        am.host_id = Set(Some(new_host));
        am.update(&txn).await?;
        tracing::info!(match_id, new_host, "host re-elected");
    }
    txn.commit().await?;
    Ok(LeaveOutcome::Left)
}

/// Deadline pass for the read side: opens its own short transaction so a
/// poll observes the post-timeout state.
pub async fn refresh_deadlines(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
) -> ApiResult<matches::Model> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    txn.commit().await?;
    Ok(m)
}

/// Match plus all seats, with deadlines applied first.
pub async fn current_state(
    db: &DatabaseConnection,
    cfg: &RuntimeConfig,
    match_id: i64,
) -> ApiResult<(matches::Model, Vec<match_players::Model>)> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let m = locked_match(&txn, match_id).await?;
    let m = enforce_deadlines(&txn, cfg, m, now).await?;
    let seats = seats_of(&txn, m.id).await?;
    txn.commit().await?;
    Ok((m, seats))
}
