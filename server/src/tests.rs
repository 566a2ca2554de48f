use super::*;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, Duration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter};
use serde_json::{json, Value as JsonValue};
use serial_test::serial;
use tower::ServiceExt;

use crate::entities::match_players::{self, PlayerResult};
use crate::entities::match_steps::{self, StepAction};
use crate::entities::matches::{self, MatchStatus};
use crate::entities::users;
use crate::error::ApiError;
use crate::matches::engine::{self, LeaveOutcome};
use crate::test_logger;

async fn test_state() -> Arc<AppState> {
    test_state_with(RuntimeConfig::default()).await
}

async fn test_state_with(cfg: RuntimeConfig) -> Arc<AppState> {
    // A single pooled connection keeps every handle on the same in-memory
    // database.
    let mut opts = ConnectOptions::new("sqlite::memory:".to_owned());
    opts.max_connections(1);
    let db = Database::connect(opts).await.unwrap();
    Migrator::up(&db, None).await.unwrap();
    Arc::new(AppState { db, cfg })
}

async fn seed_user(state: &AppState, handle: &str) -> users::Model {
    users::ActiveModel {
        handle: Set(handle.to_owned()),
        password_hash: Set("unused".to_owned()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(&state.db)
    .await
    .unwrap()
}

/// Two seated players, host started, pre-start window already elapsed.
async fn running_match(state: &AppState) -> (engine::SeatGrant, engine::SeatGrant) {
    let alice = seed_user(state, "alice").await;
    let bob = seed_user(state, "bob").await;
    let a = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
    let b = engine::join_match(&state.db, &state.cfg, &bob, a.match_id)
        .await
        .unwrap();
    engine::set_ready(&state.db, &state.cfg, a.match_id, &b.player_token, true)
        .await
        .unwrap();
    engine::start_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap();
    backdate(state, a.match_id, Some(Utc::now() - Duration::seconds(1)), None, None).await;
    (a, b)
}

async fn backdate(
    state: &AppState,
    match_id: i64,
    started_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
    countdown_secs: Option<i32>,
) {
    let m = matches::Entity::find_by_id(match_id)
        .one(&state.db)
        .await
        .unwrap()
        .unwrap();
    let mut am = m.into_active_model();
    if let Some(at) = started_at {
        am.started_at = Set(Some(at));
    }
    if let Some(at) = last_activity_at {
        am.last_activity_at = Set(at);
    }
    if let Some(secs) = countdown_secs {
        am.countdown_secs = Set(secs);
    }
    am.update(&state.db).await.unwrap();
}

async fn seat(state: &AppState, seat_id: i64) -> match_players::Model {
    match_players::Entity::find_by_id(seat_id)
        .one(&state.db)
        .await
        .unwrap()
        .unwrap()
}

fn full_beginner_snapshot() -> JsonValue {
    // 9x9 with 10 mines leaves 71 safe cells.
    let cells: Vec<JsonValue> = (0..71).map(|_| json!({"revealed": true})).collect();
    json!({"board": {"cells": cells, "status": "won"}})
}

async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: Option<JsonValue>,
) -> (StatusCode, JsonValue) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

// ---------------------------------------------------------------------------
// lifecycle

#[tokio::test]
async fn create_then_state_board_roundtrip() {
    let state = test_state().await;
    let app = router(state.clone());
    let alice = seed_user(&state, "alice").await;
    let grant = engine::create_match(&state.db, &state.cfg, &alice, Some("beginner".into()))
        .await
        .unwrap();

    let (status, body) = request(
        &app,
        "GET",
        &format!("/api/match/{}/state", grant.match_id),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["board"], serde_json::to_value(&grant.board).unwrap());
    // Both spellings of the safe-start cell are served.
    assert_eq!(body["board"]["safe_start"], body["board"]["safeStart"]);
    assert_eq!(body["players"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn create_rejects_unknown_difficulty() {
    let state = test_state().await;
    let alice = seed_user(&state, "alice").await;
    let err = engine::create_match(&state.db, &state.cfg, &alice, Some("nightmare".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
async fn one_active_session_per_user() {
    let state = test_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;
    let first = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();

    let err = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::AlreadyInMatch));

    // Joining somebody else's lobby is blocked the same way.
    let other = engine::create_match(&state.db, &state.cfg, &bob, None)
        .await
        .unwrap();
    let err = engine::join_match(&state.db, &state.cfg, &alice, other.match_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::AlreadyInMatch));

    // Leaving frees the slot.
    engine::leave_match(&state.db, &state.cfg, first.match_id, &first.player_token)
        .await
        .unwrap();
    engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn join_caps_at_configured_seats() {
    let state = test_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;
    let carol = seed_user(&state, "carol").await;
    let a = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
    engine::join_match(&state.db, &state.cfg, &bob, a.match_id)
        .await
        .unwrap();
    let err = engine::join_match(&state.db, &state.cfg, &carol, a.match_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));
}

#[tokio::test]
async fn ready_toggle_is_idempotent() {
    let state = test_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;
    let a = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
    let b = engine::join_match(&state.db, &state.cfg, &bob, a.match_id)
        .await
        .unwrap();

    for _ in 0..2 {
        engine::set_ready(&state.db, &state.cfg, a.match_id, &b.player_token, true)
            .await
            .unwrap();
        assert!(seat(&state, b.player_id).await.ready);
    }
    engine::set_ready(&state.db, &state.cfg, a.match_id, &b.player_token, false)
        .await
        .unwrap();
    assert!(!seat(&state, b.player_id).await.ready);

    // The host's flag never moves; readiness is implicit for the host.
    engine::set_ready(&state.db, &state.cfg, a.match_id, &a.player_token, true)
        .await
        .unwrap();
    assert!(!seat(&state, a.player_id).await.ready);
}

#[tokio::test]
async fn start_requires_two_players_and_readiness() {
    let state = test_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;
    let a = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();

    let err = engine::start_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));

    let b = engine::join_match(&state.db, &state.cfg, &bob, a.match_id)
        .await
        .unwrap();
    let err = engine::start_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));

    // Only the host may start.
    engine::set_ready(&state.db, &state.cfg, a.match_id, &b.player_token, true)
        .await
        .unwrap();
    let err = engine::start_match(&state.db, &state.cfg, a.match_id, &b.player_token)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));

    let before = Utc::now();
    let m = engine::start_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap();
    assert_eq!(m.status, MatchStatus::Active);
    // The pre-start window is advertised through started_at lying ahead.
    assert!(m.started_at.unwrap() > before);

    // A repeated start from the host reports the running match unchanged.
    let again = engine::start_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap();
    assert_eq!(again.started_at, m.started_at);
}

#[tokio::test]
async fn step_rejected_during_prestart_window() {
    let state = test_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;
    let a = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
    let b = engine::join_match(&state.db, &state.cfg, &bob, a.match_id)
        .await
        .unwrap();
    engine::set_ready(&state.db, &state.cfg, a.match_id, &b.player_token, true)
        .await
        .unwrap();
    engine::start_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap();

    let err = engine::submit_step(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        StepAction::Reveal,
        0,
        0,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));
}

#[tokio::test]
async fn steps_share_one_monotonic_sequence() {
    let state = test_state().await;
    let (a, b) = running_match(&state).await;

    let seq1 = engine::submit_step(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        StepAction::Reveal,
        a.board.safe_start.x,
        a.board.safe_start.y,
        Some(120),
    )
    .await
    .unwrap();
    let seq2 = engine::submit_step(
        &state.db,
        &state.cfg,
        a.match_id,
        &b.player_token,
        StepAction::Reveal,
        b.board.safe_start.x,
        b.board.safe_start.y,
        Some(180),
    )
    .await
    .unwrap();
    let seq3 = engine::submit_step(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        StepAction::Flag,
        3,
        4,
        None,
    )
    .await
    .unwrap();
    assert_eq!((seq1, seq2, seq3), (1, 2, 3));

    // The stored seq values form exactly {1..count}.
    let steps = match_steps::Entity::find()
        .filter(match_steps::Column::MatchId.eq(a.match_id))
        .all(&state.db)
        .await
        .unwrap();
    let mut seqs: Vec<i32> = steps.iter().map(|s| s.seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2, 3]);

    assert_eq!(seat(&state, a.player_id).await.steps_count, 2);
    assert_eq!(seat(&state, b.player_id).await.steps_count, 1);
}

#[tokio::test]
async fn step_bounds_and_token_checks() {
    let state = test_state().await;
    let (a, _b) = running_match(&state).await;

    let err = engine::submit_step(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        StepAction::Reveal,
        99,
        0,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));

    let err = engine::submit_step(
        &state.db,
        &state.cfg,
        a.match_id,
        "not-a-token",
        StepAction::Reveal,
        0,
        0,
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
}

#[tokio::test]
async fn finish_ranks_winner_first() {
    let state = test_state().await;
    let (a, b) = running_match(&state).await;

    let (status, rank) = engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        PlayerResult::Win,
        Some(4_500),
        None,
        Some(full_beginner_snapshot()),
    )
    .await
    .unwrap();
    assert_eq!(status, MatchStatus::Active);
    assert_eq!(rank, None);

    let (status, rank) = engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &b.player_token,
        PlayerResult::Lose,
        Some(5_000),
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(status, MatchStatus::Finished);
    assert_eq!(rank, Some(2));

    let winner = seat(&state, a.player_id).await;
    let loser = seat(&state, b.player_id).await;
    assert_eq!(winner.result, Some(PlayerResult::Win));
    assert_eq!(winner.rank, Some(1));
    assert_eq!(loser.rank, Some(2));

    let m = matches::Entity::find_by_id(a.match_id)
        .one(&state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m.status, MatchStatus::Finished);
    assert!(m.ended_at.is_some());
}

#[tokio::test]
async fn win_without_snapshot_becomes_forfeit() {
    let state = test_state().await;
    let (a, b) = running_match(&state).await;

    engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &b.player_token,
        PlayerResult::Lose,
        Some(8_000),
        None,
        None,
    )
    .await
    .unwrap();

    let (status, rank) = engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        PlayerResult::Win,
        Some(4_000),
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(status, MatchStatus::Finished);
    // The unwarranted win ranks behind the honest loss.
    assert_eq!(rank, Some(2));
    assert_eq!(
        seat(&state, a.player_id).await.result,
        Some(PlayerResult::Forfeit)
    );
}

#[tokio::test]
async fn finish_repeat_is_a_noop() {
    let state = test_state().await;
    let (a, b) = running_match(&state).await;

    engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        PlayerResult::Win,
        Some(4_500),
        None,
        Some(full_beginner_snapshot()),
    )
    .await
    .unwrap();
    engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &b.player_token,
        PlayerResult::Lose,
        Some(5_000),
        None,
        None,
    )
    .await
    .unwrap();

    let m_before = matches::Entity::find_by_id(a.match_id)
        .one(&state.db)
        .await
        .unwrap()
        .unwrap();
    let (status, rank) = engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        PlayerResult::Win,
        Some(4_500),
        None,
        None,
    )
    .await
    .unwrap();
    assert_eq!(status, MatchStatus::Finished);
    assert_eq!(rank, Some(1));
    let m_after = matches::Entity::find_by_id(a.match_id)
        .one(&state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m_before.ended_at, m_after.ended_at);
}

#[tokio::test]
async fn leave_paths() {
    let state = test_state().await;
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;

    // Sole player leaving deletes the match entirely.
    let a = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
    let outcome = engine::leave_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap();
    assert_eq!(outcome, LeaveOutcome::Deleted);
    let err = engine::current_state(&state.db, &state.cfg, a.match_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound));

    // A departing host hands the lobby to the earliest joiner.
    let a = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
    let b = engine::join_match(&state.db, &state.cfg, &bob, a.match_id)
        .await
        .unwrap();
    let outcome = engine::leave_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap();
    assert_eq!(outcome, LeaveOutcome::Left);
    let m = matches::Entity::find_by_id(a.match_id)
        .one(&state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(m.status, MatchStatus::Pending);
    assert_eq!(m.host_id, Some(b.player_id));
}

#[tokio::test]
async fn leave_rejected_once_play_begins() {
    let state = test_state().await;
    let (a, _b) = running_match(&state).await;
    let err = engine::leave_match(&state.db, &state.cfg, a.match_id, &a.player_token)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));
}

// ---------------------------------------------------------------------------
// timeouts

#[tokio::test]
#[serial]
async fn idle_match_forfeits_everyone_on_next_read() {
    test_logger::init();
    test_logger::CAPTURE.clear();

    let state = test_state().await;
    let (a, b) = running_match(&state).await;
    engine::submit_step(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        StepAction::Reveal,
        a.board.safe_start.x,
        a.board.safe_start.y,
        None,
    )
    .await
    .unwrap();

    // Eleven silent minutes; keep the countdown out of the way so the idle
    // rule is what fires.
    let past = Utc::now() - Duration::minutes(11);
    backdate(&state, a.match_id, Some(past), Some(past), Some(7_200)).await;

    let (m, seats) = engine::current_state(&state.db, &state.cfg, a.match_id)
        .await
        .unwrap();
    assert_eq!(m.status, MatchStatus::Finished);
    for s in &seats {
        assert_eq!(s.result, Some(PlayerResult::Forfeit));
        assert!(s.rank.is_some());
    }
    // A stepped and B did not, so A ranks first among the forfeits.
    assert_eq!(seat(&state, a.player_id).await.rank, Some(1));
    assert_eq!(seat(&state, b.player_id).await.rank, Some(2));
    assert!(test_logger::CAPTURE.contains("deadline passed"));
}

#[tokio::test]
#[serial]
async fn countdown_expiry_forces_finish() {
    test_logger::init();

    let state = test_state().await;
    let (a, _b) = running_match(&state).await;
    // Fresh activity, but the countdown itself has run out.
    backdate(
        &state,
        a.match_id,
        Some(Utc::now() - Duration::seconds(400)),
        Some(Utc::now()),
        Some(300),
    )
    .await;

    let (m, seats) = engine::current_state(&state.db, &state.cfg, a.match_id)
        .await
        .unwrap();
    assert_eq!(m.status, MatchStatus::Finished);
    assert!(seats.iter().all(|s| s.result == Some(PlayerResult::Forfeit)));

    // Timeout evaluation is idempotent: nothing moves on the next read.
    let ended = m.ended_at;
    let (m, _) = engine::current_state(&state.db, &state.cfg, a.match_id)
        .await
        .unwrap();
    assert_eq!(m.ended_at, ended);
}

// ---------------------------------------------------------------------------
// views

#[tokio::test]
async fn opponent_progress_stays_hidden_until_finished() {
    let state = test_state().await;
    let app = router(state.clone());
    let (a, b) = running_match(&state).await;

    engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        PlayerResult::Lose,
        Some(3_000),
        None,
        Some(json!({"board": {"cells": [{"revealed": true}]}})),
    )
    .await
    .unwrap();

    // B polls: A's snapshot is redacted while the match is running.
    let uri = format!(
        "/api/match/{}/state?player_token={}",
        a.match_id, b.player_token
    );
    let (_, body) = request(&app, "GET", &uri, None, None).await;
    let players = body["players"].as_array().unwrap();
    let a_row = players
        .iter()
        .find(|p| p["id"] == json!(a.player_id))
        .unwrap();
    assert_eq!(a_row["progress"], JsonValue::Null);

    // A sees their own snapshot.
    let uri = format!(
        "/api/match/{}/state?player_token={}",
        a.match_id, a.player_token
    );
    let (_, body) = request(&app, "GET", &uri, None, None).await;
    let players = body["players"].as_array().unwrap();
    let a_row = players
        .iter()
        .find(|p| p["id"] == json!(a.player_id))
        .unwrap();
    assert!(a_row["progress"].is_object());

    // Once the match closes, everything is visible to everyone.
    engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &b.player_token,
        PlayerResult::Win,
        Some(2_000),
        None,
        Some(full_beginner_snapshot()),
    )
    .await
    .unwrap();
    let uri = format!(
        "/api/match/{}/state?player_token={}",
        a.match_id, b.player_token
    );
    let (_, body) = request(&app, "GET", &uri, None, None).await;
    let players = body["players"].as_array().unwrap();
    let a_row = players
        .iter()
        .find(|p| p["id"] == json!(a.player_id))
        .unwrap();
    assert!(a_row["progress"].is_object());
}

#[tokio::test]
async fn steps_view_returns_canonical_order() {
    let state = test_state().await;
    let app = router(state.clone());
    let (a, b) = running_match(&state).await;
    for (token, x) in [(&a.player_token, 1), (&b.player_token, 2), (&a.player_token, 3)] {
        engine::submit_step(
            &state.db,
            &state.cfg,
            a.match_id,
            token,
            StepAction::Reveal,
            x,
            0,
            None,
        )
        .await
        .unwrap();
    }

    let (status, body) = request(
        &app,
        "GET",
        &format!("/api/match/{}/steps", a.match_id),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 3);
    let seqs: Vec<i64> = rows.iter().map(|r| r["seq"].as_i64().unwrap()).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(rows[0]["player_name"], "alice");
    assert_eq!(rows[1]["player_name"], "bob");
}

#[tokio::test]
async fn recent_lists_newest_first() {
    let state = test_state().await;
    let app = router(state.clone());
    let alice = seed_user(&state, "alice").await;
    let bob = seed_user(&state, "bob").await;
    let first = engine::create_match(&state.db, &state.cfg, &alice, None)
        .await
        .unwrap();
    let second = engine::create_match(&state.db, &state.cfg, &bob, None)
        .await
        .unwrap();

    let (status, body) = request(&app, "GET", "/api/match/recent?limit=10", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!(second.match_id));
    assert_eq!(rows[1]["id"], json!(first.match_id));
}

// ---------------------------------------------------------------------------
// auth + active session over HTTP

#[tokio::test]
async fn register_login_me_roundtrip() {
    let state = test_state().await;
    let app = router(state);

    let (status, body) = request(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"handle": "Dana", "password": "hunter2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["access_token"].as_str().unwrap().to_owned();

    let (status, body) = request(&app, "GET", "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    // Handles are case-preserving.
    assert_eq!(body["handle"], "Dana");

    let (status, _) = request(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"handle": "Dana", "password": "other"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &app,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({"handle": "Dana", "password": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = request(&app, "GET", "/api/auth/me", Some("bogus"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn active_session_recovers_the_unique_seat() {
    let state = test_state().await;
    let app = router(state.clone());

    let (_, body) = request(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"handle": "erin", "password": "pw"})),
    )
    .await;
    let token = body["access_token"].as_str().unwrap().to_owned();

    let (status, body) = request(&app, "GET", "/api/match/active", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], json!(false));

    let (status, created) = request(
        &app,
        "POST",
        "/api/match",
        Some(&token),
        Some(json!({"difficulty": "beginner"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&app, "GET", "/api/match/active", Some(&token), None).await;
    assert_eq!(body["active"], json!(true));
    assert_eq!(body["match_id"], created["match_id"]);
    assert_eq!(body["player_token"], created["player_token"]);
    assert_eq!(body["board"], created["board"]);

    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/match/{}/leave", created["match_id"]),
        None,
        Some(json!({"player_token": created["player_token"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&app, "GET", "/api/match/active", Some(&token), None).await;
    assert_eq!(body["active"], json!(false));
}

#[tokio::test]
async fn full_match_over_http() {
    let state = test_state().await;
    let app = router(state.clone());

    let mut tokens = Vec::new();
    for handle in ["frank", "grace"] {
        let (_, body) = request(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"handle": handle, "password": "pw"})),
        )
        .await;
        tokens.push(body["access_token"].as_str().unwrap().to_owned());
    }

    let (_, created) = request(
        &app,
        "POST",
        "/api/match",
        Some(&tokens[0]),
        Some(json!({"difficulty": "beginner"})),
    )
    .await;
    let match_id = created["match_id"].as_i64().unwrap();
    let host_token = created["player_token"].as_str().unwrap().to_owned();

    let (status, joined) = request(
        &app,
        "POST",
        &format!("/api/match/{match_id}/join"),
        Some(&tokens[1]),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let guest_token = joined["player_token"].as_str().unwrap().to_owned();

    let (status, _) = request(
        &app,
        "POST",
        &format!("/api/match/{match_id}/ready"),
        None,
        Some(json!({"player_token": guest_token, "ready": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, started) = request(
        &app,
        "POST",
        &format!("/api/match/{match_id}/start"),
        None,
        Some(json!({"player_token": host_token})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["status"], "active");

    backdate(&state, match_id, Some(Utc::now() - Duration::seconds(1)), None, None).await;

    let cx = created["board"]["safe_start"]["x"].clone();
    let cy = created["board"]["safe_start"]["y"].clone();
    let (status, step) = request(
        &app,
        "POST",
        &format!("/api/match/{match_id}/step"),
        None,
        Some(json!({"player_token": host_token, "action": "reveal", "x": cx, "y": cy})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(step["seq"], json!(1));

    let (_, step) = request(
        &app,
        "POST",
        &format!("/api/match/{match_id}/step"),
        None,
        Some(json!({"player_token": guest_token, "action": "reveal", "x": cx, "y": cy})),
    )
    .await;
    assert_eq!(step["seq"], json!(2));

    let (status, finished) = request(
        &app,
        "POST",
        &format!("/api/match/{match_id}/finish"),
        None,
        Some(json!({
            "player_token": host_token,
            "outcome": "win",
            "duration_ms": 4_500,
            "progress": full_beginner_snapshot(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(finished["status"], "active");

    let (_, finished) = request(
        &app,
        "POST",
        &format!("/api/match/{match_id}/finish"),
        None,
        Some(json!({"player_token": guest_token, "outcome": "lose", "duration_ms": 5_000})),
    )
    .await;
    assert_eq!(finished["status"], "finished");
    assert_eq!(finished["rank"], json!(2));

    let (_, body) = request(&app, "GET", &format!("/api/match/{match_id}/state"), None, None).await;
    assert_eq!(body["status"], "finished");
    let players = body["players"].as_array().unwrap();
    let frank = players.iter().find(|p| p["name"] == "frank").unwrap();
    let grace = players.iter().find(|p| p["name"] == "grace").unwrap();
    assert_eq!(frank["rank"], json!(1));
    assert_eq!(grace["rank"], json!(2));
}

// ---------------------------------------------------------------------------
// leaderboard

#[tokio::test]
async fn leaderboard_keeps_strictly_better_times_only() {
    let state = test_state().await;
    let app = router(state.clone());

    let (_, body) = request(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({"handle": "heidi", "password": "pw"})),
    )
    .await;
    let token = body["access_token"].as_str().unwrap().to_owned();

    let replay = |n: i64| json!({"board": {"width": 9}, "steps": [{"x": n, "y": 0}]});
    let (status, first) = request(
        &app,
        "POST",
        "/api/leaderboard",
        Some(&token),
        Some(json!({"difficulty": "beginner", "time_ms": 30_000, "replay": replay(1)})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first_id = first["id"].as_i64().unwrap();

    // A strictly better time replaces the entry and its replay.
    let (_, second) = request(
        &app,
        "POST",
        "/api/leaderboard",
        Some(&token),
        Some(json!({"difficulty": "beginner", "time_ms": 25_000, "replay": replay(2)})),
    )
    .await;
    assert_eq!(second["time_ms"], json!(25_000));
    assert_eq!(second["id"], json!(first_id));

    // A worse time changes nothing.
    let (_, third) = request(
        &app,
        "POST",
        "/api/leaderboard",
        Some(&token),
        Some(json!({"difficulty": "beginner", "time_ms": 40_000})),
    )
    .await;
    assert_eq!(third["time_ms"], json!(25_000));

    let (_, rows) = request(
        &app,
        "GET",
        "/api/leaderboard?difficulty=beginner",
        None,
        None,
    )
    .await;
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["time_ms"], json!(25_000));
    assert_eq!(rows[0]["has_replay"], json!(true));

    let (status, body) = request(
        &app,
        "GET",
        &format!("/api/leaderboard/{first_id}/replay"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["steps"][0]["x"], json!(2));

    let (status, _) = request(
        &app,
        "POST",
        "/api/leaderboard",
        Some(&token),
        Some(json!({"difficulty": "beginner", "time_ms": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn leaderboard_prunes_replays_outside_top_n() {
    let cfg = RuntimeConfig {
        leaderboard_top_n: 2,
        ..RuntimeConfig::default()
    };
    let state = test_state_with(cfg).await;
    let app = router(state.clone());

    let mut tokens = Vec::new();
    for handle in ["ivan", "judy", "karl"] {
        let (_, body) = request(
            &app,
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"handle": handle, "password": "pw"})),
        )
        .await;
        tokens.push(body["access_token"].as_str().unwrap().to_owned());
    }

    let mut entry_ids = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let time = 10_000 + (i as i64) * 1_000;
        let (_, body) = request(
            &app,
            "POST",
            "/api/leaderboard",
            Some(token),
            Some(json!({
                "difficulty": "expert",
                "time_ms": time,
                "replay": {"board": {}, "steps": []},
            })),
        )
        .await;
        entry_ids.push(body["id"].as_i64().unwrap());
    }

    // Third-best of three with top_n = 2: entry persists, replay does not.
    let (status, _) = request(
        &app,
        "GET",
        &format!("/api/leaderboard/{}/replay", entry_ids[2]),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, rows) = request(&app, "GET", "/api/leaderboard?difficulty=expert", None, None).await;
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["has_replay"], json!(true));
    assert_eq!(rows[1]["has_replay"], json!(true));
    assert_eq!(rows[2]["has_replay"], json!(false));

    // karl improves into the window; judy's entry falls out and loses its
    // replay.
    let (_, improved) = request(
        &app,
        "POST",
        "/api/leaderboard",
        Some(&tokens[2]),
        Some(json!({
            "difficulty": "expert",
            "time_ms": 9_000,
            "replay": {"board": {}, "steps": []},
        })),
    )
    .await;
    assert_eq!(improved["has_replay"], json!(true));

    let (status, _) = request(
        &app,
        "GET",
        &format!("/api/leaderboard/{}/replay", entry_ids[1]),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = request(
        &app,
        "GET",
        &format!("/api/leaderboard/{}/replay", entry_ids[2]),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// history

#[tokio::test]
async fn history_reports_per_player_results() {
    let state = test_state().await;
    let app = router(state.clone());
    let (a, b) = running_match(&state).await;
    engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &a.player_token,
        PlayerResult::Win,
        Some(4_000),
        None,
        Some(full_beginner_snapshot()),
    )
    .await
    .unwrap();
    engine::finish(
        &state.db,
        &state.cfg,
        a.match_id,
        &b.player_token,
        PlayerResult::Lose,
        Some(6_000),
        None,
        None,
    )
    .await
    .unwrap();

    let (status, body) = request(&app, "GET", "/api/match/history?player=alice", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["result"], "win");
    assert_eq!(rows[0]["rank"], json!(1));

    let (_, body) = request(&app, "GET", "/api/match/history?player=nobody", None, None).await;
    assert_eq!(body.as_array().unwrap().len(), 0);
}
