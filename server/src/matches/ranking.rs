//! End-of-match ranking. The server holds no mine layout, so "revealed
//! cells" comes from the seat's submitted `progress.board` snapshot when
//! one exists and otherwise from the count of distinct reveal-step
//! coordinates. Flags and chords are ignored either way.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::entities::match_players::{self, PlayerResult};
use crate::entities::match_steps::{self, StepAction};
use crate::entities::matches;

pub fn safe_cells(m: &matches::Model) -> i64 {
    i64::from(m.width) * i64::from(m.height) - i64::from(m.mines)
}

/// Whether a win claim is backed by a fully revealed safe area. No
/// snapshot, or a snapshot short of `safe_cells`, fails; the caller then
/// coerces the outcome to forfeit.
pub fn evidences_win(progress: Option<&JsonValue>, m: &matches::Model) -> bool {
    progress
        .and_then(count_revealed_safe)
        .map_or(false, |n| n >= safe_cells(m))
}

/// Count revealed non-mine cells in a `{board: {cells: [...]}}` snapshot.
/// Cells may be a flat array or rows of arrays; anything else is treated
/// as no evidence.
pub fn count_revealed_safe(progress: &JsonValue) -> Option<i64> {
    let cells = progress.get("board")?.get("cells")?.as_array()?;
    let mut n = 0;
    for cell in cells {
        match cell.as_array() {
            Some(row) => n += row.iter().filter(|c| revealed_safe(c)).count() as i64,
            None => {
                if revealed_safe(cell) {
                    n += 1;
                }
            }
        }
    }
    Some(n)
}

fn revealed_safe(cell: &JsonValue) -> bool {
    cell.get("revealed").and_then(JsonValue::as_bool).unwrap_or(false)
        && !cell.get("mine").and_then(JsonValue::as_bool).unwrap_or(false)
}

pub fn revealed_cells(seat: &match_players::Model, steps: &[match_steps::Model]) -> i64 {
    if let Some(n) = seat.progress.as_ref().and_then(count_revealed_safe) {
        return n;
    }
    steps
        .iter()
        .filter(|s| s.player_id == seat.id && s.action == StepAction::Reveal)
        .map(|s| (s.x, s.y))
        .collect::<HashSet<_>>()
        .len() as i64
}

struct RankKey {
    seat_id: i64,
    forfeit: bool,
    win: bool,
    revealed: i64,
    duration_ms: Option<i64>,
    steps_count: i32,
    finished_at: Option<DateTime<Utc>>,
}

fn compare(a: &RankKey, b: &RankKey) -> Ordering {
    a.forfeit
        .cmp(&b.forfeit)
        .then_with(|| b.win.cmp(&a.win))
        .then_with(|| b.revealed.cmp(&a.revealed))
        .then_with(|| asc_nones_last(a.duration_ms, b.duration_ms))
        .then_with(|| a.steps_count.cmp(&b.steps_count))
        .then_with(|| asc_nones_last(a.finished_at, b.finished_at))
}

fn asc_nones_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Rank every seat of a finished match, best first, returning
/// `(seat_id, rank)` with ranks 1..N.
pub fn rank_seats(
    seats: &[match_players::Model],
    steps: &[match_steps::Model],
) -> Vec<(i64, i32)> {
    let mut keys: Vec<RankKey> = seats
        .iter()
        .map(|seat| RankKey {
            seat_id: seat.id,
            forfeit: seat.result == Some(PlayerResult::Forfeit),
            win: seat.result == Some(PlayerResult::Win),
            revealed: revealed_cells(seat, steps),
            duration_ms: seat.duration_ms,
            steps_count: seat.steps_count,
            finished_at: seat.finished_at,
        })
        .collect();
    keys.sort_by(compare);
    keys.iter()
        .enumerate()
        .map(|(i, key)| (key.seat_id, (i + 1) as i32))
        .collect()
}
