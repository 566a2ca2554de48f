//! Board agreement: difficulty presets, seed generation and the
//! deterministic safe-start derivation. The server never places mines;
//! clients reproduce the identical layout from `(width, height, mines,
//! seed)` with the guarantee that `safe_start` and its 8-neighborhood are
//! clear on first reveal.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::entities::matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub width: i32,
    pub height: i32,
    pub mines: i32,
}

pub fn preset(difficulty: &str) -> Option<Preset> {
    match difficulty {
        "beginner" => Some(Preset {
            width: 9,
            height: 9,
            mines: 10,
        }),
        "intermediate" => Some(Preset {
            width: 20,
            height: 20,
            mines: 50,
        }),
        "expert" => Some(Preset {
            width: 20,
            height: 20,
            mines: 99,
        }),
        _ => None,
    }
}

/// 8 random bytes, hex-encoded. Stored verbatim and served back to every
/// seat so all clients derive the same layout.
pub fn generate_seed() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Derive the required first-reveal cell from the seed. FNV-1a over the
/// seed bytes; the cell is interior whenever the board is at least 3x3 so
/// the clear 8-neighborhood fits.
pub fn safe_start(width: i32, height: i32, seed: &str) -> (i32, i32) {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in seed.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let x = axis(h, width);
    let y = axis(h >> 32, height);
    (x, y)
}

fn axis(h: u64, extent: i32) -> i32 {
    if extent > 2 {
        1 + (h % (extent as u64 - 2)) as i32
    } else {
        (h % extent.max(1) as u64) as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

/// The board descriptor served on create/join/state/active. The safe-start
/// cell is emitted under both the snake_case and camelCase keys; clients in
/// the wild read either.
#[derive(Debug, Clone, Serialize)]
pub struct BoardPayload {
    pub width: i32,
    pub height: i32,
    pub mines: i32,
    pub seed: String,
    pub difficulty: String,
    pub safe_start: Cell,
    #[serde(rename = "safeStart")]
    pub safe_start_alias: Cell,
}

impl BoardPayload {
    pub fn from_match(m: &matches::Model) -> Self {
        let cell = Cell {
            x: m.safe_x,
            y: m.safe_y,
        };
        Self {
            width: m.width,
            height: m.height,
            mines: m.mines,
            seed: m.seed.clone(),
            difficulty: m.difficulty.clone(),
            safe_start: cell,
            safe_start_alias: cell,
        }
    }
}
