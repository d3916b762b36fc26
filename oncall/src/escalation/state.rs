//! Escalation cursor and status transitions
//!
//! Pure functions; the engine applies them inside a store transaction.
//!
//! ```text
//! none ──▶ pending ──▶ escalating ──▶ completed
//!   │         │            │  ▲
//!   │         │            └──┘ next level / next cycle
//!   └─────────┴────────────┴──────▶ stopped (ack / resolve)
//! ```

use serde::{Deserialize, Serialize};

use crate::store::EscalationStatus;

/// Where escalation goes after the current level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// Notify this level next
    Level { level: u32, cycle: u32 },
    /// Every allowed cycle has run
    Exhausted { cycles: u32 },
}

/// Step the (level, cycle) cursor.
///
/// `current_level` is 0 before the first level. `last_level` is the highest
/// level number of the policy; gaps below it are visited and reported by the
/// caller. `repeat_max_times` counts full passes and is treated as at least 1.
pub fn next_cursor(current_level: u32, cycle: u32, last_level: u32, repeat_max_times: u32) -> Cursor {
    if last_level == 0 {
        return Cursor::Exhausted { cycles: cycle };
    }
    let next = current_level.saturating_add(1);
    if next <= last_level {
        return Cursor::Level { level: next, cycle };
    }
    let finished = cycle.saturating_add(1);
    if finished < repeat_max_times.max(1) {
        Cursor::Level {
            level: 1,
            cycle: finished,
        }
    } else {
        Cursor::Exhausted { cycles: finished }
    }
}

/// Whether the escalation status may move from `from` to `to`.
pub fn can_transition(from: EscalationStatus, to: EscalationStatus) -> bool {
    use EscalationStatus::*;
    matches!(
        (from, to),
        (None, Pending)
            | (Pending, Escalating)
            | (Pending, Completed)
            | (Escalating, Escalating)
            | (Escalating, Completed)
            | (None | Pending | Escalating, Stopped)
    )
}

/// Statuses in which the incident may still be advanced.
pub fn is_advancing(status: EscalationStatus) -> bool {
    matches!(status, EscalationStatus::Pending | EscalationStatus::Escalating)
}
