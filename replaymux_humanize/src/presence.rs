//! Idle-presence simulation: a few unhurried pointer wanderings with the
//! occasional scroll or harmless keypress.

use std::time::Duration;

use rand::prelude::IndexedRandom;
use rand::Rng;

use crate::path::{generate_path_with, PathConfig};
use crate::Point;

/// Keys that are safe to press on any page without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKey {
    Tab,
    ArrowDown,
    ArrowUp,
}

impl PresenceKey {
    /// (key, code, windowsVirtualKeyCode) triple for `Input.dispatchKeyEvent`.
    pub fn key_ident(&self) -> (&'static str, &'static str, i64) {
        match self {
            PresenceKey::Tab => ("Tab", "Tab", 9),
            PresenceKey::ArrowDown => ("ArrowDown", "ArrowDown", 40),
            PresenceKey::ArrowUp => ("ArrowUp", "ArrowUp", 38),
        }
    }
}

/// One wandering toward a waypoint.
#[derive(Debug, Clone)]
pub struct PresenceMove {
    pub path: Vec<Point>,
    /// Delay between consecutive pointer steps.
    pub step_delay: Duration,
    /// Small wheel scroll to fire after arriving, if any.
    pub scroll_delta: Option<f64>,
    /// Harmless keypress to fire after arriving, if any.
    pub keypress: Option<PresenceKey>,
}

/// The full presence plan; `final_position` is where the cursor rests.
#[derive(Debug, Clone)]
pub struct PresencePlan {
    pub moves: Vec<PresenceMove>,
    pub final_position: Point,
}

/// Plans `duration` worth of idle presence inside a `width` x `height`
/// viewport starting from `start`.
pub fn plan_presence(start: Point, width: f64, height: f64, duration: Duration) -> PresencePlan {
    let mut rng = rand::rng();
    plan_presence_with(start, width, height, duration, &mut rng)
}

pub(crate) fn plan_presence_with(
    start: Point,
    width: f64,
    height: f64,
    duration: Duration,
    rng: &mut impl Rng,
) -> PresencePlan {
    let waypoints = rng.random_range(1..=3usize);
    let share = duration.as_secs_f64() / waypoints as f64;

    let mut cursor = start;
    let mut moves = Vec::with_capacity(waypoints);
    for _ in 0..waypoints {
        // keep away from the extreme edges where real cursors rarely idle
        let to = Point::new(
            rng.random_range(width * 0.1..=width * 0.9),
            rng.random_range(height * 0.1..=height * 0.9),
        );
        let path = generate_path_with(cursor, to, PathConfig { move_speed: 1.2 }, rng);
        let steps = path.len().max(2) as f64;
        let jitter = rng.random_range(0.75..=1.25);
        let step_delay = Duration::from_secs_f64((share * 0.8 * jitter / steps).max(0.004));

        let scroll_delta = if rng.random_bool(0.30) {
            Some(rng.random_range(-80.0..=120.0))
        } else {
            None
        };
        let keypress = if rng.random_bool(0.40) {
            [
                PresenceKey::Tab,
                PresenceKey::ArrowDown,
                PresenceKey::ArrowUp,
            ]
            .choose(rng)
            .copied()
        } else {
            None
        };

        cursor = to;
        moves.push(PresenceMove {
            path,
            step_delay,
            scroll_delta,
            keypress,
        });
    }

    PresencePlan {
        moves,
        final_position: cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_stays_inside_viewport() {
        for _ in 0..20 {
            let plan = plan_presence(
                Point::new(5.0, 5.0),
                1280.0,
                720.0,
                Duration::from_millis(800),
            );
            assert!(!plan.moves.is_empty() && plan.moves.len() <= 3);
            let last = plan.moves.last().unwrap().path.last().copied().unwrap();
            assert_eq!(last, plan.final_position);
            assert!(plan.final_position.x >= 128.0 && plan.final_position.x <= 1152.0);
            assert!(plan.final_position.y >= 72.0 && plan.final_position.y <= 648.0);
        }
    }

    #[test]
    fn step_delays_are_positive() {
        let plan = plan_presence(
            Point::new(0.0, 0.0),
            800.0,
            600.0,
            Duration::from_millis(1500),
        );
        for mv in &plan.moves {
            assert!(mv.step_delay >= Duration::from_millis(4));
        }
    }
}
