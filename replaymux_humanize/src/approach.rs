//! Two-phase approach planning toward a click target.
//!
//! Phase 1 is a ballistic sweep that deliberately stops short; phase 2 is a
//! slow correction arc. A minority of approaches overshoot past the target
//! and walk back, which is what real pointers do on large displays.

use std::time::Duration;

use rand::Rng;

use crate::path::{ease_out_quad, generate_path_with, PathConfig};
use crate::Point;

/// One contiguous pointer sweep: points paired with per-step delays.
#[derive(Debug, Clone)]
pub struct Segment {
    pub points: Vec<Point>,
    pub delays: Vec<Duration>,
    /// Pause after the sweep finishes (used for overshoot corrections).
    pub pause_after: Duration,
}

impl Segment {
    fn new(points: Vec<Point>, total: Duration, decelerate_tail: bool) -> Self {
        let steps = points.len().max(2) - 1;
        let base = total.as_secs_f64() / steps as f64;
        let delays = (0..steps)
            .map(|i| {
                let frac = i as f64 / steps as f64;
                // deceleration concentrates time into the last quarter
                let scale = if decelerate_tail && frac > 0.75 {
                    1.0 + ease_out_quad((frac - 0.75) * 4.0) * 2.0
                } else {
                    1.0
                };
                Duration::from_secs_f64(base * scale)
            })
            .collect();
        Self {
            points,
            delays,
            pause_after: Duration::ZERO,
        }
    }

    /// Total wall time of this sweep including the trailing pause.
    pub fn duration(&self) -> Duration {
        self.delays.iter().sum::<Duration>() + self.pause_after
    }
}

/// An ordered set of sweeps ending at `landing`.
#[derive(Debug, Clone)]
pub struct ApproachPlan {
    pub segments: Vec<Segment>,
    /// The jittered point the pointer actually lands on.
    pub landing: Point,
}

impl ApproachPlan {
    pub fn duration(&self) -> Duration {
        self.segments.iter().map(Segment::duration).sum()
    }
}

/// Plans a full two-phase approach from `start` to `target`.
pub fn plan_approach(start: Point, target: Point) -> ApproachPlan {
    let mut rng = rand::rng();
    plan_approach_with(start, target, &mut rng)
}

pub(crate) fn plan_approach_with(
    start: Point,
    target: Point,
    rng: &mut impl Rng,
) -> ApproachPlan {
    let landing = jitter_landing(target, rng);
    let distance = start.distance(landing);
    if distance < 4.0 {
        let seg = Segment::new(vec![start, landing], Duration::from_millis(60), false);
        return ApproachPlan {
            segments: vec![seg],
            landing,
        };
    }

    // staging point 15-25px short of the target, nudged sideways
    let shortfall = rng.random_range(15.0f64..=25.0).min(distance * 0.5);
    let dx = (landing.x - start.x) / distance;
    let dy = (landing.y - start.y) / distance;
    let lateral = rng.random_range(-6.0..=6.0);
    let staging = Point::new(
        landing.x - dx * shortfall - dy * lateral,
        landing.y - dy * shortfall + dx * lateral,
    );

    let sweep_ms = rng.random_range(350..=650);
    let sweep = Segment::new(
        generate_path_with(start, staging, PathConfig { move_speed: 1.0 }, rng),
        Duration::from_millis(sweep_ms),
        false,
    );

    let mut segments = vec![sweep];

    if rng.random_bool(0.15) {
        // overshoot: sail 8-15px past, pause, walk back decelerating
        let over = rng.random_range(8.0..=15.0);
        let past = Point::new(landing.x + dx * over, landing.y + dy * over);
        let mut out = Segment::new(
            generate_path_with(staging, past, PathConfig { move_speed: 2.0 }, rng),
            Duration::from_millis(rng.random_range(120..=220)),
            false,
        );
        out.pause_after = Duration::from_millis(rng.random_range(80..=150));
        segments.push(out);
        segments.push(Segment::new(
            generate_path_with(past, landing, PathConfig { move_speed: 2.5 }, rng),
            Duration::from_millis(rng.random_range(100..=180)),
            true,
        ));
    } else {
        let correction_ms = rng.random_range(150..=350);
        segments.push(Segment::new(
            generate_path_with(staging, landing, PathConfig { move_speed: 2.0 }, rng),
            Duration::from_millis(correction_ms),
            true,
        ));
    }

    ApproachPlan { segments, landing }
}

/// Single-arc approach used where the full ritual is too slow (standalone
/// widgets under many-tab contention).
pub fn plan_direct_approach(start: Point, target: Point) -> ApproachPlan {
    let mut rng = rand::rng();
    let landing = jitter_landing(target, &mut rng);
    let seg = Segment::new(
        generate_path_with(start, landing, PathConfig { move_speed: 1.5 }, &mut rng),
        Duration::from_millis(rng.random_range(200..=400)),
        true,
    );
    ApproachPlan {
        segments: vec![seg],
        landing,
    }
}

fn jitter_landing(target: Point, rng: &mut impl Rng) -> Point {
    Point::new(
        target.x + rng.random_range(-3.0..=3.0),
        target.y + rng.random_range(-2.0..=2.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approach_lands_near_target() {
        for _ in 0..25 {
            let plan = plan_approach(Point::new(10.0, 10.0), Point::new(480.0, 320.0));
            let last = *plan
                .segments
                .last()
                .unwrap()
                .points
                .last()
                .unwrap();
            assert_eq!(last, plan.landing);
            assert!((plan.landing.x - 480.0).abs() <= 3.0);
            assert!((plan.landing.y - 320.0).abs() <= 2.0);
        }
    }

    #[test]
    fn approach_has_two_or_three_phases() {
        for _ in 0..25 {
            let plan = plan_approach(Point::new(0.0, 0.0), Point::new(400.0, 100.0));
            assert!((2..=3).contains(&plan.segments.len()));
        }
    }

    #[test]
    fn delays_match_points() {
        let plan = plan_approach(Point::new(0.0, 0.0), Point::new(300.0, 80.0));
        for seg in &plan.segments {
            assert_eq!(seg.delays.len(), seg.points.len().max(2) - 1);
        }
    }

    #[test]
    fn short_hops_collapse_to_one_segment() {
        let plan = plan_approach(Point::new(100.0, 100.0), Point::new(101.0, 100.5));
        assert_eq!(plan.segments.len(), 1);
    }

    #[test]
    fn direct_approach_is_single_arc() {
        let plan = plan_direct_approach(Point::new(0.0, 0.0), Point::new(250.0, 60.0));
        assert_eq!(plan.segments.len(), 1);
        assert!(plan.duration() <= Duration::from_millis(1500));
    }
}
