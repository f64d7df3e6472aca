//! Mouse trajectory generation.
//!
//! A path is an arc (never an S-curve): two control knots sit on the same
//! side of the straight line, the dense Bezier sampling gets a light Gaussian
//! roughing-up, and the final point count scales with the fourth root of the
//! arc length so short hops stay snappy while long sweeps stay smooth.

use rand::Rng;

use crate::bezier::bezier_curve;
use crate::{arc_length, Point};

/// Tuning for [`generate_path`].
#[derive(Debug, Clone, Copy)]
pub struct PathConfig {
    /// Speed multiplier; larger values produce fewer points.
    pub move_speed: f64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self { move_speed: 1.0 }
    }
}

/// quadratic ease-out: fast start, settling end.
pub(crate) fn ease_out_quad(t: f64) -> f64 {
    t * (2.0 - t)
}

/// Draws from a standard normal via Box-Muller.
pub(crate) fn gaussian(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Generates an ordered mouse trajectory from `start` to `end`.
///
/// The last point is always exactly `end` and the total point count is
/// clamped to `[2, 150]`.
pub fn generate_path(start: Point, end: Point, config: PathConfig) -> Vec<Point> {
    let mut rng = rand::rng();
    generate_path_with(start, end, config, &mut rng)
}

pub(crate) fn generate_path_with(
    start: Point,
    end: Point,
    config: PathConfig,
    rng: &mut impl Rng,
) -> Vec<Point> {
    let distance = start.distance(end);
    if distance < 1.0 {
        return vec![start, end];
    }

    let dx = (end.x - start.x) / distance;
    let dy = (end.y - start.y) / distance;
    // one perpendicular, picked once, so both knots bow the same way
    let side = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
    let (px, py) = (-dy * side, dx * side);

    let bow = distance * rng.random_range(0.05..=0.20);
    let j1 = rng.random_range(0.7..=1.0);
    let j2 = rng.random_range(0.7..=1.0);
    let k1 = Point::new(
        start.x + (end.x - start.x) / 3.0 + px * bow * j1,
        start.y + (end.y - start.y) / 3.0 + py * bow * j1,
    );
    let k2 = Point::new(
        start.x + (end.x - start.x) * 2.0 / 3.0 + px * bow * j2,
        start.y + (end.y - start.y) * 2.0 / 3.0 + py * bow * j2,
    );

    let samples = (distance.floor() as usize).max(50);
    let mut curve = bezier_curve(&[start, k1, k2, end], samples);

    // rough up half of the interior points by a pixel of vertical noise
    for p in curve.iter_mut().skip(1).take(samples.saturating_sub(2)) {
        if rng.random_bool(0.5) {
            p.y += gaussian(rng);
        }
    }

    let arc = arc_length(&curve);
    let count = ((arc.powf(0.25) * 20.0 / config.move_speed).round() as i64).clamp(2, 150) as usize;

    let mut path = Vec::with_capacity(count);
    for i in 0..count {
        let t = i as f64 / (count as f64 - 1.0);
        let eased = ease_out_quad(t);
        let idx = ((eased * (samples as f64 - 1.0)).round() as usize).min(samples - 1);
        path.push(curve[idx]);
    }
    // resampling may land short of the true target; pin it
    *path.last_mut().expect("count >= 2") = end;
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_point_is_exact_and_len_bounded() {
        for _ in 0..20 {
            let path = generate_path(
                Point::new(13.0, 840.0),
                Point::new(412.0, 77.0),
                PathConfig::default(),
            );
            assert_eq!(*path.last().unwrap(), Point::new(412.0, 77.0));
            assert!(path.len() >= 2 && path.len() <= 150);
        }
    }

    #[test]
    fn horizontal_kilometer_path_matches_expected_density() {
        // 1000px at speed 1 should land near round(sqrt(sqrt(1000)) * 20)
        let path = generate_path(
            Point::new(0.0, 0.0),
            Point::new(1000.0, 0.0),
            PathConfig { move_speed: 1.0 },
        );
        assert!(
            (100..=120).contains(&path.len()),
            "unexpected path len {}",
            path.len()
        );
        assert_eq!(*path.last().unwrap(), Point::new(1000.0, 0.0));
        // the arc and the Gaussian roughing should leave the straight line
        assert!(path.iter().any(|p| p.y.abs() > 1e-6));
    }

    #[test]
    fn fast_speed_thins_the_path() {
        let slow = generate_path(
            Point::new(0.0, 0.0),
            Point::new(600.0, 300.0),
            PathConfig { move_speed: 1.0 },
        );
        let fast = generate_path(
            Point::new(0.0, 0.0),
            Point::new(600.0, 300.0),
            PathConfig { move_speed: 4.0 },
        );
        assert!(fast.len() < slow.len());
    }

    #[test]
    fn degenerate_distance_still_two_points() {
        let path = generate_path(
            Point::new(5.0, 5.0),
            Point::new(5.2, 5.0),
            PathConfig::default(),
        );
        assert_eq!(path.len(), 2);
        assert_eq!(*path.last().unwrap(), Point::new(5.2, 5.0));
    }

    #[test]
    fn ease_out_quad_shape() {
        assert_eq!(ease_out_quad(0.0), 0.0);
        assert_eq!(ease_out_quad(1.0), 1.0);
        assert!(ease_out_quad(0.5) > 0.5);
    }
}
