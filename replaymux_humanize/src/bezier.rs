//! Bezier curve sampling through arbitrary control points.

use crate::Point;

/// Computes the gamma function with an accuracy of 16 floating point digits.
/// "An Analysis Of The Lanczos Gamma Approximation", Glendon Ralph Pugh, 2004.
pub(crate) fn gamma(z: f64) -> f64 {
    const GAMMA_DK: &[f64] = &[
        2.48574089138753565546e-5,
        1.05142378581721974210,
        -3.45687097222016235469,
        4.51227709466894823700,
        -2.98285225323576655721,
        1.05639711577126713077,
        -1.95428773191645869583e-1,
        1.70970543404441224307e-2,
        -5.71926117404305781283e-4,
        4.63399473359905636708e-6,
        -2.71994908488607703910e-9,
    ];
    const TWO_SQRT_E_OVER_PI: f64 = 1.8603827342052657173362492472666631120594218414085755;
    const GAMMA_R: f64 = 10.900511;
    if z < 0.5 {
        std::f64::consts::PI
            / ((std::f64::consts::PI * z).sin()
                * GAMMA_DK
                    .iter()
                    .enumerate()
                    .skip(1)
                    .fold(GAMMA_DK[0], |s, i| s + i.1 / (i.0 as f64 - z))
                * TWO_SQRT_E_OVER_PI
                * ((0.5 - z + GAMMA_R) / std::f64::consts::E).powf(0.5 - z))
    } else {
        GAMMA_DK
            .iter()
            .enumerate()
            .skip(1)
            .fold(GAMMA_DK[0], |s, i| s + i.1 / (z + i.0 as f64 - 1.0))
            * TWO_SQRT_E_OVER_PI
            * ((z - 0.5 + GAMMA_R) / std::f64::consts::E).powf(z - 0.5)
    }
}

/// Computes the number of combinations (n choose k).
pub(crate) fn comb(n: usize, k: usize) -> usize {
    (gamma((n + 1) as f64) / (gamma((k + 1) as f64) * gamma((n - k + 1) as f64))).round() as usize
}

/// The Bernstein polynomial of n, i evaluated at `t_val`.
pub(crate) fn bernstein(i: usize, n: usize, t_val: f64) -> f64 {
    comb(n, i) as f64 * t_val.powi(i as i32) * (1.0 - t_val).powi((n - i) as i32)
}

/// Samples the Bezier curve defined by `points` at `num_steps` evenly spaced
/// parameter values, endpoints included.
pub fn bezier_curve(points: &[Point], num_steps: usize) -> Vec<Point> {
    let n = points.len();
    debug_assert!(n >= 2);
    let degree = n - 1;
    let steps = num_steps.max(2);

    (0..steps)
        .map(|step| {
            let t = step as f64 / (steps as f64 - 1.0);
            let mut x = 0.0;
            let mut y = 0.0;
            for (i, p) in points.iter().enumerate() {
                let b = bernstein(i, degree, t);
                x += b * p.x;
                y += b * p.y;
            }
            Point::new(x, y)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comb_matches_pascal() {
        assert_eq!(comb(3, 0), 1);
        assert_eq!(comb(3, 1), 3);
        assert_eq!(comb(4, 2), 6);
        assert_eq!(comb(6, 3), 20);
    }

    #[test]
    fn curve_hits_endpoints() {
        let pts = vec![
            Point::new(0.0, 0.0),
            Point::new(30.0, 50.0),
            Point::new(70.0, -20.0),
            Point::new(100.0, 0.0),
        ];
        let curve = bezier_curve(&pts, 64);
        assert_eq!(curve.len(), 64);
        assert!(curve[0].distance(pts[0]) < 1e-9);
        assert!(curve[63].distance(pts[3]) < 1e-9);
    }

    #[test]
    fn straight_control_points_stay_on_the_line() {
        let pts = vec![
            Point::new(0.0, 10.0),
            Point::new(50.0, 10.0),
            Point::new(100.0, 10.0),
        ];
        for p in bezier_curve(&pts, 20) {
            assert!((p.y - 10.0).abs() < 1e-9);
        }
    }
}
