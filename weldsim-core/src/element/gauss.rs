//! Gauss quadrature rules for numerical integration.
//!
//! This module provides the Gauss-Legendre rules used by the solid elements:
//! - 1D line integration (also used to build tensor-product rules)
//! - Tetrahedral volume integration
//! - Hexahedral (brick) volume integration
//!
//! # Usage
//!
//! ```
//! use weldsim_core::element::gauss::{gauss_1d, gauss_hex, gauss_tet};
//!
//! // 2-point 1D rule
//! for (xi, w) in gauss_1d(2) {
//!     // integrate at point xi with weight w
//!     let _ = (xi, w);
//! }
//!
//! // 4-point tetrahedral rule
//! for gp in gauss_tet(4) {
//!     // gp.coords gives (L1, L2, L3, L4) barycentric coordinates
//!     let _ = gp.weight;
//! }
//! assert_eq!(gauss_hex(2).len(), 8);
//! ```

/// A Gauss quadrature point with natural coordinates and weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussPoint {
    /// Natural coordinates.
    /// - For tetrahedral: [L1, L2, L3, L4] (barycentric, sum = 1)
    /// - For hexahedral: [ξ, η, ζ, 0] in [-1, 1]³
    pub coords: [f64; 4],
    /// Integration weight on the reference element.
    pub weight: f64,
}

impl GaussPoint {
    /// Create a new Gauss point.
    pub fn new(coords: [f64; 4], weight: f64) -> Self {
        Self { coords, weight }
    }

    /// Get ξ (first natural coordinate).
    #[inline]
    pub fn xi(&self) -> f64 {
        self.coords[0]
    }

    /// Get η (second natural coordinate).
    #[inline]
    pub fn eta(&self) -> f64 {
        self.coords[1]
    }

    /// Get ζ (third natural coordinate).
    #[inline]
    pub fn zeta(&self) -> f64 {
        self.coords[2]
    }
}

/// 1D Gauss-Legendre quadrature points and weights on [-1, 1].
///
/// # Arguments
///
/// * `n` - Number of integration points (1 to 5)
///
/// # Panics
///
/// Panics if `n` is not in 1..=5.
pub fn gauss_1d(n: usize) -> Vec<(f64, f64)> {
    match n {
        1 => vec![(0.0, 2.0)],
        2 => {
            let p = 1.0 / 3.0_f64.sqrt();
            vec![(-p, 1.0), (p, 1.0)]
        }
        3 => {
            let p = (3.0 / 5.0_f64).sqrt();
            vec![(-p, 5.0 / 9.0), (0.0, 8.0 / 9.0), (p, 5.0 / 9.0)]
        }
        4 => {
            // Points: ±√((3 ∓ 2√(6/5))/7)
            let sqrt_6_5 = (6.0 / 5.0_f64).sqrt();
            let p1 = ((3.0 - 2.0 * sqrt_6_5) / 7.0).sqrt();
            let p2 = ((3.0 + 2.0 * sqrt_6_5) / 7.0).sqrt();
            // Weights: (18 ± √30) / 36
            let sqrt_30 = 30.0_f64.sqrt();
            let w1 = (18.0 + sqrt_30) / 36.0;
            let w2 = (18.0 - sqrt_30) / 36.0;
            vec![(-p2, w2), (-p1, w1), (p1, w1), (p2, w2)]
        }
        5 => {
            // Points: 0, ±(1/3)√(5 ∓ 2√(10/7))
            let s = 2.0 * (10.0 / 7.0_f64).sqrt();
            let p1 = (5.0 - s).sqrt() / 3.0;
            let p2 = (5.0 + s).sqrt() / 3.0;
            let sqrt_70 = 70.0_f64.sqrt();
            let w1 = (322.0 + 13.0 * sqrt_70) / 900.0;
            let w2 = (322.0 - 13.0 * sqrt_70) / 900.0;
            vec![
                (-p2, w2),
                (-p1, w1),
                (0.0, 128.0 / 225.0),
                (p1, w1),
                (p2, w2),
            ]
        }
        _ => panic!("gauss_1d: n must be 1 to 5, got {}", n),
    }
}

/// Tetrahedral Gauss quadrature points.
///
/// Points are given in barycentric coordinates (L1, L2, L3, L4) of the unit
/// tetrahedron (0,0,0), (1,0,0), (0,1,0), (0,0,1). Weights are scaled for its
/// volume 1/6, so ∫f dV ≈ Σ w_i |det J| f(x_i).
///
/// # Arguments
///
/// * `n` - Number of integration points (1, 4, or 5)
///
/// # Integration Order
///
/// - n=1: exact for linear polynomials (stiffness of the linear tet)
/// - n=4: exact for quadratics (consistent capacity N_i N_j)
/// - n=5: exact for cubics
///
/// # Panics
///
/// Panics if `n` is not 1, 4, or 5.
pub fn gauss_tet(n: usize) -> Vec<GaussPoint> {
    match n {
        1 => vec![GaussPoint::new([0.25, 0.25, 0.25, 0.25], 1.0 / 6.0)],
        4 => {
            // Points at (α, β, β, β) and permutations
            let sqrt5 = 5.0_f64.sqrt();
            let alpha = (5.0 + 3.0 * sqrt5) / 20.0;
            let beta = (5.0 - sqrt5) / 20.0;
            let w = 1.0 / 24.0;
            vec![
                GaussPoint::new([alpha, beta, beta, beta], w),
                GaussPoint::new([beta, alpha, beta, beta], w),
                GaussPoint::new([beta, beta, alpha, beta], w),
                GaussPoint::new([beta, beta, beta, alpha], w),
            ]
        }
        5 => {
            // Keast rule: centroid with negative weight plus four interior points
            let w_center = -2.0 / 15.0;
            let w_other = 3.0 / 40.0;
            let (a, b) = (0.5, 1.0 / 6.0);
            vec![
                GaussPoint::new([0.25, 0.25, 0.25, 0.25], w_center),
                GaussPoint::new([a, b, b, b], w_other),
                GaussPoint::new([b, a, b, b], w_other),
                GaussPoint::new([b, b, a, b], w_other),
                GaussPoint::new([b, b, b, a], w_other),
            ]
        }
        _ => panic!("gauss_tet: n must be 1, 4, or 5, got {}", n),
    }
}

/// Hexahedral Gauss quadrature points on ξ, η, ζ ∈ [-1, 1].
///
/// Tensor product of 1D Gauss-Legendre rules; returns n³ points.
///
/// # Panics
///
/// Panics if `n` is not in 1..=5.
pub fn gauss_hex(n: usize) -> Vec<GaussPoint> {
    if !(1..=5).contains(&n) {
        panic!("gauss_hex: n must be 1 to 5, got {}", n);
    }

    let rule_1d = gauss_1d(n);
    let mut points = Vec::with_capacity(n * n * n);

    for &(xi, w_xi) in &rule_1d {
        for &(eta, w_eta) in &rule_1d {
            for &(zeta, w_zeta) in &rule_1d {
                points.push(GaussPoint::new([xi, eta, zeta, 0.0], w_xi * w_eta * w_zeta));
            }
        }
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gauss_1d_integrates_polynomials() {
        // 2-point rule integrates x² exactly
        let rule = gauss_1d(2);
        let integral: f64 = rule.iter().map(|&(x, w)| x.powi(2) * w).sum();
        assert_relative_eq!(integral, 2.0 / 3.0, epsilon = 1e-14);

        // 5-point rule integrates x⁸ exactly (degree 2n-1 = 9)
        let rule = gauss_1d(5);
        let integral: f64 = rule.iter().map(|&(x, w)| x.powi(8) * w).sum();
        assert_relative_eq!(integral, 2.0 / 9.0, epsilon = 1e-13);
    }

    #[test]
    fn test_gauss_1d_weights_sum() {
        for n in 1..=5 {
            let sum: f64 = gauss_1d(n).iter().map(|&(_, w)| w).sum();
            assert_relative_eq!(sum, 2.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_gauss_tet_weights_and_barycentric_sum() {
        for &n in &[1, 4, 5] {
            let rule = gauss_tet(n);
            let sum: f64 = rule.iter().map(|gp| gp.weight).sum();
            assert_relative_eq!(sum, 1.0 / 6.0, epsilon = 1e-14);
            for gp in &rule {
                let l: f64 = gp.coords.iter().sum();
                assert_relative_eq!(l, 1.0, epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn test_gauss_tet_integrates_quadratic() {
        // ∫ L1² dV over the unit tet = 2!/5! · 6 · (1/6) = 1/60
        let integral: f64 = gauss_tet(4)
            .iter()
            .map(|gp| gp.coords[0].powi(2) * gp.weight)
            .sum();
        assert_relative_eq!(integral, 1.0 / 60.0, epsilon = 1e-14);
    }

    #[test]
    fn test_gauss_hex_point_count_and_weights() {
        for n in 1..=3 {
            let rule = gauss_hex(n);
            assert_eq!(rule.len(), n * n * n);
            let sum: f64 = rule.iter().map(|gp| gp.weight).sum();
            assert_relative_eq!(sum, 8.0, epsilon = 1e-14);
        }
    }

    #[test]
    #[should_panic(expected = "gauss_tet: n must be")]
    fn test_gauss_tet_invalid_n() {
        gauss_tet(3);
    }
}
