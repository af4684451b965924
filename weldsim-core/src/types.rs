//! Core data types for FEA operations.
//!
//! This module defines fundamental types used throughout weldsim:
//! - Geometric primitives (points, vectors)
//! - Stress and strain tensors in Voigt notation
//! - The isotropic elastic constitutive matrix

use nalgebra::{Matrix6, Vector3, Vector6};

/// A point in 3D space.
pub type Point3 = Vector3<f64>;

/// A 3D vector (displacement, force, etc.).
pub type Vec3 = Vector3<f64>;

/// Constitutive matrix (material stiffness) in Voigt notation.
///
/// Maps strain tensor to stress tensor: σ = D * ε
pub type ConstitutiveMatrix = Matrix6<f64>;

/// Symmetric stress tensor in Voigt notation.
///
/// Components are ordered as: [σ_xx, σ_yy, σ_zz, τ_xy, τ_yz, τ_xz]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StressTensor(pub Vector6<f64>);

impl StressTensor {
    /// Create a new stress tensor from Voigt components.
    pub fn new(components: [f64; 6]) -> Self {
        Self(Vector6::from_row_slice(&components))
    }

    /// Zero stress state.
    pub fn zero() -> Self {
        Self(Vector6::zeros())
    }

    /// Compute von Mises equivalent stress.
    pub fn von_mises(&self) -> f64 {
        let s = &self.0;
        let term1 = (s[0] - s[1]).powi(2) + (s[1] - s[2]).powi(2) + (s[2] - s[0]).powi(2);
        let term2 = 6.0 * (s[3].powi(2) + s[4].powi(2) + s[5].powi(2));
        ((term1 + term2) / 2.0).sqrt()
    }

    /// Compute hydrostatic (mean) stress.
    pub fn hydrostatic(&self) -> f64 {
        (self.0[0] + self.0[1] + self.0[2]) / 3.0
    }

    /// Deviatoric part s = σ - p I.
    pub fn deviatoric(&self) -> Self {
        let p = self.hydrostatic();
        let mut s = self.0;
        for i in 0..3 {
            s[i] -= p;
        }
        Self(s)
    }

    /// Tensor norm ‖σ‖ = √(σ:σ), counting each shear component twice.
    pub fn norm(&self) -> f64 {
        let s = &self.0;
        (s[0] * s[0] + s[1] * s[1] + s[2] * s[2]
            + 2.0 * (s[3] * s[3] + s[4] * s[4] + s[5] * s[5]))
            .sqrt()
    }

    /// Plain component array.
    pub fn to_array(&self) -> [f64; 6] {
        [self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]]
    }
}

/// Symmetric strain tensor in Voigt notation.
///
/// Components are ordered as: [ε_xx, ε_yy, ε_zz, γ_xy, γ_yz, γ_xz]
/// where γ = 2ε for engineering shear strain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrainTensor(pub Vector6<f64>);

impl StrainTensor {
    /// Create a new strain tensor from Voigt components.
    pub fn new(components: [f64; 6]) -> Self {
        Self(Vector6::from_row_slice(&components))
    }

    /// Zero strain state.
    pub fn zero() -> Self {
        Self(Vector6::zeros())
    }

    /// Isotropic strain with `value` on each normal component.
    pub fn isotropic(value: f64) -> Self {
        Self(Vector6::new(value, value, value, 0.0, 0.0, 0.0))
    }

    /// Compute volumetric strain.
    pub fn volumetric(&self) -> f64 {
        self.0[0] + self.0[1] + self.0[2]
    }

    /// Plain component array.
    pub fn to_array(&self) -> [f64; 6] {
        [self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]]
    }
}

/// 3D constitutive matrix for isotropic linear elasticity.
///
/// Returns the 6x6 matrix D such that σ = D * ε in Voigt notation.
pub fn isotropic_constitutive(youngs_modulus: f64, poissons_ratio: f64) -> ConstitutiveMatrix {
    let e = youngs_modulus;
    let nu = poissons_ratio;

    let factor = e / ((1.0 + nu) * (1.0 - 2.0 * nu));
    let c11 = factor * (1.0 - nu);
    let c12 = factor * nu;
    let c44 = factor * (1.0 - 2.0 * nu) / 2.0; // = G

    Matrix6::new(
        c11, c12, c12, 0.0, 0.0, 0.0,
        c12, c11, c12, 0.0, 0.0, 0.0,
        c12, c12, c11, 0.0, 0.0, 0.0,
        0.0, 0.0, 0.0, c44, 0.0, 0.0,
        0.0, 0.0, 0.0, 0.0, c44, 0.0,
        0.0, 0.0, 0.0, 0.0, 0.0, c44,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_von_mises_uniaxial() {
        // Pure uniaxial tension: σ_xx = 100 MPa
        let stress = StressTensor::new([100.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_relative_eq!(stress.von_mises(), 100.0, epsilon = 1e-10);
    }

    #[test]
    fn test_von_mises_pure_shear() {
        // Pure shear: τ_xy = 100 MPa, von Mises = √3 * τ
        let stress = StressTensor::new([0.0, 0.0, 0.0, 100.0, 0.0, 0.0]);
        assert_relative_eq!(stress.von_mises(), 100.0 * 3.0_f64.sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn test_von_mises_hydrostatic_is_zero() {
        let stress = StressTensor::new([-50.0, -50.0, -50.0, 0.0, 0.0, 0.0]);
        assert_relative_eq!(stress.von_mises(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_deviatoric_norm_matches_von_mises() {
        // q = √(3/2) ‖s‖
        let stress = StressTensor::new([120.0, -30.0, 45.0, 12.0, -8.0, 20.0]);
        let q = (1.5_f64).sqrt() * stress.deviatoric().norm();
        assert_relative_eq!(q, stress.von_mises(), epsilon = 1e-9);
    }

    #[test]
    fn test_hydrostatic_stress() {
        let stress = StressTensor::new([100.0, 200.0, 300.0, 0.0, 0.0, 0.0]);
        assert_relative_eq!(stress.hydrostatic(), 200.0, epsilon = 1e-10);
    }

    #[test]
    fn test_volumetric_strain() {
        let strain = StrainTensor::new([0.001, 0.002, 0.003, 0.0, 0.0, 0.0]);
        assert_relative_eq!(strain.volumetric(), 0.006, epsilon = 1e-15);
    }

    #[test]
    fn test_constitutive_symmetry() {
        let d = isotropic_constitutive(200e9, 0.3);
        for i in 0..6 {
            for j in 0..6 {
                assert_relative_eq!(d[(i, j)], d[(j, i)], epsilon = 1e-10);
            }
        }
        // Shear diagonal equals G
        assert_relative_eq!(d[(3, 3)], 200e9 / 2.6, max_relative = 1e-12);
    }
}
