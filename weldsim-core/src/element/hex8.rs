//! 8-node hexahedron (Hex8) element.
//!
//! - 8 nodes at vertices of a hexahedron
//! - Trilinear shape functions
//! - 2×2×2 Gauss integration (8 points) for every matrix
//!
//! # Shape Functions
//!
//! Trilinear shape functions in natural coordinates (ξ, η, ζ) ∈ [-1, 1]³:
//! ```text
//! N_i = (1 + ξ_i*ξ)(1 + η_i*η)(1 + ζ_i*ζ) / 8
//! ```
//! where (ξ_i, η_i, ζ_i) are ±1 for node i.
//!
//! # Node Numbering
//!
//! ```text
//!        7-------6
//!       /|      /|
//!      / |     / |
//!     4-------5  |
//!     |  3----|--2
//!     | /     | /
//!     |/      |/
//!     0-------1
//! ```

use crate::element::gauss::{gauss_hex, GaussPoint};
use crate::element::{Element, MAX_NODES};
use crate::mesh::ElementType;
use nalgebra::Vector3;

/// Natural coordinates for each of the 8 nodes.
/// Node i has natural coordinates (XI[i], ETA[i], ZETA[i]).
const XI: [f64; 8] = [-1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0];
const ETA: [f64; 8] = [-1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0];
const ZETA: [f64; 8] = [-1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0];

const FACES: [&[usize]; 6] = [
    &[0, 3, 2, 1],
    &[4, 5, 6, 7],
    &[0, 1, 5, 4],
    &[1, 2, 6, 5],
    &[2, 3, 7, 6],
    &[3, 0, 4, 7],
];

/// 8-node hexahedral element (trilinear brick).
#[derive(Debug, Clone, Copy, Default)]
pub struct Hex8;

impl Hex8 {
    /// Create a new Hex8 element.
    pub fn new() -> Self {
        Self
    }
}

impl Element for Hex8 {
    fn element_type(&self) -> ElementType {
        ElementType::Hex8
    }

    fn n_nodes(&self) -> usize {
        8
    }

    fn shape_functions(&self, gp: &GaussPoint) -> [f64; MAX_NODES] {
        let (xi, eta, zeta) = (gp.xi(), gp.eta(), gp.zeta());
        let mut n = [0.0; MAX_NODES];
        for i in 0..8 {
            n[i] = 0.125 * (1.0 + XI[i] * xi) * (1.0 + ETA[i] * eta) * (1.0 + ZETA[i] * zeta);
        }
        n
    }

    fn natural_derivatives(&self, gp: &GaussPoint) -> [Vector3<f64>; MAX_NODES] {
        let (xi, eta, zeta) = (gp.xi(), gp.eta(), gp.zeta());
        let mut d = [Vector3::zeros(); MAX_NODES];
        for i in 0..8 {
            d[i] = Vector3::new(
                0.125 * XI[i] * (1.0 + ETA[i] * eta) * (1.0 + ZETA[i] * zeta),
                0.125 * (1.0 + XI[i] * xi) * ETA[i] * (1.0 + ZETA[i] * zeta),
                0.125 * (1.0 + XI[i] * xi) * (1.0 + ETA[i] * eta) * ZETA[i],
            );
        }
        d
    }

    fn integration_points(&self) -> Vec<GaussPoint> {
        gauss_hex(2)
    }

    fn capacity_points(&self) -> Vec<GaussPoint> {
        gauss_hex(2)
    }

    fn faces(&self) -> &'static [&'static [usize]] {
        &FACES
    }
}
