//! 4-node tetrahedron (Tet4) element.
//!
//! - 4 nodes at vertices
//! - Linear shape functions, constant gradients
//! - Single integration point for stiffness and conductivity
//! - 4-point rule for capacity and source loads
//!
//! # Shape Functions
//!
//! Barycentric coordinates (L1, L2, L3, L4): N_i = L_i. The natural
//! coordinates are (ξ, η, ζ) = (L2, L3, L4), so node 0 sits at the origin.

use crate::element::gauss::{gauss_tet, GaussPoint};
use crate::element::{Element, MAX_NODES};
use crate::mesh::ElementType;
use nalgebra::Vector3;

const FACES: [&[usize]; 4] = [&[0, 2, 1], &[0, 1, 3], &[1, 2, 3], &[0, 3, 2]];

/// 4-node tetrahedral element (constant gradient tetrahedron).
#[derive(Debug, Clone, Copy, Default)]
pub struct Tet4;

impl Tet4 {
    /// Create a new Tet4 element.
    pub fn new() -> Self {
        Self
    }
}

impl Element for Tet4 {
    fn element_type(&self) -> ElementType {
        ElementType::Tet4
    }

    fn n_nodes(&self) -> usize {
        4
    }

    fn shape_functions(&self, gp: &GaussPoint) -> [f64; MAX_NODES] {
        let mut n = [0.0; MAX_NODES];
        n[..4].copy_from_slice(&gp.coords);
        n
    }

    fn natural_derivatives(&self, _gp: &GaussPoint) -> [Vector3<f64>; MAX_NODES] {
        let mut d = [Vector3::zeros(); MAX_NODES];
        d[0] = Vector3::new(-1.0, -1.0, -1.0);
        d[1] = Vector3::new(1.0, 0.0, 0.0);
        d[2] = Vector3::new(0.0, 1.0, 0.0);
        d[3] = Vector3::new(0.0, 0.0, 1.0);
        d
    }

    fn integration_points(&self) -> Vec<GaussPoint> {
        gauss_tet(1)
    }

    fn capacity_points(&self) -> Vec<GaussPoint> {
        gauss_tet(4)
    }

    fn faces(&self) -> &'static [&'static [usize]] {
        &FACES
    }
}
