//! Element trait and implementations.
//!
//! The Element trait describes the reference-element data (shape functions,
//! natural derivatives, quadrature rules and faces) so that thermal and
//! mechanical assembly can work with any element type uniformly. Mapping to
//! physical space is done once per integration point by [`physical_gradients`].
//!
//! # Submodules
//!
//! - [`gauss`] - Gauss quadrature rules for numerical integration
//! - [`tet4`] - Linear tetrahedron
//! - [`hex8`] - Trilinear hexahedron

use crate::error::{Error, Result};
use crate::mesh::ElementType;
use crate::types::Point3;
use nalgebra::{DMatrix, Matrix3, Vector3};

pub mod gauss;
pub mod hex8;
pub mod tet4;

pub use gauss::{gauss_1d, gauss_hex, gauss_tet, GaussPoint};
pub use hex8::Hex8;
pub use tet4::Tet4;

/// Largest node count of any supported element.
pub const MAX_NODES: usize = 8;

/// Finite element interface.
///
/// Elements must be thread-safe (Send + Sync) to enable parallel assembly.
/// Arrays sized [`MAX_NODES`] are only meaningful up to [`Element::n_nodes`].
pub trait Element: Send + Sync {
    /// Element type tag.
    fn element_type(&self) -> ElementType;

    /// Number of nodes in this element.
    fn n_nodes(&self) -> usize;

    /// Shape function values at a reference point.
    fn shape_functions(&self, gp: &GaussPoint) -> [f64; MAX_NODES];

    /// Shape function derivatives with respect to (ξ, η, ζ).
    fn natural_derivatives(&self, gp: &GaussPoint) -> [Vector3<f64>; MAX_NODES];

    /// Quadrature rule for stiffness, conductivity and stress evaluation.
    fn integration_points(&self) -> Vec<GaussPoint>;

    /// Quadrature rule exact for products of shape functions (capacity and
    /// source loads).
    fn capacity_points(&self) -> Vec<GaussPoint>;

    /// Local node indices of each face, ordered counter-clockwise seen from outside.
    fn faces(&self) -> &'static [&'static [usize]];

    /// Compute element volume.
    fn volume(&self, coords: &[Point3]) -> Result<f64> {
        let mut volume = 0.0;
        for gp in self.capacity_points() {
            volume += gp.weight * physical_gradients(self, coords, &gp)?.det_j.abs();
        }
        Ok(volume)
    }
}

/// Physical shape-function gradients at one integration point.
#[derive(Debug, Clone, Copy)]
pub struct PointGradients {
    /// dN_i/dx for each node.
    pub gradients: [Vector3<f64>; MAX_NODES],
    /// Jacobian determinant (signed).
    pub det_j: f64,
}

/// Map natural derivatives to physical space at `gp`.
///
/// The Jacobian is
/// ```text
/// J = [∂x/∂ξ  ∂y/∂ξ  ∂z/∂ξ]
///     [∂x/∂η  ∂y/∂η  ∂z/∂η]
///     [∂x/∂ζ  ∂y/∂ζ  ∂z/∂ζ]
/// ```
/// and dN/dx = J⁻¹ · dN/dξ. A singular Jacobian is reported as
/// [`Error::InvalidMesh`].
pub fn physical_gradients<E: Element + ?Sized>(
    element: &E,
    coords: &[Point3],
    gp: &GaussPoint,
) -> Result<PointGradients> {
    let n = element.n_nodes();
    if coords.len() != n {
        return Err(Error::InvalidMesh(format!(
            "{:?} requires {} nodal coordinates, got {}",
            element.element_type(),
            n,
            coords.len()
        )));
    }

    let natural = element.natural_derivatives(gp);
    let mut j = Matrix3::zeros();
    for i in 0..n {
        for k in 0..3 {
            for c in 0..3 {
                j[(k, c)] += natural[i][k] * coords[i][c];
            }
        }
    }

    let det_j = j.determinant();
    let j_inv = j
        .try_inverse()
        .ok_or_else(|| Error::InvalidMesh("singular element Jacobian".into()))?;

    let mut gradients = [Vector3::zeros(); MAX_NODES];
    for i in 0..n {
        gradients[i] = j_inv * natural[i];
    }

    Ok(PointGradients { gradients, det_j })
}

/// Strain-displacement matrix (6 × 3n) from physical gradients.
///
/// ε = [ε_xx, ε_yy, ε_zz, γ_xy, γ_yz, γ_xz]ᵀ = B · u with nodal blocks [u_i, v_i, w_i].
pub fn strain_displacement(gradients: &[Vector3<f64>]) -> DMatrix<f64> {
    let n = gradients.len();
    let mut b = DMatrix::zeros(6, 3 * n);

    for (i, g) in gradients.iter().enumerate() {
        let col = i * 3;
        let (dx, dy, dz) = (g[0], g[1], g[2]);

        // ε_xx = ∂u/∂x
        b[(0, col)] = dx;
        // ε_yy = ∂v/∂y
        b[(1, col + 1)] = dy;
        // ε_zz = ∂w/∂z
        b[(2, col + 2)] = dz;
        // γ_xy = ∂u/∂y + ∂v/∂x
        b[(3, col)] = dy;
        b[(3, col + 1)] = dx;
        // γ_yz = ∂v/∂z + ∂w/∂y
        b[(4, col + 1)] = dz;
        b[(4, col + 2)] = dy;
        // γ_xz = ∂u/∂z + ∂w/∂x
        b[(5, col)] = dz;
        b[(5, col + 2)] = dx;
    }

    b
}

/// Create the reference element for a mesh element type.
pub fn create_element(element_type: ElementType) -> Box<dyn Element> {
    match element_type {
        ElementType::Tet4 => Box::new(Tet4::new()),
        ElementType::Hex8 => Box::new(Hex8::new()),
    }
}
