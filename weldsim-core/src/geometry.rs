//! Precomputed element geometry.
//!
//! Shape functions, physical gradients and integration weights depend only on
//! the mesh, so they are evaluated once per run and shared by the thermal and
//! mechanical solvers. Boundary face areas are lumped to nodes for the
//! convection and radiation terms.

use crate::element::{create_element, physical_gradients, MAX_NODES};
use crate::error::Result;
use crate::mesh::Mesh;
use crate::types::Point3;
use nalgebra::Vector3;

/// One integration point mapped to physical space.
#[derive(Debug, Clone, Copy)]
pub struct IntegrationPoint {
    /// Shape function values.
    pub shape: [f64; MAX_NODES],
    /// Physical shape function gradients.
    pub gradients: [Vector3<f64>; MAX_NODES],
    /// Quadrature weight times |det J|.
    pub weight: f64,
    /// Physical position.
    pub position: Point3,
}

impl IntegrationPoint {
    /// Interpolate a nodal field given the element's nodal values.
    #[inline]
    pub fn interpolate(&self, nodal: &[f64]) -> f64 {
        nodal.iter().zip(self.shape.iter()).map(|(v, n)| v * n).sum()
    }
}

/// Integration data for every element of a mesh.
#[derive(Debug, Clone)]
pub struct MeshGeometry {
    stiffness_offsets: Vec<usize>,
    stiffness_points: Vec<IntegrationPoint>,
    capacity_offsets: Vec<usize>,
    capacity_points: Vec<IntegrationPoint>,
    volumes: Vec<f64>,
    boundary_areas: Vec<f64>,
}

impl MeshGeometry {
    /// Evaluate both quadrature rules on every element and lump boundary areas.
    pub fn build(mesh: &Mesh) -> Result<Self> {
        let mut stiffness_offsets = Vec::with_capacity(mesh.n_elements() + 1);
        let mut capacity_offsets = Vec::with_capacity(mesh.n_elements() + 1);
        let mut stiffness_points = Vec::new();
        let mut capacity_points = Vec::new();
        let mut volumes = Vec::with_capacity(mesh.n_elements());
        stiffness_offsets.push(0);
        capacity_offsets.push(0);

        for (elem_idx, connectivity) in mesh.elements().iter().enumerate() {
            let element = create_element(connectivity.element_type);
            let coords: Vec<Point3> = connectivity
                .nodes
                .iter()
                .map(|&i| mesh.nodes()[i])
                .collect();
            let n = element.n_nodes();

            let map = |gp: &crate::element::GaussPoint| -> Result<IntegrationPoint> {
                let pg = physical_gradients(element.as_ref(), &coords, gp)?;
                let shape = element.shape_functions(gp);
                let mut position = Point3::zeros();
                for i in 0..n {
                    position += coords[i] * shape[i];
                }
                Ok(IntegrationPoint {
                    shape,
                    gradients: pg.gradients,
                    weight: gp.weight * pg.det_j.abs(),
                    position,
                })
            };

            for gp in element.integration_points() {
                stiffness_points.push(map(&gp)?);
            }
            let mut volume = 0.0;
            for gp in element.capacity_points() {
                let ip = map(&gp)?;
                volume += ip.weight;
                capacity_points.push(ip);
            }
            log::trace!("element {} volume {:.6e}", elem_idx, volume);

            volumes.push(volume);
            stiffness_offsets.push(stiffness_points.len());
            capacity_offsets.push(capacity_points.len());
        }

        let mut boundary_areas = vec![0.0; mesh.n_nodes()];
        for face in mesh.boundary_faces() {
            let share = face.area / face.nodes.len() as f64;
            for &node in &face.nodes {
                boundary_areas[node] += share;
            }
        }

        Ok(Self {
            stiffness_offsets,
            stiffness_points,
            capacity_offsets,
            capacity_points,
            volumes,
            boundary_areas,
        })
    }

    /// Points used for conductivity, stiffness and stress.
    pub fn stiffness_points(&self, elem: usize) -> &[IntegrationPoint] {
        &self.stiffness_points[self.stiffness_offsets[elem]..self.stiffness_offsets[elem + 1]]
    }

    /// Points used for capacity and source loads.
    pub fn capacity_points(&self, elem: usize) -> &[IntegrationPoint] {
        &self.capacity_points[self.capacity_offsets[elem]..self.capacity_offsets[elem + 1]]
    }

    /// Offset of an element's first stiffness point in a flat per-point array.
    pub fn point_offset(&self, elem: usize) -> usize {
        self.stiffness_offsets[elem]
    }

    /// Per-element offsets into the flat stiffness-point array (length n_elements + 1).
    pub fn point_offsets(&self) -> &[usize] {
        &self.stiffness_offsets
    }

    /// Total number of stiffness points.
    pub fn n_points(&self) -> usize {
        self.stiffness_points.len()
    }

    /// Element volume.
    pub fn volume(&self, elem: usize) -> f64 {
        self.volumes[elem]
    }

    /// Sum of element volumes.
    pub fn total_volume(&self) -> f64 {
        self.volumes.iter().sum()
    }

    /// Boundary area lumped to each node (zero for interior nodes).
    pub fn boundary_areas(&self) -> &[f64] {
        &self.boundary_areas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ElementType;
    use approx::assert_relative_eq;

    #[test]
    fn test_geometry_of_structured_box() {
        for element_type in [ElementType::Hex8, ElementType::Tet4] {
            let mesh = Mesh::structured_box(
                Point3::zeros(),
                [0.2, 0.1, 0.05],
                [4, 2, 2],
                element_type,
                0,
            )
            .unwrap();
            let geometry = MeshGeometry::build(&mesh).unwrap();

            assert_relative_eq!(geometry.total_volume(), 0.2 * 0.1 * 0.05, max_relative = 1e-12);

            let area: f64 = geometry.boundary_areas().iter().sum();
            let expected = 2.0 * (0.2 * 0.1 + 0.2 * 0.05 + 0.1 * 0.05);
            assert_relative_eq!(area, expected, max_relative = 1e-12);

            // Interior node of a 4x2x2 grid: (i, j, k) = (1, 1, 1)
            let interior = 1 + 5 * (1 + 3);
            assert_eq!(geometry.boundary_areas()[interior], 0.0);
        }
    }

    #[test]
    fn test_point_offsets() {
        let mesh =
            Mesh::structured_box(Point3::zeros(), [1.0; 3], [2, 1, 1], ElementType::Hex8, 0).unwrap();
        let geometry = MeshGeometry::build(&mesh).unwrap();
        assert_eq!(geometry.n_points(), 16);
        assert_eq!(geometry.point_offset(1), 8);
        assert_eq!(geometry.stiffness_points(1).len(), 8);
        assert_eq!(geometry.capacity_points(0).len(), 8);
    }

    #[test]
    fn test_interpolation_reproduces_linear_field() {
        let mesh =
            Mesh::structured_box(Point3::zeros(), [1.0; 3], [1, 1, 1], ElementType::Tet4, 0).unwrap();
        let geometry = MeshGeometry::build(&mesh).unwrap();
        for e in 0..mesh.n_elements() {
            let nodal: Vec<f64> = mesh.elements()[e]
                .nodes
                .iter()
                .map(|&i| 2.0 * mesh.nodes()[i][0] + mesh.nodes()[i][2])
                .collect();
            for ip in geometry.capacity_points(e) {
                let expected = 2.0 * ip.position[0] + ip.position[2];
                assert_relative_eq!(ip.interpolate(&nodal), expected, epsilon = 1e-12);
            }
        }
    }
}
