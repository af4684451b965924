//! Mesh data structure for FEA.
//!
//! Stores nodal coordinates and element connectivity. The mesh is produced by an
//! external mesh generator; [`Mesh::validate`] is the pre-solve gate that rejects
//! degenerate, inverted or disconnected input before any matrix is assembled.

use crate::element::{create_element, physical_gradients};
use crate::error::{Error, Result};
use crate::material::MaterialId;
use crate::types::Point3;
use std::collections::HashMap;

/// Element connectivity - node indices for an element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementConnectivity {
    /// Element type identifier.
    pub element_type: ElementType,
    /// Node indices (0-based).
    pub nodes: Vec<usize>,
    /// Element tag, used as the material id.
    pub tag: MaterialId,
}

/// Supported element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// 4-node tetrahedron (linear).
    Tet4,
    /// 8-node hexahedron (trilinear).
    Hex8,
}

impl ElementType {
    /// Number of nodes for this element type.
    pub fn n_nodes(self) -> usize {
        match self {
            ElementType::Tet4 => 4,
            ElementType::Hex8 => 8,
        }
    }
}

/// An element face that belongs to exactly one element.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFace {
    /// Owning element.
    pub element: usize,
    /// Global node indices of the face.
    pub nodes: Vec<usize>,
    /// Face area.
    pub area: f64,
}

/// Finite element mesh.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Nodal coordinates.
    nodes: Vec<Point3>,
    /// Element connectivity.
    elements: Vec<ElementConnectivity>,
}

impl Mesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            elements: Vec::new(),
        }
    }

    /// Create a mesh with pre-allocated capacity.
    pub fn with_capacity(n_nodes: usize, n_elements: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(n_nodes),
            elements: Vec::with_capacity(n_elements),
        }
    }

    /// Add a node to the mesh, returning its index.
    pub fn add_node(&mut self, point: Point3) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(point);
        idx
    }

    /// Add an element to the mesh with the given tag.
    pub fn add_element(
        &mut self,
        element_type: ElementType,
        nodes: Vec<usize>,
        tag: MaterialId,
    ) -> Result<usize> {
        if nodes.len() != element_type.n_nodes() {
            return Err(Error::InvalidMesh(format!(
                "Element type {:?} requires {} nodes, got {}",
                element_type,
                element_type.n_nodes(),
                nodes.len()
            )));
        }

        for &node_idx in &nodes {
            if node_idx >= self.nodes.len() {
                return Err(Error::InvalidMesh(format!(
                    "Node index {} out of bounds (mesh has {} nodes)",
                    node_idx,
                    self.nodes.len()
                )));
            }
        }

        let idx = self.elements.len();
        self.elements.push(ElementConnectivity {
            element_type,
            nodes,
            tag,
        });
        Ok(idx)
    }

    /// Number of nodes in the mesh.
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of elements in the mesh.
    pub fn n_elements(&self) -> usize {
        self.elements.len()
    }

    /// Get nodal coordinates.
    pub fn nodes(&self) -> &[Point3] {
        &self.nodes
    }

    /// Get a specific node's coordinates.
    pub fn node(&self, idx: usize) -> Option<&Point3> {
        self.nodes.get(idx)
    }

    /// Get element connectivity.
    pub fn elements(&self) -> &[ElementConnectivity] {
        &self.elements
    }

    /// Get a specific element's connectivity.
    pub fn element(&self, idx: usize) -> Option<&ElementConnectivity> {
        self.elements.get(idx)
    }

    /// Get coordinates for an element's nodes.
    pub fn element_coords(&self, elem_idx: usize) -> Option<Vec<Point3>> {
        let elem = self.elements.get(elem_idx)?;
        Some(elem.nodes.iter().map(|&i| self.nodes[i]).collect())
    }

    /// Compute mesh bounding box.
    pub fn bounds(&self) -> Option<(Point3, Point3)> {
        if self.nodes.is_empty() {
            return None;
        }

        let mut min = self.nodes[0];
        let mut max = self.nodes[0];

        for node in &self.nodes[1..] {
            for i in 0..3 {
                min[i] = min[i].min(node[i]);
                max[i] = max[i].max(node[i]);
            }
        }

        Some((min, max))
    }

    /// Indices of nodes inside the axis-aligned box `[min, max]` (inclusive, with tolerance).
    pub fn nodes_in_region(&self, min: &Point3, max: &Point3, tolerance: f64) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                (0..3).all(|i| p[i] >= min[i] - tolerance && p[i] <= max[i] + tolerance)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Sorted, de-duplicated node neighbourhoods (each node includes itself).
    pub fn node_neighbours(&self) -> Vec<Vec<usize>> {
        let mut neighbours: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for elem in &self.elements {
            for &a in &elem.nodes {
                neighbours[a].extend_from_slice(&elem.nodes);
            }
        }
        for list in &mut neighbours {
            list.sort_unstable();
            list.dedup();
        }
        neighbours
    }

    /// Element faces not shared with any other element, in element order.
    pub fn boundary_faces(&self) -> Vec<BoundaryFace> {
        let mut counts: HashMap<Vec<usize>, usize> = HashMap::new();
        for elem in &self.elements {
            let element = create_element(elem.element_type);
            for face in element.faces() {
                let mut key: Vec<usize> = face.iter().map(|&l| elem.nodes[l]).collect();
                key.sort_unstable();
                *counts.entry(key).or_insert(0) += 1;
            }
        }

        let mut faces = Vec::new();
        for (elem_idx, elem) in self.elements.iter().enumerate() {
            let element = create_element(elem.element_type);
            for face in element.faces() {
                let nodes: Vec<usize> = face.iter().map(|&l| elem.nodes[l]).collect();
                let mut key = nodes.clone();
                key.sort_unstable();
                if counts.get(&key) == Some(&1) {
                    let area = self.face_area(&nodes);
                    faces.push(BoundaryFace {
                        element: elem_idx,
                        nodes,
                        area,
                    });
                }
            }
        }
        faces
    }

    /// Area of a triangular or (planar) quadrilateral face.
    fn face_area(&self, nodes: &[usize]) -> f64 {
        let p = |i: usize| self.nodes[nodes[i]];
        match nodes.len() {
            3 => 0.5 * (p(1) - p(0)).cross(&(p(2) - p(0))).norm(),
            // Half the cross product of the diagonals
            4 => 0.5 * (p(2) - p(0)).cross(&(p(3) - p(1))).norm(),
            _ => 0.0,
        }
    }

    /// Pre-solve validation.
    ///
    /// Rejects empty meshes, non-finite coordinates, repeated nodes within an
    /// element, nodes not referenced by any element, disconnected element groups
    /// and degenerate or inverted elements.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() || self.elements.is_empty() {
            return Err(Error::InvalidMesh("mesh has no nodes or no elements".into()));
        }

        if let Some(i) = self.nodes.iter().position(|p| !p.iter().all(|c| c.is_finite())) {
            return Err(Error::InvalidMesh(format!("node {} has non-finite coordinates", i)));
        }

        let mut referenced = vec![false; self.nodes.len()];
        for (elem_idx, elem) in self.elements.iter().enumerate() {
            if elem.nodes.len() != elem.element_type.n_nodes() {
                return Err(Error::InvalidMesh(format!(
                    "element {} has {} nodes, {:?} requires {}",
                    elem_idx,
                    elem.nodes.len(),
                    elem.element_type,
                    elem.element_type.n_nodes()
                )));
            }
            let mut sorted = elem.nodes.clone();
            sorted.sort_unstable();
            if sorted.windows(2).any(|w| w[0] == w[1]) {
                return Err(Error::InvalidMesh(format!(
                    "element {} references the same node twice",
                    elem_idx
                )));
            }
            for &n in &elem.nodes {
                match referenced.get_mut(n) {
                    Some(flag) => *flag = true,
                    None => {
                        return Err(Error::InvalidMesh(format!(
                            "element {} references missing node {}",
                            elem_idx, n
                        )))
                    }
                }
            }
        }

        if let Some(orphan) = referenced.iter().position(|&r| !r) {
            return Err(Error::InvalidMesh(format!(
                "node {} is not connected to any element",
                orphan
            )));
        }

        let components = self.connected_components();
        if components > 1 {
            return Err(Error::InvalidMesh(format!(
                "mesh consists of {} disconnected parts",
                components
            )));
        }

        for elem_idx in 0..self.elements.len() {
            self.check_jacobians(elem_idx)?;
        }

        Ok(())
    }

    /// Number of element groups connected through shared nodes.
    fn connected_components(&self) -> usize {
        let mut parent: Vec<usize> = (0..self.nodes.len()).collect();

        fn find(parent: &mut [usize], mut x: usize) -> usize {
            while parent[x] != x {
                parent[x] = parent[parent[x]];
                x = parent[x];
            }
            x
        }

        for elem in &self.elements {
            let first = elem.nodes[0];
            for &other in &elem.nodes[1..] {
                let (a, b) = (find(&mut parent, first), find(&mut parent, other));
                if a != b {
                    parent[a] = b;
                }
            }
        }

        (0..self.nodes.len())
            .filter(|&i| find(&mut parent, i) == i)
            .count()
    }

    /// Jacobians must be non-vanishing and of one sign inside each element.
    fn check_jacobians(&self, elem_idx: usize) -> Result<()> {
        let connectivity = &self.elements[elem_idx];
        let element = create_element(connectivity.element_type);
        let coords: Vec<Point3> = connectivity.nodes.iter().map(|&i| self.nodes[i]).collect();

        let mut size: f64 = 0.0;
        for a in &coords {
            for b in &coords {
                size = size.max((a - b).norm());
            }
        }
        let threshold = 1e-10 * size.powi(3);

        let mut sign = 0.0;
        for gp in element
            .integration_points()
            .iter()
            .chain(element.capacity_points().iter())
        {
            let det_j = physical_gradients(element.as_ref(), &coords, gp)
                .map(|g| g.det_j)
                .unwrap_or(0.0);
            if det_j.abs() <= threshold {
                return Err(Error::InvalidMesh(format!(
                    "element {} is degenerate (|det J| = {:.3e})",
                    elem_idx,
                    det_j.abs()
                )));
            }
            if sign == 0.0 {
                sign = det_j.signum();
            } else if det_j.signum() != sign {
                return Err(Error::InvalidMesh(format!(
                    "element {} is inverted (Jacobian changes sign)",
                    elem_idx
                )));
            }
        }
        Ok(())
    }

    /// Structured grid of a box with `divisions` cells per axis.
    ///
    /// Hex8 produces one brick per cell; Tet4 splits every cell into six
    /// tetrahedra sharing the cell's main diagonal. Intended for tests and
    /// benchmark scenarios, not as a general mesher.
    pub fn structured_box(
        origin: Point3,
        size: [f64; 3],
        divisions: [usize; 3],
        element_type: ElementType,
        tag: MaterialId,
    ) -> Result<Self> {
        let [nx, ny, nz] = divisions;
        if nx == 0 || ny == 0 || nz == 0 || size.iter().any(|&s| s <= 0.0) {
            return Err(Error::InvalidMesh(
                "structured box needs positive size and divisions".into(),
            ));
        }

        let n_cells = nx * ny * nz;
        let per_cell = match element_type {
            ElementType::Hex8 => 1,
            ElementType::Tet4 => 6,
        };
        let mut mesh = Mesh::with_capacity((nx + 1) * (ny + 1) * (nz + 1), n_cells * per_cell);

        for k in 0..=nz {
            for j in 0..=ny {
                for i in 0..=nx {
                    mesh.add_node(Point3::new(
                        origin[0] + size[0] * i as f64 / nx as f64,
                        origin[1] + size[1] * j as f64 / ny as f64,
                        origin[2] + size[2] * k as f64 / nz as f64,
                    ));
                }
            }
        }

        let id = |i: usize, j: usize, k: usize| i + (nx + 1) * (j + (ny + 1) * k);

        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let v = [
                        id(i, j, k),
                        id(i + 1, j, k),
                        id(i + 1, j + 1, k),
                        id(i, j + 1, k),
                        id(i, j, k + 1),
                        id(i + 1, j, k + 1),
                        id(i + 1, j + 1, k + 1),
                        id(i, j + 1, k + 1),
                    ];
                    match element_type {
                        ElementType::Hex8 => {
                            mesh.add_element(ElementType::Hex8, v.to_vec(), tag)?;
                        }
                        ElementType::Tet4 => {
                            // Kuhn split along the v0-v6 diagonal
                            const TETS: [[usize; 4]; 6] = [
                                [0, 1, 2, 6],
                                [0, 2, 3, 6],
                                [0, 3, 7, 6],
                                [0, 7, 4, 6],
                                [0, 4, 5, 6],
                                [0, 5, 1, 6],
                            ];
                            for tet in TETS {
                                let mut nodes: Vec<usize> = tet.iter().map(|&l| v[l]).collect();
                                let p = |n: usize| mesh.nodes[n];
                                let signed = (p(nodes[1]) - p(nodes[0]))
                                    .dot(&(p(nodes[2]) - p(nodes[0])).cross(&(p(nodes[3]) - p(nodes[0]))));
                                if signed < 0.0 {
                                    nodes.swap(1, 2);
                                }
                                mesh.add_element(ElementType::Tet4, nodes, tag)?;
                            }
                        }
                    }
                }
            }
        }

        Ok(mesh)
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}
