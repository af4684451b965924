//! Sparse matrix storage and cached sparsity patterns.
//!
//! Uses CSR (Compressed Sparse Row) format for matrix-vector products and for
//! handing systems to the direct solver. The pattern of a mesh never changes
//! during a run, so it is computed once ([`DofPattern`]) together with the
//! position of every element-matrix entry inside the CSR value array. Assembly
//! then writes straight into a value buffer without any index search.

use crate::error::{Error, Result};
use crate::mesh::Mesh;
use nalgebra_sparse::csr::CsrMatrix as NalgebraCsr;
use std::ops::AddAssign;

/// Compressed Sparse Row matrix.
pub type CsrMatrix = NalgebraCsr<f64>;

/// Dense vector accumulated during assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseVector {
    values: Vec<f64>,
}

impl SparseVector {
    /// Create a zero vector of given size.
    pub fn zeros(size: usize) -> Self {
        Self {
            values: vec![0.0; size],
        }
    }

    /// Add a value at the given index.
    pub fn add(&mut self, index: usize, value: f64) {
        self.values[index] += value;
    }

    /// Add values at multiple indices (for element load assembly).
    pub fn add_subvector(&mut self, indices: &[usize], values: &[f64]) {
        debug_assert_eq!(indices.len(), values.len());
        for (&idx, &val) in indices.iter().zip(values.iter()) {
            self.values[idx] += val;
        }
    }

    /// Reset every entry to zero, keeping the allocation.
    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Get the underlying dense vector.
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    /// Consume and return the dense vector.
    pub fn into_vec(self) -> Vec<f64> {
        self.values
    }
}

impl AddAssign<&SparseVector> for SparseVector {
    fn add_assign(&mut self, rhs: &SparseVector) {
        debug_assert_eq!(self.values.len(), rhs.values.len());
        for (a, b) in self.values.iter_mut().zip(rhs.values.iter()) {
            *a += *b;
        }
    }
}

/// Global DOF indices of an element, node-major: [n0·d .. n0·d+d, n1·d ..].
pub fn element_dofs(nodes: &[usize], dofs_per_node: usize) -> Vec<usize> {
    nodes
        .iter()
        .flat_map(|&node| (0..dofs_per_node).map(move |d| node * dofs_per_node + d))
        .collect()
}

/// Square sparsity pattern of a mesh with a fixed number of DOFs per node.
#[derive(Debug, Clone)]
pub struct DofPattern {
    n_dofs: usize,
    dofs_per_node: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    /// Start of each element's block in `positions`.
    element_offsets: Vec<usize>,
    /// Row-major value positions of every element-matrix entry.
    positions: Vec<usize>,
    diagonal: Vec<usize>,
}

impl DofPattern {
    /// Build the pattern from node adjacency.
    pub fn build(mesh: &Mesh, dofs_per_node: usize) -> Result<Self> {
        if dofs_per_node == 0 {
            return Err(Error::Solver("pattern needs at least one DOF per node".into()));
        }
        let neighbours = mesh.node_neighbours();
        let n_dofs = mesh.n_nodes() * dofs_per_node;

        let mut row_offsets = Vec::with_capacity(n_dofs + 1);
        let mut col_indices = Vec::new();
        row_offsets.push(0);
        for list in &neighbours {
            for _ in 0..dofs_per_node {
                for &b in list {
                    col_indices.extend((0..dofs_per_node).map(|d| b * dofs_per_node + d));
                }
                row_offsets.push(col_indices.len());
            }
        }

        let find = |row: usize, col: usize| -> Result<usize> {
            let (start, end) = (row_offsets[row], row_offsets[row + 1]);
            col_indices[start..end]
                .binary_search(&col)
                .map(|k| start + k)
                .map_err(|_| Error::Solver(format!("entry ({}, {}) missing from pattern", row, col)))
        };

        let mut diagonal = Vec::with_capacity(n_dofs);
        for dof in 0..n_dofs {
            diagonal.push(find(dof, dof)?);
        }

        let mut element_offsets = Vec::with_capacity(mesh.n_elements() + 1);
        let mut positions = Vec::new();
        element_offsets.push(0);
        for elem in mesh.elements() {
            let dofs = element_dofs(&elem.nodes, dofs_per_node);
            for &r in &dofs {
                for &c in &dofs {
                    positions.push(find(r, c)?);
                }
            }
            element_offsets.push(positions.len());
        }

        Ok(Self {
            n_dofs,
            dofs_per_node,
            row_offsets,
            col_indices,
            element_offsets,
            positions,
            diagonal,
        })
    }

    /// Number of rows (and columns).
    pub fn n_dofs(&self) -> usize {
        self.n_dofs
    }

    /// DOFs per node.
    pub fn dofs_per_node(&self) -> usize {
        self.dofs_per_node
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.col_indices.len()
    }

    /// Value positions of an element matrix, row-major over [`element_dofs`].
    pub fn element_positions(&self, elem: usize) -> &[usize] {
        &self.positions[self.element_offsets[elem]..self.element_offsets[elem + 1]]
    }

    /// Value position of a diagonal entry.
    pub fn diagonal_position(&self, dof: usize) -> usize {
        self.diagonal[dof]
    }

    /// Wrap a value array in a CSR matrix with this pattern.
    pub fn to_csr(&self, values: Vec<f64>) -> Result<CsrMatrix> {
        if values.len() != self.nnz() {
            return Err(Error::Solver(format!(
                "value array has {} entries, pattern has {}",
                values.len(),
                self.nnz()
            )));
        }
        CsrMatrix::try_from_csr_data(
            self.n_dofs,
            self.n_dofs,
            self.row_offsets.clone(),
            self.col_indices.clone(),
            values,
        )
        .map_err(|e| Error::Solver(format!("invalid CSR data: {}", e)))
    }

    /// y = A·x for values laid out on this pattern.
    pub fn multiply(&self, values: &[f64], x: &[f64]) -> Vec<f64> {
        (0..self.n_dofs)
            .map(|row| {
                (self.row_offsets[row]..self.row_offsets[row + 1])
                    .map(|k| values[k] * x[self.col_indices[k]])
                    .sum()
            })
            .collect()
    }

    /// Pattern restricted to the DOFs flagged free.
    pub fn restrict(&self, free: &[bool]) -> Result<RestrictedPattern> {
        if free.len() != self.n_dofs {
            return Err(Error::Solver(format!(
                "free mask has {} entries, pattern has {} DOFs",
                free.len(),
                self.n_dofs
            )));
        }

        let mut global_to_reduced = vec![None; self.n_dofs];
        let mut free_dofs = Vec::new();
        for (dof, &is_free) in free.iter().enumerate() {
            if is_free {
                global_to_reduced[dof] = Some(free_dofs.len());
                free_dofs.push(dof);
            }
        }

        let mut row_offsets = Vec::with_capacity(free_dofs.len() + 1);
        let mut col_indices = Vec::new();
        let mut source = Vec::new();
        row_offsets.push(0);
        for &row in &free_dofs {
            for k in self.row_offsets[row]..self.row_offsets[row + 1] {
                if let Some(c) = global_to_reduced[self.col_indices[k]] {
                    col_indices.push(c);
                    source.push(k);
                }
            }
            row_offsets.push(col_indices.len());
        }

        Ok(RestrictedPattern {
            mask: free.to_vec(),
            free_dofs,
            row_offsets,
            col_indices,
            source,
        })
    }
}

/// A [`DofPattern`] reduced to its free DOFs.
#[derive(Debug, Clone)]
pub struct RestrictedPattern {
    mask: Vec<bool>,
    free_dofs: Vec<usize>,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    /// Position in the full value array of every reduced entry.
    source: Vec<usize>,
}

impl RestrictedPattern {
    /// Number of free DOFs.
    pub fn n_free(&self) -> usize {
        self.free_dofs.len()
    }

    /// Global index of each free DOF.
    pub fn free_dofs(&self) -> &[usize] {
        &self.free_dofs
    }

    /// True if this restriction was built from `free`.
    pub fn matches(&self, free: &[bool]) -> bool {
        self.mask == free
    }

    /// Reduced matrix from full-pattern values.
    pub fn gather_matrix(&self, values: &[f64]) -> Result<CsrMatrix> {
        let n = self.free_dofs.len();
        let reduced: Vec<f64> = self.source.iter().map(|&k| values[k]).collect();
        CsrMatrix::try_from_csr_data(
            n,
            n,
            self.row_offsets.clone(),
            self.col_indices.clone(),
            reduced,
        )
        .map_err(|e| Error::Solver(format!("invalid CSR data: {}", e)))
    }

    /// Reduced vector from a global vector.
    pub fn gather_vector(&self, global: &[f64]) -> Vec<f64> {
        self.free_dofs.iter().map(|&d| global[d]).collect()
    }

    /// Add a reduced vector into the free entries of a global vector.
    pub fn scatter_add(&self, reduced: &[f64], global: &mut [f64]) {
        for (&d, &v) in self.free_dofs.iter().zip(reduced) {
            global[d] += v;
        }
    }
}
