//! Parallel finite element assembly.
//!
//! Elements are split into a fixed number of contiguous chunks, one per worker
//! of the run's thread pool. Every chunk accumulates into its own
//! [`WorkerBuffer`]; the buffers are then summed on the calling thread in chunk
//! order. No accumulator is shared between workers, and for a fixed worker
//! count the floating-point summation order (hence the result) is identical
//! from run to run.

use crate::error::Result;
use crate::sparse::{DofPattern, SparseVector};
use nalgebra::DMatrix;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::ops::Range;

/// Per-worker accumulation target: one matrix value array laid out on a
/// [`DofPattern`] plus any number of global vectors.
#[derive(Debug, Clone)]
pub struct WorkerBuffer {
    /// Matrix values, indexed like the pattern's CSR value array.
    pub matrix: Vec<f64>,
    /// Global vectors (load, internal force, ...).
    pub vectors: Vec<SparseVector>,
}

impl WorkerBuffer {
    /// Zeroed buffer for `nnz` matrix entries and `n_vectors` vectors of length `n_dofs`.
    pub fn new(nnz: usize, n_dofs: usize, n_vectors: usize) -> Self {
        Self {
            matrix: vec![0.0; nnz],
            vectors: (0..n_vectors).map(|_| SparseVector::zeros(n_dofs)).collect(),
        }
    }

    /// Scatter a dense element matrix using precomputed value positions.
    pub fn add_element_matrix(&mut self, positions: &[usize], ke: &DMatrix<f64>) {
        let n = ke.nrows();
        debug_assert_eq!(positions.len(), n * n);
        for i in 0..n {
            for j in 0..n {
                self.matrix[positions[i * n + j]] += ke[(i, j)];
            }
        }
    }

    /// Add an element vector into vector `which`.
    pub fn add_element_vector(&mut self, which: usize, dofs: &[usize], fe: &[f64]) {
        self.vectors[which].add_subvector(dofs, fe);
    }

    fn accumulate(&mut self, other: &WorkerBuffer) {
        for (a, b) in self.matrix.iter_mut().zip(other.matrix.iter()) {
            *a += *b;
        }
        for (a, b) in self.vectors.iter_mut().zip(other.vectors.iter()) {
            *a += b;
        }
    }
}

/// Split `0..n_elements` into at most `n_chunks` contiguous, non-empty ranges.
pub fn element_chunks(n_elements: usize, n_chunks: usize) -> Vec<Range<usize>> {
    let n_chunks = n_chunks.max(1).min(n_elements.max(1));
    let base = n_elements / n_chunks;
    let extra = n_elements % n_chunks;

    let mut chunks = Vec::with_capacity(n_chunks);
    let mut start = 0;
    for c in 0..n_chunks {
        let len = base + usize::from(c < extra);
        chunks.push(start..start + len);
        start += len;
    }
    chunks
}

/// Assemble chunk contributions in parallel and reduce them in chunk order.
///
/// # Arguments
///
/// * `pool` - Worker pool of the current run
/// * `pattern` - Sparsity pattern of the assembled matrix
/// * `chunks` - Element ranges, usually from [`element_chunks`]
/// * `states` - One item per chunk handed to the worker by value (e.g. a disjoint
///   mutable slice of integration-point state, or `()`)
/// * `n_vectors` - Number of global vectors each buffer carries
/// * `assemble_chunk` - Fills a buffer for one chunk
///
/// # Returns
///
/// The summed buffer. The first error raised by any chunk (in chunk order) is
/// returned instead.
pub fn parallel_assemble<S, F>(
    pool: &ThreadPool,
    pattern: &DofPattern,
    chunks: &[Range<usize>],
    states: Vec<S>,
    n_vectors: usize,
    assemble_chunk: F,
) -> Result<WorkerBuffer>
where
    S: Send,
    F: Fn(Range<usize>, S, &mut WorkerBuffer) -> Result<()> + Sync,
{
    debug_assert_eq!(chunks.len(), states.len());
    let nnz = pattern.nnz();
    let n_dofs = pattern.n_dofs();

    let buffers: Vec<Result<WorkerBuffer>> = pool.install(|| {
        chunks
            .par_iter()
            .cloned()
            .zip(states.into_par_iter())
            .map(|(range, state)| {
                let mut buffer = WorkerBuffer::new(nnz, n_dofs, n_vectors);
                assemble_chunk(range, state, &mut buffer)?;
                Ok(buffer)
            })
            .collect()
    });

    let mut total = WorkerBuffer::new(nnz, n_dofs, n_vectors);
    for buffer in buffers {
        total.accumulate(&buffer?);
    }
    Ok(total)
}
