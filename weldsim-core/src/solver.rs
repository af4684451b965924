//! Linear system solvers.
//!
//! Both the Crank–Nicolson heat-conduction matrix and the elasto-plastic
//! tangent are symmetric positive definite once constrained DOFs are removed,
//! so the production path is faer's sparse LLᵀ factorization.
//!
//! # Solver Backends
//!
//! - [`CachedCholeskySolver`]: Sparse Cholesky that keeps the symbolic analysis
//!   between solves. The pattern is fixed for a run (thermal) or between clamp
//!   changes (mechanical), so only the numeric factorization is repeated.
//! - [`FaerCholeskySolver`]: Sparse Cholesky without caching.
//! - [`DenseLuSolver`]: nalgebra dense LU, for small test problems only.

use crate::error::{Error, Result};
use crate::sparse::CsrMatrix;
use faer::linalg::cholesky::llt::factor::LltError;
use faer::prelude::*;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::linalg::LltError as SparseLltError;
use faer::sparse::{SparseColMat, SymbolicSparseColMat};
use serde::{Deserialize, Serialize};

/// Linear solver interface.
pub trait Solver: Send + Sync {
    /// Solve the linear system Ax = b.
    ///
    /// # Arguments
    ///
    /// * `matrix` - System matrix (symmetric)
    /// * `rhs` - Right-hand side vector
    ///
    /// # Returns
    ///
    /// Solution vector
    fn solve(&self, matrix: &CsrMatrix, rhs: &[f64]) -> Result<Vec<f64>>;

    /// Solver name for diagnostics.
    fn name(&self) -> &str;
}

/// Linear solver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    /// Sparse Cholesky with cached symbolic analysis.
    #[default]
    Cholesky,
    /// Dense LU (small problems and debugging).
    DenseLu,
}

fn check_dimensions(matrix: &CsrMatrix, rhs: &[f64]) -> Result<()> {
    if matrix.nrows() != matrix.ncols() {
        return Err(Error::Solver("Matrix must be square".into()));
    }
    if matrix.nrows() != rhs.len() {
        return Err(Error::Solver(format!(
            "RHS size mismatch: matrix has {} rows, rhs has {} entries",
            matrix.nrows(),
            rhs.len()
        )));
    }
    Ok(())
}

/// Direct solver using nalgebra dense LU factorization.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseLuSolver;

impl DenseLuSolver {
    pub fn new() -> Self {
        Self
    }
}

impl Solver for DenseLuSolver {
    fn solve(&self, matrix: &CsrMatrix, rhs: &[f64]) -> Result<Vec<f64>> {
        use nalgebra::{DMatrix, DVector};

        check_dimensions(matrix, rhs)?;
        if matrix.nrows() == 0 {
            return Ok(vec![]);
        }

        let dense = DMatrix::from(matrix);
        let b = DVector::from_column_slice(rhs);
        let solution = dense
            .lu()
            .solve(&b)
            .ok_or_else(|| Error::SingularMatrix("LU factorization failed".into()))?;

        Ok(solution.as_slice().to_vec())
    }

    fn name(&self) -> &str {
        "Dense LU"
    }
}

/// View a symmetric CSR matrix as faer CSC.
///
/// For a symmetric matrix the CSR arrays (row offsets, column indices) are
/// exactly the CSC arrays (column offsets, row indices) of the same matrix.
/// Column indices are sorted within each row by construction of nalgebra-sparse.
fn csr_to_faer_csc(csr: &CsrMatrix) -> SparseColMat<usize, f64> {
    let n = csr.nrows();
    let (offsets, indices, values) = (
        csr.row_offsets().to_vec(),
        csr.col_indices().to_vec(),
        csr.values().to_vec(),
    );

    // SAFETY: offsets are monotone with offsets[n] = nnz and indices are in
    // bounds and sorted per column, as guaranteed by the validated CSR input.
    unsafe {
        SparseColMat::new(
            SymbolicSparseColMat::new_unchecked(n, n, offsets, None, indices),
            values,
        )
    }
}

fn map_factor_error(e: SparseLltError) -> Error {
    match e {
        SparseLltError::Generic(err) => Error::Solver(format!("Sparse Cholesky error: {:?}", err)),
        SparseLltError::Numeric(LltError::NonPositivePivot { index }) => Error::SingularMatrix(
            format!("Matrix is not positive definite at pivot {}", index),
        ),
    }
}

fn factor_and_solve(
    symbolic: SymbolicLlt<usize>,
    csc: &SparseColMat<usize, f64>,
    rhs: &[f64],
) -> Result<Vec<f64>> {
    let n = rhs.len();
    let llt = Llt::try_new_with_symbolic(symbolic, csc.as_ref(), faer::Side::Lower)
        .map_err(map_factor_error)?;

    let mut x = faer::Mat::from_fn(n, 1, |i, _| rhs[i]);
    llt.solve_in_place(x.as_mut());

    let solution: Vec<f64> = (0..n).map(|i| x[(i, 0)]).collect();
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(Error::SingularMatrix("non-finite solution".into()));
    }
    Ok(solution)
}

/// Sparse Cholesky solver using the faer library.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaerCholeskySolver;

impl FaerCholeskySolver {
    /// Create a new sparse Cholesky solver.
    pub fn new() -> Self {
        Self
    }
}

impl Solver for FaerCholeskySolver {
    fn solve(&self, matrix: &CsrMatrix, rhs: &[f64]) -> Result<Vec<f64>> {
        check_dimensions(matrix, rhs)?;
        if matrix.nrows() == 0 {
            return Ok(vec![]);
        }

        let csc = csr_to_faer_csc(matrix);
        let symbolic = SymbolicLlt::try_new(csc.as_ref().symbolic(), faer::Side::Lower)
            .map_err(|_| Error::Solver("Symbolic Cholesky analysis failed".into()))?;
        factor_and_solve(symbolic, &csc, rhs)
    }

    fn name(&self) -> &str {
        "faer Sparse Cholesky (LLᵀ)"
    }
}

/// Sparse Cholesky solver with cached symbolic factorization.
///
/// The symbolic analysis is computed on the first solve and reused until
/// [`CachedCholeskySolver::invalidate`] is called (the sparsity pattern changed).
#[derive(Default)]
pub struct CachedCholeskySolver {
    symbolic: Option<SymbolicLlt<usize>>,
    analyses: usize,
}

impl CachedCholeskySolver {
    /// Create a new cached Cholesky solver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Perform symbolic analysis on the matrix sparsity pattern.
    pub fn analyze(&mut self, matrix: &CsrMatrix) -> Result<()> {
        let csc = csr_to_faer_csc(matrix);
        let symbolic = SymbolicLlt::try_new(csc.as_ref().symbolic(), faer::Side::Lower)
            .map_err(|_| Error::Solver("Symbolic Cholesky analysis failed".into()))?;
        self.symbolic = Some(symbolic);
        self.analyses += 1;
        Ok(())
    }

    /// Drop the cached analysis.
    pub fn invalidate(&mut self) {
        self.symbolic = None;
    }

    /// Number of symbolic analyses performed so far.
    pub fn analyses(&self) -> usize {
        self.analyses
    }

    /// Solve using the cached symbolic factorization.
    ///
    /// The matrix must have the same sparsity pattern as the one used for `analyze`.
    pub fn solve_with_cached_symbolic(&self, matrix: &CsrMatrix, rhs: &[f64]) -> Result<Vec<f64>> {
        let symbolic = self.symbolic.as_ref().ok_or_else(|| {
            Error::Solver("No cached symbolic factorization - call analyze() first".into())
        })?;

        check_dimensions(matrix, rhs)?;
        if matrix.nrows() == 0 {
            return Ok(vec![]);
        }

        let csc = csr_to_faer_csc(matrix);
        factor_and_solve(symbolic.clone(), &csc, rhs)
    }

    /// Solve, analyzing the pattern first if nothing is cached.
    pub fn solve_mut(&mut self, matrix: &CsrMatrix, rhs: &[f64]) -> Result<Vec<f64>> {
        if self.symbolic.is_none() {
            check_dimensions(matrix, rhs)?;
            if matrix.nrows() == 0 {
                return Ok(vec![]);
            }
            self.analyze(matrix)?;
        }
        self.solve_with_cached_symbolic(matrix, rhs)
    }
}

impl Solver for CachedCholeskySolver {
    fn solve(&self, matrix: &CsrMatrix, rhs: &[f64]) -> Result<Vec<f64>> {
        if self.symbolic.is_some() {
            self.solve_with_cached_symbolic(matrix, rhs)
        } else {
            FaerCholeskySolver::new().solve(matrix, rhs)
        }
    }

    fn name(&self) -> &str {
        "faer Sparse Cholesky (cached)"
    }
}

/// The solver a run uses for one physics stage.
pub enum LinearSolver {
    Cholesky(CachedCholeskySolver),
    DenseLu(DenseLuSolver),
}

impl LinearSolver {
    /// Create the configured solver.
    pub fn new(kind: LinearSolverKind) -> Self {
        match kind {
            LinearSolverKind::Cholesky => Self::Cholesky(CachedCholeskySolver::new()),
            LinearSolverKind::DenseLu => Self::DenseLu(DenseLuSolver::new()),
        }
    }

    /// Solve, reusing cached analysis where the backend supports it.
    pub fn solve(&mut self, matrix: &CsrMatrix, rhs: &[f64]) -> Result<Vec<f64>> {
        match self {
            Self::Cholesky(s) => s.solve_mut(matrix, rhs),
            Self::DenseLu(s) => s.solve(matrix, rhs),
        }
    }

    /// Forget cached pattern information.
    pub fn invalidate(&mut self) {
        if let Self::Cholesky(s) = self {
            s.invalidate();
        }
    }

    /// Solver name for diagnostics.
    pub fn name(&self) -> &str {
        match self {
            Self::Cholesky(s) => s.name(),
            Self::DenseLu(s) => s.name(),
        }
    }
}
