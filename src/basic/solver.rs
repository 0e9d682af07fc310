#[cfg(feature = "faer")]
mod faer;
#[cfg(feature = "faer")]
pub use faer::*;

#[cfg(feature = "rsparse")]
mod rsparse;
#[cfg(feature = "rsparse")]
pub use rsparse::*;

#[cfg(feature = "faer")]
pub type DefaultSolver = FaerSolver;

#[cfg(all(not(feature = "faer"), feature = "rsparse"))]
pub type DefaultSolver = RSparseSolver;

#[allow(non_snake_case)]
/// A trait for solving sparse linear systems.
///
/// Implementations may cache a symbolic factorization between calls; the Newton driver calls
/// [`Solve::reset`] whenever the sparsity pattern of the Jacobian changes.
pub trait Solve {
    /// Solves the sparse linear system in place.
    ///
    /// # Parameters
    ///
    /// * `Ap` - Column pointers of the matrix.
    /// * `Ai` - Row indices of the matrix.
    /// * `Ax` - Non-zero values of the matrix.
    /// * `b` - Right-hand side vector, overwritten with the solution.
    /// * `n` - Dimension of the system.
    fn solve(
        &mut self,
        Ap: &mut [usize],
        Ai: &mut [usize],
        Ax: &mut [f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), &'static str>;

    /// Drops any cached symbolic analysis.
    fn reset(&mut self);
}
