use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

/// Trait for computing the conjugate of a matrix.
pub(crate) trait Conjugate {
    type Mat;

    /// Returns the conjugate of the matrix.
    fn conjugate(&self) -> Self::Mat;

    /// Computes the conjugate of the matrix in-place.
    fn conjugate_mut(&mut self);
}

impl Conjugate for CscMatrix<Complex64> {
    type Mat = CscMatrix<Complex64>;

    fn conjugate(&self) -> Self::Mat {
        let mut out = self.clone();
        out.conjugate_mut();
        out
    }

    fn conjugate_mut(&mut self) {
        self.values_mut().iter_mut().for_each(|v| *v = v.conj());
    }
}

/// Builds a square diagonal matrix holding `diag` with the full diagonal pattern.
pub(crate) fn diag_csc(diag: &[Complex64]) -> CscMatrix<Complex64> {
    let mut m = CscMatrix::identity(diag.len());
    m.values_mut().copy_from_slice(diag);
    m
}
