use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use crate::basic::sparse::conj::{diag_csc, Conjugate};

/// Computes the partial derivatives of the bus power injections `V conj(Ybus V)` with respect
/// to voltage magnitudes and angles.
///
/// `v_unit` holds `e^{j Va}` for every bus. It is passed separately from `v` so that buses held at
/// zero voltage still get a well-defined magnitude direction.
///
/// Returns `(dS_dVm, dS_dVa)`.
///
/// The formulation is the complex-matrix one from
/// R. D. Zimmerman, "AC Power Flows, Generalized OPF Costs and their Derivatives using Complex
/// Matrix Notation", MATPOWER Technical Note 2, February 2010.
#[allow(non_snake_case)]
pub fn dSbus_dV(
    Ybus: &CscMatrix<Complex64>,
    v: &DVector<Complex64>,
    v_unit: &DVector<Complex64>,
) -> (CscMatrix<Complex64>, CscMatrix<Complex64>) {
    let ibus = Ybus * v;
    let diagVnorm = diag_csc(v_unit.as_slice());
    let diagV = diag_csc(v.as_slice());
    let diagIbus = diag_csc(ibus.as_slice());

    let dS_dVm = &diagV * (Ybus * &diagVnorm).conjugate() + diagIbus.conjugate() * &diagVnorm;
    let dS_dVa = &diagV * (diagIbus - Ybus * &diagV).conjugate() * Complex64::i();
    (dS_dVm, dS_dVa)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;
    use nalgebra_sparse::CooMatrix;

    fn injections(y: &CscMatrix<Complex64>, vm: &[f64], va: &[f64]) -> DVector<Complex64> {
        let v = DVector::from_iterator(
            vm.len(),
            vm.iter().zip(va).map(|(&m, &a)| Complex64::from_polar(m, a)),
        );
        let i = y * &v;
        v.component_mul(&i.map(|c| c.conj()))
    }

    #[test]
    #[allow(non_snake_case)]
    fn test_against_central_differences() {
        let mut coo = CooMatrix::new(3, 3);
        let y01 = Complex64::new(1.0, -10.0);
        let y12 = Complex64::new(2.0, -8.0);
        for (a, b, y) in [(0, 1, y01), (1, 2, y12)] {
            coo.push(a, a, y);
            coo.push(b, b, y);
            coo.push(a, b, -y);
            coo.push(b, a, -y);
        }
        coo.push(2, 2, Complex64::new(0.0, 0.05));
        let ybus = CscMatrix::from(&coo);

        let vm = [1.0, 0.97, 1.02];
        let va = [0.0, -0.05, 0.03];
        let v = DVector::from_iterator(3, (0..3).map(|i| Complex64::from_polar(vm[i], va[i])));
        let v_unit = DVector::from_iterator(3, va.iter().map(|&a| Complex64::from_polar(1.0, a)));
        let (dS_dVm, dS_dVa) = dSbus_dV(&ybus, &v, &v_unit);
        let dVm = DMatrix::from(&dS_dVm);
        let dVa = DMatrix::from(&dS_dVa);

        let h = 1e-6;
        for j in 0..3 {
            let (mut vp, mut vn) = (vm, vm);
            vp[j] += h;
            vn[j] -= h;
            let col = (injections(&ybus, &vp, &va) - injections(&ybus, &vn, &va)).unscale(2.0 * h);
            for i in 0..3 {
                assert!((col[i] - dVm[(i, j)]).norm() < 1e-6, "dS_dVm[{i},{j}]");
            }

            let (mut ap, mut an) = (va, va);
            ap[j] += h;
            an[j] -= h;
            let col = (injections(&ybus, &vm, &ap) - injections(&ybus, &vm, &an)).unscale(2.0 * h);
            for i in 0..3 {
                assert!((col[i] - dVa[(i, j)]).norm() < 1e-6, "dS_dVa[{i},{j}]");
            }
        }
    }
}
