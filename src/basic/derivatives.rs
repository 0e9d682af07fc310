//! Closed-form partial derivatives of single branch flows.

use num_complex::Complex64;

use super::system::admittance::BranchAdmittance;

/// Partials of one complex flow with respect to the terminal voltages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowPartials {
    pub dva_f: Complex64,
    pub dva_t: Complex64,
    pub dvm_f: Complex64,
    pub dvm_t: Complex64,
}

#[inline]
fn unit(v: Complex64) -> Complex64 {
    Complex64::from_polar(1.0, v.arg())
}

/// `Sf = |Vf|^2 conj(yff) + Vf conj(yft Vt)`
pub fn dsf_dv(y: &BranchAdmittance, vf: Complex64, vt: Complex64) -> FlowPartials {
    let cross = vf * (y.yft * vt).conj();
    FlowPartials {
        dva_f: Complex64::i() * cross,
        dva_t: -Complex64::i() * cross,
        dvm_f: 2.0 * vf.norm() * y.yff.conj() + unit(vf) * (y.yft * vt).conj(),
        dvm_t: vf * (y.yft * unit(vt)).conj(),
    }
}

/// `St = |Vt|^2 conj(ytt) + Vt conj(ytf Vf)`
pub fn dst_dv(y: &BranchAdmittance, vf: Complex64, vt: Complex64) -> FlowPartials {
    let cross = vt * (y.ytf * vf).conj();
    FlowPartials {
        dva_f: -Complex64::i() * cross,
        dva_t: Complex64::i() * cross,
        dvm_f: vt * (y.ytf * unit(vf)).conj(),
        dvm_t: 2.0 * vt.norm() * y.ytt.conj() + unit(vt) * (y.ytf * vf).conj(),
    }
}

/// `(dSf/dm, dSt/dm)` for tap module `m`.
pub fn dflows_dm(y: &BranchAdmittance, m: f64, vf: Complex64, vt: Complex64) -> (Complex64, Complex64) {
    let dyff = -2.0 * y.yff / m;
    let dyft = -y.yft / m;
    let dytf = -y.ytf / m;
    (vf * (dyff * vf + dyft * vt).conj(), vt * (dytf * vf).conj())
}

/// `(dSf/dtau, dSt/dtau)` for phase shift `tau`.
pub fn dflows_dtau(y: &BranchAdmittance, vf: Complex64, vt: Complex64) -> (Complex64, Complex64) {
    let dyft = Complex64::i() * y.yft;
    let dytf = -Complex64::i() * y.ytf;
    (vf * (dyft * vt).conj(), vt * (dytf * vf).conj())
}
