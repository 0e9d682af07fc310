use std::collections::BTreeMap;

use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;
use num_traits::Zero;

use super::network::{NetworkSnapshot, PassiveBranch};
use crate::basic::error::ConfigError;

/// Pi-model primitive admittances of one branch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BranchAdmittance {
    pub yff: Complex64,
    pub yft: Complex64,
    pub ytf: Complex64,
    pub ytt: Complex64,
}

impl BranchAdmittance {
    /// Computes the primitives for tap module `m` and phase shift `tau`.
    ///
    /// The phase shift enters `yft` as `e^{j tau}` and `ytf` as `e^{-j tau}`.
    pub fn new(br: &PassiveBranch, m: f64, tau: f64) -> Self {
        let ys = Complex64::new(1.0, 0.0) / Complex64::new(br.r, br.x);
        let bc2 = Complex64::new(br.g, br.b) / 2.0;
        let shift = Complex64::from_polar(1.0, tau);
        let ratio = m * br.vtap_f * br.vtap_t;
        Self {
            yff: (ys + bc2) / (m * m * br.vtap_f * br.vtap_f),
            yft: -ys * shift / ratio,
            ytf: -ys * shift.conj() / ratio,
            ytt: (ys + bc2) / (br.vtap_t * br.vtap_t),
        }
    }

    /// Power entering the branch at the from side.
    #[inline]
    pub fn sf(&self, vf: Complex64, vt: Complex64) -> Complex64 {
        vf * (self.yff * vf + self.yft * vt).conj()
    }

    /// Power entering the branch at the to side.
    #[inline]
    pub fn st(&self, vf: Complex64, vt: Complex64) -> Complex64 {
        vt * (self.ytt * vt + self.ytf * vf).conj()
    }

    #[inline]
    pub fn i_from(&self, vf: Complex64, vt: Complex64) -> Complex64 {
        self.yff * vf + self.yft * vt
    }

    #[inline]
    pub fn i_to(&self, vf: Complex64, vt: Complex64) -> Complex64 {
        self.ytt * vt + self.ytf * vf
    }
}

/// Nodal admittance matrix plus the bookkeeping needed to patch it in place.
///
/// The pattern always holds every diagonal entry and the four entries of each branch, so tap
/// changes never alter the structure. `positions[k]` stores where the `ff`, `ft`, `tf` and `tt`
/// terms of branch `k` live in `ybus.values()`.
#[derive(Debug, Clone)]
pub struct AdmittanceCache {
    pub ybus: CscMatrix<Complex64>,
    pub prim: Vec<BranchAdmittance>,
    positions: Vec<[usize; 4]>,
}

impl AdmittanceCache {
    /// Full build from the branch data, the given tap state and the bus shunts.
    pub fn build(
        net: &NetworkSnapshot,
        m: &DVector<f64>,
        tau: &DVector<f64>,
    ) -> Result<Self, ConfigError> {
        let n = net.nbus();
        // keyed by (col, row) so the iteration order is the CSC order
        let mut entries: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        for i in 0..n {
            entries.insert((i, i), 0);
        }
        for br in &net.branches {
            for key in [
                (br.from, br.from),
                (br.to, br.from),
                (br.from, br.to),
                (br.to, br.to),
            ] {
                entries.insert(key, 0);
            }
        }

        let mut col_offsets = vec![0usize; n + 1];
        let mut row_indices = Vec::with_capacity(entries.len());
        for (pos, ((col, row), slot)) in entries.iter_mut().enumerate() {
            *slot = pos;
            col_offsets[*col + 1] += 1;
            row_indices.push(*row);
        }
        for c in 0..n {
            col_offsets[c + 1] += col_offsets[c];
        }

        let mut values = vec![Complex64::zero(); entries.len()];
        for (i, y) in net.y_shunt.iter().enumerate() {
            values[entries[&(i, i)]] += y;
        }

        let mut prim = Vec::with_capacity(net.nbr());
        let mut positions = Vec::with_capacity(net.nbr());
        for (k, br) in net.branches.iter().enumerate() {
            let (f, t) = (br.from, br.to);
            // (row, col) -> stored as (col, row)
            let pos = [
                entries[&(f, f)],
                entries[&(t, f)],
                entries[&(f, t)],
                entries[&(t, t)],
            ];
            let y = BranchAdmittance::new(br, m[k], tau[k]);
            values[pos[0]] += y.yff;
            values[pos[1]] += y.yft;
            values[pos[2]] += y.ytf;
            values[pos[3]] += y.ytt;
            prim.push(y);
            positions.push(pos);
        }

        let ybus = CscMatrix::try_from_csc_data(n, n, col_offsets, row_indices, values)?;
        Ok(Self {
            ybus,
            prim,
            positions,
        })
    }

    /// Refreshes the rows and columns touched by `branches` for the new tap state.
    ///
    /// Only the entries owned by those branches are rewritten; everything else keeps its value.
    pub fn patch_taps(
        &mut self,
        net: &NetworkSnapshot,
        branches: &[usize],
        m: &DVector<f64>,
        tau: &DVector<f64>,
    ) {
        let values = self.ybus.values_mut();
        for &k in branches {
            let new = BranchAdmittance::new(&net.branches[k], m[k], tau[k]);
            let old = self.prim[k];
            let pos = self.positions[k];
            values[pos[0]] += new.yff - old.yff;
            values[pos[1]] += new.yft - old.yft;
            values[pos[2]] += new.ytf - old.ytf;
            values[pos[3]] += new.ytt - old.ytt;
            self.prim[k] = new;
        }
    }

    /// Power injected into the passive network at every bus.
    pub fn injections(&self, v: &DVector<Complex64>) -> DVector<Complex64> {
        let ibus = &self.ybus * v;
        v.component_mul(&ibus.conjugate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcases::*;
    use nalgebra::DMatrix;

    fn max_diff(a: &CscMatrix<Complex64>, b: &CscMatrix<Complex64>) -> f64 {
        let da = DMatrix::from(a);
        let db = DMatrix::from(b);
        (da - db).iter().map(|x| x.norm()).fold(0.0, f64::max)
    }

    #[test]
    fn test_two_bus_ybus() {
        let net = two_bus_network(0.5, 0.2);
        let m = DVector::from_element(net.nbr(), 1.0);
        let tau = DVector::zeros(net.nbr());
        let adm = AdmittanceCache::build(&net, &m, &tau).unwrap();
        let y = DMatrix::from(&adm.ybus);
        let ys = Complex64::new(1.0, 0.0) / Complex64::new(0.0, 0.1);
        println!("Ybus={}", y);
        assert!((y[(0, 0)] - ys).norm() < 1e-12);
        assert!((y[(0, 1)] + ys).norm() < 1e-12);
        assert!((y[(1, 0)] + ys).norm() < 1e-12);
        assert!((y[(1, 1)] - ys).norm() < 1e-12);
    }

    #[test]
    fn test_patch_matches_rebuild() {
        let net = tap_network();
        let mut m = DVector::from_iterator(net.nbr(), net.branches.iter().map(|b| b.tap_module));
        let mut tau = DVector::from_iterator(net.nbr(), net.branches.iter().map(|b| b.tap_phase));
        let mut adm = AdmittanceCache::build(&net, &m, &tau).unwrap();

        let controlled: Vec<usize> = (0..net.nbr()).collect();
        for step in 1..=5 {
            for &k in &controlled {
                m[k] = 1.0 + 0.013 * step as f64 - 0.004 * k as f64;
                tau[k] = 0.02 * step as f64;
            }
            adm.patch_taps(&net, &controlled, &m, &tau);
        }
        let full = AdmittanceCache::build(&net, &m, &tau).unwrap();
        let diff = max_diff(&adm.ybus, &full.ybus);
        assert!(diff < 1e-10, "patched Ybus drifted from rebuild: {diff}");
        assert!(adm.ybus.pattern() == full.ybus.pattern());
    }

    #[test]
    fn test_phase_shift_signs() {
        let br = PassiveBranch::line("t", 0, 1, 0.0, 0.1).with_tap(1.0, 0.1);
        let y = BranchAdmittance::new(&br, 1.0, 0.1);
        // lossless shifter: ytf is the conjugate-phase twin of yft
        let ys = Complex64::new(1.0, 0.0) / Complex64::new(0.0, 0.1);
        assert!((y.yft + ys * Complex64::from_polar(1.0, 0.1)).norm() < 1e-12);
        assert!((y.ytf + ys * Complex64::from_polar(1.0, -0.1)).norm() < 1e-12);
    }
}
