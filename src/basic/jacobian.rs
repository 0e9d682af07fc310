//! Jacobian of the residual in [`super::residual`].
//!
//! Each (row group, column group) pair owns one COO block; most pairs stay empty. The blocks are
//! concatenated with [`csc_hstack`] per row group and the rows with [`csc_vstack`].

use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex64;
use num_traits::{One, Zero};

use super::derivatives::{dflows_dm, dflows_dtau, dsf_dv, dst_dv, FlowPartials};
use super::dsbus_dv::dSbus_dV;
use super::indices::{ControlIndices, FGroup, XGroup};
use super::problem::StateRef;
use super::residual::{hvdc_rpu, negative_pole_vm};
use super::sparse::stack::{csc_hstack, csc_vstack};

struct BlockGrid {
    blocks: Vec<CooMatrix<f64>>,
}

impl BlockGrid {
    fn new(idx: &ControlIndices) -> Self {
        let xw = idx.x_widths();
        let blocks = idx
            .f_widths()
            .iter()
            .flat_map(|&r| xw.iter().map(move |&c| CooMatrix::new(r, c)))
            .collect();
        Self { blocks }
    }

    #[inline]
    fn push(&mut self, r: FGroup, c: XGroup, i: usize, j: usize, v: f64) {
        self.blocks[r as usize * XGroup::COUNT + c as usize].push(i, j, v);
    }

    /// Adds `ds` to the active and reactive balance rows of `bus`, where present.
    #[inline]
    fn push_bus(&mut self, idx: &ControlIndices, bus: usize, c: XGroup, j: usize, ds: Complex64) {
        if let Some(i) = idx.p_pos[bus] {
            self.push(FGroup::P, c, i, j, ds.re);
        }
        if let Some(i) = idx.q_pos[bus] {
            self.push(FGroup::Q, c, i, j, ds.im);
        }
    }

    /// Adds voltage partials of a scalar row to the columns of the unknown voltages.
    fn push_voltage(&mut self, idx: &ControlIndices, r: FGroup, i: usize, bus: usize, dva: f64, dvm: f64) {
        if let Some(j) = idx.va_pos[bus] {
            self.push(r, XGroup::Va, i, j, dva);
        }
        if let Some(j) = idx.vm_pos[bus] {
            self.push(r, XGroup::Vm, i, j, dvm);
        }
    }

    fn assemble(self) -> CscMatrix<f64> {
        let rows: Vec<CscMatrix<f64>> = self
            .blocks
            .chunks(XGroup::COUNT)
            .map(|row| {
                let blocks: Vec<CscMatrix<f64>> = row.iter().map(CscMatrix::from).collect();
                let refs: Vec<&CscMatrix<f64>> = blocks.iter().collect();
                csc_hstack(&refs)
            })
            .collect();
        let refs: Vec<&CscMatrix<f64>> = rows.iter().collect();
        csc_vstack(&refs)
    }
}

/// Closed-form Jacobian at the state held by `s`.
pub fn closed_form_jacobian(s: StateRef<'_>) -> CscMatrix<f64> {
    let StateRef {
        net,
        idx,
        vars,
        sched,
        adm,
    } = s;
    let mut g = BlockGrid::new(idx);
    let v = vars.voltage();
    let v_unit = vars.unit_voltage();

    // nodal balance vs. voltages
    let (ds_dvm, ds_dva) = dSbus_dV(&adm.ybus, &v, &v_unit);
    for (r, c, d) in ds_dva.triplet_iter() {
        if let Some(j) = idx.va_pos[c] {
            g.push_bus(idx, r, XGroup::Va, j, *d);
        }
    }
    for (r, c, d) in ds_dvm.triplet_iter() {
        if let Some(j) = idx.vm_pos[c] {
            g.push_bus(idx, r, XGroup::Vm, j, *d);
        }
    }
    let dsbus = sched.dsbus_dvm(&vars.vm);
    for (bus, pos) in idx.vm_pos.iter().enumerate() {
        if let Some(j) = *pos {
            g.push_bus(idx, bus, XGroup::Vm, j, -dsbus[bus]);
        }
    }

    // nodal balance vs. controlled taps
    for (j, &k) in idx.u_cbr_m.iter().enumerate() {
        let br = &net.branches[k];
        let (dsf, dst) = dflows_dm(&adm.prim[k], vars.m[k], v[br.from], v[br.to]);
        g.push_bus(idx, br.from, XGroup::M, j, dsf);
        g.push_bus(idx, br.to, XGroup::M, j, dst);
    }
    for (j, &k) in idx.u_cbr_tau.iter().enumerate() {
        let br = &net.branches[k];
        let (dsf, dst) = dflows_dtau(&adm.prim[k], v[br.from], v[br.to]);
        g.push_bus(idx, br.from, XGroup::Tau, j, dsf);
        g.push_bus(idx, br.to, XGroup::Tau, j, dst);
    }

    let one = Complex64::one();
    let jay = Complex64::i();

    // converters
    for (k, vsc) in net.vscs.iter().enumerate() {
        if let Some(j) = idx.pfp_pos[k] {
            g.push_bus(idx, vsc.bus_dc_p, XGroup::PfpVsc, j, one);
        }
        if let (Some(j), Some(n)) = (idx.pfn_pos[k], vsc.bus_dc_n) {
            g.push_bus(idx, n, XGroup::PfnVsc, j, one);
        }
        if let Some(j) = idx.pt_pos[k] {
            g.push_bus(idx, vsc.bus_ac, XGroup::PtVsc, j, one);
        }
        if let Some(j) = idx.qt_pos[k] {
            g.push_bus(idx, vsc.bus_ac, XGroup::QtVsc, j, jay);
        }

        let (pt, qt) = (vars.vsc_pt[k], vars.vsc_qt[k]);
        let vm = vars.vm[vsc.bus_ac];
        let s_mag = pt.hypot(qt);
        let it = s_mag / vm;
        let (a2, a3) = (vsc.alpha2, vsc.alpha3);
        // a2 It is not differentiable at zero flow
        let lin = |p: f64| if s_mag > 0.0 { a2 * p / (vm * s_mag) } else { 0.0 };

        if let Some(j) = idx.pt_pos[k] {
            g.push(FGroup::LossVsc, XGroup::PtVsc, k, j, 2.0 * a3 * pt / (vm * vm) + lin(pt) - 1.0);
        }
        if let Some(j) = idx.qt_pos[k] {
            g.push(FGroup::LossVsc, XGroup::QtVsc, k, j, 2.0 * a3 * qt / (vm * vm) + lin(qt));
        }
        if let Some(j) = idx.vm_pos[vsc.bus_ac] {
            g.push(FGroup::LossVsc, XGroup::Vm, k, j, -(2.0 * a3 * it + a2) * it / vm);
        }
        if let Some(j) = idx.pfp_pos[k] {
            g.push(FGroup::LossVsc, XGroup::PfpVsc, k, j, -1.0);
        }
        if let Some(j) = idx.pfn_pos[k] {
            g.push(FGroup::LossVsc, XGroup::PfnVsc, k, j, -1.0);
        }

        let vn = negative_pole_vm(vsc, vars);
        let vp = vars.vm[vsc.bus_dc_p];
        if let Some(j) = idx.pfp_pos[k] {
            g.push(FGroup::BalanceVsc, XGroup::PfpVsc, k, j, vn);
        }
        if let Some(j) = idx.pfn_pos[k] {
            g.push(FGroup::BalanceVsc, XGroup::PfnVsc, k, j, vp);
        }
        if let Some(j) = idx.vm_pos[vsc.bus_dc_p] {
            g.push(FGroup::BalanceVsc, XGroup::Vm, k, j, vars.vsc_pfn[k]);
        }
        if let Some(j) = vsc.bus_dc_n.and_then(|n| idx.vm_pos[n]) {
            g.push(FGroup::BalanceVsc, XGroup::Vm, k, j, vars.vsc_pfp[k]);
        }
    }
    for (i, &k) in idx.k_vsc_i.iter().enumerate() {
        let vsc = &net.vscs[k];
        let (pt, qt) = (vars.vsc_pt[k], vars.vsc_qt[k]);
        let vm = vars.vm[vsc.bus_ac];
        if let Some(j) = idx.pt_pos[k] {
            g.push(FGroup::CurrentVsc, XGroup::PtVsc, i, j, 2.0 * pt / (vm * vm));
        }
        if let Some(j) = idx.qt_pos[k] {
            g.push(FGroup::CurrentVsc, XGroup::QtVsc, i, j, 2.0 * qt / (vm * vm));
        }
        if let Some(j) = idx.vm_pos[vsc.bus_ac] {
            g.push(FGroup::CurrentVsc, XGroup::Vm, i, j, -2.0 * (pt * pt + qt * qt) / (vm * vm * vm));
        }
    }

    // dc links: one column per link in each group
    for (k, line) in net.hvdcs.iter().enumerate() {
        g.push_bus(idx, line.from, XGroup::PfHvdc, k, one);
        g.push_bus(idx, line.from, XGroup::QfHvdc, k, jay);
        g.push_bus(idx, line.to, XGroup::PtHvdc, k, one);
        g.push_bus(idx, line.to, XGroup::QtHvdc, k, jay);

        let rpu = hvdc_rpu(line, net.sbase);
        let pf = vars.hvdc_pf[k];
        let vmf = vars.vm[line.from];
        g.push(FGroup::LossHvdc, XGroup::PfHvdc, k, k, 2.0 * rpu * pf / (vmf * vmf) - 1.0);
        g.push(FGroup::LossHvdc, XGroup::PtHvdc, k, k, -1.0);
        if let Some(j) = idx.vm_pos[line.from] {
            g.push(FGroup::LossHvdc, XGroup::Vm, k, j, -2.0 * rpu * pf * pf / (vmf * vmf * vmf));
        }

        g.push(FGroup::InjHvdc, XGroup::PfHvdc, k, k, 1.0);
        if idx.hvdc_droop_idx.contains(&k) {
            if let Some(j) = idx.vm_pos[line.from] {
                g.push(FGroup::InjHvdc, XGroup::Vm, k, j, -line.angle_droop);
            }
            if let Some(j) = idx.vm_pos[line.to] {
                g.push(FGroup::InjHvdc, XGroup::Vm, k, j, line.angle_droop);
            }
        }
    }

    // branch set-point rows
    let setpoint_groups = [
        (FGroup::Pf, &idx.k_cbr_pf, true, false),
        (FGroup::Pt, &idx.k_cbr_pt, false, false),
        (FGroup::Qf, &idx.k_cbr_qf, true, true),
        (FGroup::Qt, &idx.k_cbr_qt, false, true),
    ];
    for (row, set, from_side, reactive) in setpoint_groups {
        let part = |c: Complex64| if reactive { c.im } else { c.re };
        for (i, &k) in set.iter().enumerate() {
            let br = &net.branches[k];
            let y = &adm.prim[k];
            let (vf, vt) = (v[br.from], v[br.to]);
            let FlowPartials {
                dva_f,
                dva_t,
                dvm_f,
                dvm_t,
            } = if from_side { dsf_dv(y, vf, vt) } else { dst_dv(y, vf, vt) };
            g.push_voltage(idx, row, i, br.from, part(dva_f), part(dvm_f));
            g.push_voltage(idx, row, i, br.to, part(dva_t), part(dvm_t));
            if let Some(j) = idx.m_pos[k] {
                let (dsf, dst) = dflows_dm(y, vars.m[k], vf, vt);
                g.push(row, XGroup::M, i, j, part(if from_side { dsf } else { dst }));
            }
            if let Some(j) = idx.tau_pos[k] {
                let (dsf, dst) = dflows_dtau(y, vf, vt);
                g.push(row, XGroup::Tau, i, j, part(if from_side { dsf } else { dst }));
            }
        }
    }

    g.assemble()
}

/// Central-difference Jacobian of `residual` at `x`. Exact zeros are left out of the pattern.
pub fn finite_difference_jacobian<F>(residual: F, x: &DVector<f64>, h: f64) -> CscMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n = x.len();
    let m = residual(x).len();
    let mut coo = CooMatrix::new(m, n);
    let mut xp = x.clone();
    for j in 0..n {
        let xj = x[j];
        xp[j] = xj + h;
        let fp = residual(&xp);
        xp[j] = xj - h;
        let fm = residual(&xp);
        xp[j] = xj;
        for (i, (a, b)) in fp.iter().zip(fm.iter()).enumerate() {
            let d = (a - b) / (2.0 * h);
            if !d.is_zero() {
                coo.push(i, j, d);
            }
        }
    }
    CscMatrix::from(&coo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::options::PowerFlowOptions;
    use crate::basic::problem::AcDcProblem;
    use crate::basic::system::network::ConverterControl::{self, *};
    use crate::basic::system::network::{Limit, TapModuleControl, TapPhaseControl};
    use crate::testcases::*;
    use nalgebra::DMatrix;

    /// `max |Jc - Jfd| / max(1, |Jc|)` over all entries.
    fn agreement(pb: &AcDcProblem) -> f64 {
        let jc = DMatrix::from(&closed_form_jacobian(pb.view()));
        let jfd = DMatrix::from(&finite_difference_jacobian(
            |x| pb.residual_at(x),
            &pb.var2x(),
            1e-6,
        ));
        assert!(jc.shape() == jfd.shape());
        jc.iter()
            .zip(jfd.iter())
            .map(|(a, b)| (a - b).abs() / a.abs().max(1.0))
            .fold(0.0, f64::max)
    }

    /// Moves every unknown away from the flat start so no derivative is trivially zero.
    fn perturbed(pb: &mut AcDcProblem) {
        let x = pb.var2x();
        let x = DVector::from_fn(x.len(), |i, _| x[i] + 0.01 * ((i % 5) as f64 - 2.0) + 0.003);
        pb.update(&x);
    }

    fn check(net: &crate::basic::system::network::NetworkSnapshot) {
        let options = PowerFlowOptions::default();
        let mut pb = AcDcProblem::new(net, &options).unwrap();
        perturbed(&mut pb);
        let err = agreement(&pb);
        assert!(err < 1e-5, "closed form and finite differences disagree: {err:e}");
    }

    #[test]
    fn test_agreement_ac_networks() {
        check(&two_bus_network(0.5, 0.2));
        check(&three_bus_pv_network());
        check(&tap_network());
        check(&phase_shifter_network());
    }

    #[test]
    fn test_agreement_reactive_tap_controls() {
        for mode in [TapModuleControl::Qf, TapModuleControl::Qt] {
            let mut net = tap_network();
            net.branches[0] = net.branches[0]
                .clone()
                .regulating_q(mode, 20.0, Limit::from((0.9, 1.1)));
            check(&net);
        }
    }

    #[test]
    fn test_agreement_phase_shifter_on_receiving_end() {
        let mut net = phase_shifter_network();
        net.branches[1] = net.branches[1]
            .clone()
            .regulating_p(TapPhaseControl::Pt, -40.0, Limit::from((-0.5, 0.5)));
        check(&net);
        // both tap controls on one branch
        net.branches[1] = net.branches[1]
            .clone()
            .regulating_vm(None, 1.0, Limit::from((0.9, 1.1)));
        check(&net);
    }

    #[test]
    fn test_agreement_every_converter_pair() {
        for c1 in ConverterControl::ALL {
            for c2 in ConverterControl::ALL {
                if c1 != c2 {
                    check(&vsc_network(c1, c2));
                }
            }
        }
    }

    #[test]
    fn test_agreement_bipolar_converter() {
        check(&bipolar_vsc_network());
    }

    #[test]
    fn test_agreement_hvdc() {
        check(&hvdc_network(None));
        check(&hvdc_network(Some(3.0)));
    }

    #[test]
    fn test_agreement_zip_loads() {
        let mut net = two_bus_network(0.3, 0.1);
        net.i0[1] = Complex64::new(-0.1, -0.05);
        net.y0[1] = Complex64::new(-0.2, 0.1);
        check(&net);
    }

    #[test]
    fn test_shape_is_square() {
        let options = PowerFlowOptions::default();
        let net = vsc_network(Imax, Pdc);
        let pb = AcDcProblem::new(&net, &options).unwrap();
        let j = closed_form_jacobian(pb.view());
        assert!(j.nrows() == j.ncols() && j.nrows() == pb.var2x().len());
    }
}
