//! Mismatch vector of the mixed AC/DC system.
//!
//! Row order: `[P(i_k_p), Q(i_k_q), vsc loss, vsc balance, vsc current(k_vsc_i), hvdc loss,
//! hvdc injection, Pf(k_cbr_pf), Pt(k_cbr_pt), Qf(k_cbr_qf), Qt(k_cbr_qt)]`.

use nalgebra::DVector;
use num_complex::Complex64;

use super::problem::{StateRef, Variables};
use super::system::network::{HvdcLine, NetworkSnapshot, Vsc};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub f: DVector<f64>,
    /// Calculated injection per bus: passive network plus device draws.
    pub scalc: DVector<Complex64>,
}

impl Evaluation {
    pub fn norm_inf(&self) -> f64 {
        self.f.amax()
    }

    pub fn is_finite(&self) -> bool {
        self.f.iter().all(|v| v.is_finite())
    }
}

/// Voltage magnitude of the negative pole, zero when grounded.
#[inline]
pub(crate) fn negative_pole_vm(vsc: &Vsc, vars: &Variables) -> f64 {
    vsc.bus_dc_n.map_or(0.0, |b| vars.vm[b])
}

/// AC-side converter current (p.u.).
#[inline]
pub(crate) fn vsc_current(vsc: &Vsc, vars: &Variables, k: usize) -> f64 {
    vars.vsc_pt[k].hypot(vars.vsc_qt[k]) / vars.vm[vsc.bus_ac]
}

/// Line resistance in p.u. of the line's own DC base.
#[inline]
pub(crate) fn hvdc_rpu(line: &HvdcLine, sbase: f64) -> f64 {
    line.r / (line.vnom * line.vnom / sbase)
}

/// Power the link is asked to draw at its from terminal.
#[inline]
pub(crate) fn hvdc_target(line: &HvdcLine, sbase: f64, vars: &Variables, droop: bool) -> f64 {
    let mut p = line.pset / sbase;
    if droop {
        p += line.angle_droop * (vars.vm[line.from] - vars.vm[line.to]);
    }
    p
}

/// Adds the power drawn by converters and DC links to the passive injections.
pub(crate) fn add_device_flows(net: &NetworkSnapshot, vars: &Variables, s: &mut DVector<Complex64>) {
    for (k, vsc) in net.vscs.iter().enumerate() {
        s[vsc.bus_dc_p].re += vars.vsc_pfp[k];
        if let Some(n) = vsc.bus_dc_n {
            s[n].re += vars.vsc_pfn[k];
        }
        s[vsc.bus_ac] += Complex64::new(vars.vsc_pt[k], vars.vsc_qt[k]);
    }
    for (k, line) in net.hvdcs.iter().enumerate() {
        s[line.from] += Complex64::new(vars.hvdc_pf[k], vars.hvdc_qf[k]);
        s[line.to] += Complex64::new(vars.hvdc_pt[k], vars.hvdc_qt[k]);
    }
}

pub fn evaluate(s: StateRef<'_>) -> Evaluation {
    let StateRef {
        net,
        idx,
        vars,
        sched,
        adm,
    } = s;
    let v = vars.voltage();
    let mut scalc = adm.injections(&v);
    add_device_flows(net, vars, &mut scalc);
    let ds = &scalc - sched.sbus(&vars.vm);

    let mut f = Vec::with_capacity(idx.n_equations());
    f.extend(idx.i_k_p.iter().map(|&i| ds[i].re));
    f.extend(idx.i_k_q.iter().map(|&i| ds[i].im));

    for (k, vsc) in net.vscs.iter().enumerate() {
        let it = vsc_current(vsc, vars, k);
        f.push(
            vsc.alpha3 * it * it + vsc.alpha2 * it + vsc.alpha1
                - vars.vsc_pt[k]
                - vars.vsc_pfp[k]
                - vars.vsc_pfn[k],
        );
    }
    for (k, vsc) in net.vscs.iter().enumerate() {
        f.push(vars.vsc_pfp[k] * negative_pole_vm(vsc, vars) + vars.vsc_pfn[k] * vars.vm[vsc.bus_dc_p]);
    }
    for (&k, &imax) in idx.k_vsc_i.iter().zip(&idx.vsc_i_set) {
        let it = vsc_current(&net.vscs[k], vars, k);
        f.push(it * it - imax * imax);
    }

    for (k, line) in net.hvdcs.iter().enumerate() {
        let ratio = vars.hvdc_pf[k] / vars.vm[line.from];
        f.push(hvdc_rpu(line, net.sbase) * ratio * ratio - vars.hvdc_pf[k] - vars.hvdc_pt[k]);
    }
    for (k, line) in net.hvdcs.iter().enumerate() {
        let droop = idx.hvdc_droop_idx.contains(&k);
        f.push(vars.hvdc_pf[k] - hvdc_target(line, net.sbase, vars, droop));
    }

    let sf = |k: usize| {
        let br = &net.branches[k];
        adm.prim[k].sf(v[br.from], v[br.to])
    };
    let st = |k: usize| {
        let br = &net.branches[k];
        adm.prim[k].st(v[br.from], v[br.to])
    };
    f.extend(idx.k_cbr_pf.iter().zip(&idx.cbr_pf_set).map(|(&k, &set)| sf(k).re - set));
    f.extend(idx.k_cbr_pt.iter().zip(&idx.cbr_pt_set).map(|(&k, &set)| st(k).re - set));
    f.extend(idx.k_cbr_qf.iter().zip(&idx.cbr_qf_set).map(|(&k, &set)| sf(k).im - set));
    f.extend(idx.k_cbr_qt.iter().zip(&idx.cbr_qt_set).map(|(&k, &set)| st(k).im - set));

    Evaluation {
        f: DVector::from_vec(f),
        scalc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::options::PowerFlowOptions;
    use crate::basic::problem::AcDcProblem;
    use crate::basic::system::network::ConverterControl;
    use crate::testcases::*;

    #[test]
    fn test_flat_start_two_bus_mismatch() {
        let net = two_bus_network(0.5, 0.2);
        let options = PowerFlowOptions::default();
        let pb = AcDcProblem::new(&net, &options).unwrap();
        // flat start: no flow on the line, so the mismatch is minus the schedule
        assert!(pb.eval.f.len() == 2);
        assert!((pb.eval.f[0] - 0.5).abs() < 1e-12);
        assert!((pb.eval.f[1] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_converter_rows_follow_the_loss_model() {
        let net = vsc_network(ConverterControl::VmDc, ConverterControl::VmAc);
        let options = PowerFlowOptions::default();
        let mut pb = AcDcProblem::new(&net, &options).unwrap();
        pb.vars.vsc_pt[0] = 0.3;
        pb.vars.vsc_qt[0] = 0.4;
        pb.vars.vsc_pfp[0] = -0.25;
        pb.refresh();

        let vsc = &net.vscs[0];
        let it = 0.5 / pb.vars.vm[vsc.bus_ac];
        let loss = vsc.alpha3 * it * it + vsc.alpha2 * it + vsc.alpha1 - 0.3 + 0.25;
        let o = pb.idx.f_offsets();
        assert!((pb.eval.f[o[2]] - loss).abs() < 1e-12);
        // grounded negative pole: balance reduces to Pfn * Vdc
        assert!(pb.eval.f[o[3]].abs() < 1e-12);
    }

    #[test]
    fn test_hvdc_rows() {
        let net = hvdc_network(Some(2.0));
        let options = PowerFlowOptions::default();
        let pb = AcDcProblem::new(&net, &options).unwrap();
        let line = &net.hvdcs[0];
        let o = pb.idx.f_offsets();
        let pf = line.pset / net.sbase;
        let rpu = hvdc_rpu(line, net.sbase);
        let loss = rpu * (pf / line.vset_f).powi(2);
        // initial guess draws pset and returns pset
        assert!((pb.eval.f[o[5]] - loss).abs() < 1e-12);
        let droop = line.angle_droop * (line.vset_f - line.vset_t);
        assert!((pb.eval.f[o[6]] + droop).abs() < 1e-12);
    }
}
