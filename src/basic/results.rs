//! Solution extraction and result tables.
//!
//! Powers are reported in MW/MVAr, voltages and currents in p.u., angles in rad.

mod res_display;

use std::fmt;
use std::time::Duration;

use nalgebra::DVector;
use num_complex::Complex64;
use serde::Serialize;
use tabled::{settings::Style, Table};

use super::newtonpf::SolverState;
use super::problem::AcDcProblem;
use super::residual::vsc_current;
use res_display::{BranchResTable, BusResTable, FloatWrapper, HvdcResTable, VscResTable};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusResult {
    pub name: String,
    pub v: Complex64,
    /// Calculated injection, device draws included.
    pub s: Complex64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchResult {
    pub name: String,
    pub sf: Complex64,
    pub st: Complex64,
    pub i_from: Complex64,
    pub i_to: Complex64,
    /// `Vf - Vt` (p.u.).
    pub vbranch: Complex64,
    /// Active power at the from side over the rating; zero for unrated branches.
    pub loading: f64,
    pub losses: Complex64,
    pub m: f64,
    pub tau: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VscResult {
    pub name: String,
    /// Power drawn from the positive and negative poles.
    pub pfp: f64,
    pub pfn: f64,
    /// Power drawn from the AC terminal.
    pub st: Complex64,
    /// AC-side current (p.u.).
    pub current: f64,
    pub loading: f64,
    pub losses: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HvdcResult {
    pub name: String,
    pub sf: Complex64,
    pub st: Complex64,
    pub loading: f64,
    pub losses: f64,
}

/// Outcome of [`newton_acdc_pf`](super::newtonpf::newton_acdc_pf).
///
/// Produced for diverged runs as well, from the last iterate.
#[derive(Debug, Clone, Serialize)]
pub struct PowerFlowSolution {
    pub converged: bool,
    pub state: SolverState,
    pub message: String,
    pub iterations: usize,
    pub elapsed: Duration,
    /// Infinity norm of the final residual.
    pub norm_f: f64,
    pub buses: Vec<BusResult>,
    pub branches: Vec<BranchResult>,
    pub vscs: Vec<VscResult>,
    pub hvdcs: Vec<HvdcResult>,
}

#[inline]
fn ratio(value: f64, rate: f64) -> f64 {
    if rate > 0.0 { value / rate } else { 0.0 }
}

pub(crate) fn extract_solution(
    pb: &AcDcProblem<'_>,
    state: SolverState,
    message: String,
    iterations: usize,
    elapsed: Duration,
) -> PowerFlowSolution {
    let net = pb.net;
    let sbase = net.sbase;
    let vars = &pb.vars;
    let v: DVector<Complex64> = vars.voltage();

    let buses = net
        .buses
        .iter()
        .enumerate()
        .map(|(i, bus)| BusResult {
            name: bus.name.clone(),
            v: v[i],
            s: pb.eval.scalc[i] * sbase,
        })
        .collect();

    let branches = net
        .branches
        .iter()
        .enumerate()
        .map(|(k, br)| {
            let y = &pb.adm.prim[k];
            let (vf, vt) = (v[br.from], v[br.to]);
            let sf = y.sf(vf, vt) * sbase;
            let st = y.st(vf, vt) * sbase;
            BranchResult {
                name: br.name.clone(),
                sf,
                st,
                i_from: y.i_from(vf, vt),
                i_to: y.i_to(vf, vt),
                vbranch: vf - vt,
                loading: ratio(sf.re, br.rate),
                losses: sf + st,
                m: vars.m[k],
                tau: vars.tau[k],
            }
        })
        .collect();

    let vscs = net
        .vscs
        .iter()
        .enumerate()
        .map(|(k, vsc)| {
            let st = Complex64::new(vars.vsc_pt[k], vars.vsc_qt[k]) * sbase;
            let pfp = vars.vsc_pfp[k] * sbase;
            let pfn = vars.vsc_pfn[k] * sbase;
            VscResult {
                name: vsc.name.clone(),
                pfp,
                pfn,
                st,
                current: vsc_current(vsc, vars, k),
                loading: ratio(st.norm(), vsc.rate),
                losses: st.re + pfp + pfn,
            }
        })
        .collect();

    let hvdcs = net
        .hvdcs
        .iter()
        .enumerate()
        .map(|(k, line)| {
            let sf = Complex64::new(vars.hvdc_pf[k], vars.hvdc_qf[k]) * sbase;
            let st = Complex64::new(vars.hvdc_pt[k], vars.hvdc_qt[k]) * sbase;
            HvdcResult {
                name: line.name.clone(),
                sf,
                st,
                loading: ratio(sf.re, line.rate),
                losses: sf.re + st.re,
            }
        })
        .collect();

    PowerFlowSolution {
        converged: state == SolverState::Converged,
        state,
        message,
        iterations,
        elapsed,
        norm_f: pb.error(),
        buses,
        branches,
        vscs,
        hvdcs,
    }
}

impl PowerFlowSolution {
    pub fn bus_table(&self) -> String {
        let rows = self.buses.iter().map(|b| BusResTable {
            Bus: b.name.clone(),
            Vm: FloatWrapper::new(b.v.norm(), 3),
            Va: FloatWrapper::new(b.v.arg().to_degrees(), 3),
            P_mw: FloatWrapper::new(b.s.re, 5),
            Q_mvar: FloatWrapper::new(b.s.im, 5),
        });
        Table::new(rows).with(Style::markdown()).to_string()
    }

    pub fn branch_table(&self) -> String {
        let rows = self.branches.iter().map(|b| BranchResTable {
            branch: b.name.clone(),
            p_from_mw: FloatWrapper::new(b.sf.re, 5),
            q_from_mvar: FloatWrapper::new(b.sf.im, 5),
            p_to_mw: FloatWrapper::new(b.st.re, 5),
            q_to_mvar: FloatWrapper::new(b.st.im, 5),
            pl_mw: FloatWrapper::new(b.losses.re, 5),
            ql_mvar: FloatWrapper::new(b.losses.im, 5),
            m: FloatWrapper::new(b.m, 4),
            tau_degree: FloatWrapper::new(b.tau.to_degrees(), 3),
            loading_percent: FloatWrapper::new(b.loading * 100.0, 2),
        });
        Table::new(rows).with(Style::markdown()).to_string()
    }

    pub fn vsc_table(&self) -> String {
        let rows = self.vscs.iter().map(|c| VscResTable {
            vsc: c.name.clone(),
            p_dc_pos_mw: FloatWrapper::new(c.pfp, 5),
            p_dc_neg_mw: FloatWrapper::new(c.pfn, 5),
            p_ac_mw: FloatWrapper::new(c.st.re, 5),
            q_ac_mvar: FloatWrapper::new(c.st.im, 5),
            i_pu: FloatWrapper::new(c.current, 4),
            pl_mw: FloatWrapper::new(c.losses, 5),
            loading_percent: FloatWrapper::new(c.loading * 100.0, 2),
        });
        Table::new(rows).with(Style::markdown()).to_string()
    }

    pub fn hvdc_table(&self) -> String {
        let rows = self.hvdcs.iter().map(|h| HvdcResTable {
            hvdc: h.name.clone(),
            p_from_mw: FloatWrapper::new(h.sf.re, 5),
            q_from_mvar: FloatWrapper::new(h.sf.im, 5),
            p_to_mw: FloatWrapper::new(h.st.re, 5),
            q_to_mvar: FloatWrapper::new(h.st.im, 5),
            pl_mw: FloatWrapper::new(h.losses, 5),
            loading_percent: FloatWrapper::new(h.loading * 100.0, 2),
        });
        Table::new(rows).with(Style::markdown()).to_string()
    }
}

impl fmt::Display for PowerFlowSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} after {} iterations ({:?}), |F| = {:.3e}",
            self.message, self.iterations, self.elapsed, self.norm_f
        )?;
        writeln!(f, "{}", self.bus_table())?;
        if !self.branches.is_empty() {
            writeln!(f, "{}", self.branch_table())?;
        }
        if !self.vscs.is_empty() {
            writeln!(f, "{}", self.vsc_table())?;
        }
        if !self.hvdcs.is_empty() {
            writeln!(f, "{}", self.hvdc_table())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::options::PowerFlowOptions;
    use crate::basic::system::network::ConverterControl;
    use crate::testcases::*;

    #[test]
    fn test_flat_start_extraction() {
        let net = two_bus_network(0.5, 0.2);
        let options = PowerFlowOptions::default();
        let pb = AcDcProblem::new(&net, &options).unwrap();
        let sol = extract_solution(&pb, SolverState::Diverged, "stopped".into(), 0, Duration::ZERO);
        assert!(!sol.converged);
        assert!(sol.buses.len() == 2 && sol.branches.len() == 1);
        // no voltage difference, no flow
        assert!(sol.branches[0].sf.norm() < 1e-12);
        assert!((sol.norm_f - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_converter_losses_in_mw() {
        let net = vsc_network(ConverterControl::VmDc, ConverterControl::VmAc);
        let options = PowerFlowOptions::default();
        let mut pb = AcDcProblem::new(&net, &options).unwrap();
        pb.vars.vsc_pt[0] = 0.31;
        pb.vars.vsc_pfp[0] = -0.3;
        pb.refresh();
        let sol = extract_solution(&pb, SolverState::Converged, "converged".into(), 3, Duration::ZERO);
        let c = &sol.vscs[0];
        assert!((c.losses - 1.0).abs() < 1e-9);
        assert!((c.loading - 31.0 / net.vscs[0].rate).abs() < 1e-9);
    }

    #[test]
    fn test_tables_list_every_device() {
        let net = hvdc_network(None);
        let options = PowerFlowOptions::default();
        let pb = AcDcProblem::new(&net, &options).unwrap();
        let sol = extract_solution(&pb, SolverState::Converged, "converged".into(), 0, Duration::ZERO);
        let text = sol.to_string();
        for bus in &net.buses {
            assert!(text.contains(bus.name.as_str()));
        }
        assert!(text.contains(net.hvdcs[0].name.as_str()));
        assert!(sol.hvdc_table().lines().count() == 2 + net.hvdcs.len());
    }
}
