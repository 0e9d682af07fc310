//! Mutable solve state: control classification, physical variables and the admittance cache.

use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;
use tracing::debug;

use super::error::ConfigError;
use super::indices::{classify, ControlIndices, ControlState, Status};
use super::jacobian::{closed_form_jacobian, finite_difference_jacobian};
use super::options::{JacobianMode, PowerFlowOptions};
use super::residual::{evaluate, Evaluation};
use super::system::admittance::AdmittanceCache;
use super::system::network::NetworkSnapshot;

/// Every physical quantity the solver may treat as unknown, in physical units of p.u./rad.
#[derive(Debug, Clone, PartialEq)]
pub struct Variables {
    pub vm: DVector<f64>,
    pub va: DVector<f64>,
    pub vsc_pfp: DVector<f64>,
    pub vsc_pfn: DVector<f64>,
    pub vsc_pt: DVector<f64>,
    pub vsc_qt: DVector<f64>,
    pub hvdc_pf: DVector<f64>,
    pub hvdc_pt: DVector<f64>,
    pub hvdc_qf: DVector<f64>,
    pub hvdc_qt: DVector<f64>,
    pub m: DVector<f64>,
    pub tau: DVector<f64>,
}

fn gather(src: &DVector<f64>, set: &[usize], out: &mut Vec<f64>) {
    out.extend(set.iter().map(|&i| src[i]));
}

fn scatter(dst: &mut DVector<f64>, set: &[usize], src: &[f64]) {
    for (&i, &v) in set.iter().zip(src) {
        dst[i] = v;
    }
}

impl Variables {
    pub fn from_network(net: &NetworkSnapshot) -> Self {
        let nbus = net.nbus();
        let mut vm = DVector::from_iterator(nbus, net.v0.iter().map(|v| v.norm()));
        let mut va = DVector::from_iterator(nbus, net.v0.iter().map(|v| v.arg()));
        for (i, bus) in net.buses.iter().enumerate() {
            if bus.grounded {
                vm[i] = 0.0;
                va[i] = 0.0;
            }
        }
        let nvsc = net.vscs.len();
        let nhvdc = net.hvdcs.len();
        let pset = DVector::from_iterator(nhvdc, net.hvdcs.iter().map(|h| h.pset / net.sbase));
        Self {
            vm,
            va,
            vsc_pfp: DVector::zeros(nvsc),
            vsc_pfn: DVector::zeros(nvsc),
            vsc_pt: DVector::zeros(nvsc),
            vsc_qt: DVector::zeros(nvsc),
            hvdc_pt: -&pset,
            hvdc_pf: pset,
            hvdc_qf: DVector::zeros(nhvdc),
            hvdc_qt: DVector::zeros(nhvdc),
            m: DVector::from_iterator(net.nbr(), net.branches.iter().map(|b| b.tap_module)),
            tau: DVector::from_iterator(net.nbr(), net.branches.iter().map(|b| b.tap_phase)),
        }
    }

    pub fn voltage(&self) -> DVector<Complex64> {
        self.vm.zip_map(&self.va, Complex64::from_polar)
    }

    /// `e^{j Va}` per bus.
    pub fn unit_voltage(&self) -> DVector<Complex64> {
        self.va.map(|a| Complex64::from_polar(1.0, a))
    }

    /// Packs the unknowns selected by `idx` into a vector.
    pub fn to_x(&self, idx: &ControlIndices) -> DVector<f64> {
        let mut x = Vec::with_capacity(idx.n_unknowns());
        gather(&self.va, &idx.i_u_va, &mut x);
        gather(&self.vm, &idx.i_u_vm, &mut x);
        gather(&self.vsc_pfp, &idx.u_vsc_pfp, &mut x);
        gather(&self.vsc_pfn, &idx.u_vsc_pfn, &mut x);
        gather(&self.vsc_pt, &idx.u_vsc_pt, &mut x);
        gather(&self.vsc_qt, &idx.u_vsc_qt, &mut x);
        x.extend(self.hvdc_pf.iter());
        x.extend(self.hvdc_pt.iter());
        x.extend(self.hvdc_qf.iter());
        x.extend(self.hvdc_qt.iter());
        gather(&self.m, &idx.u_cbr_m, &mut x);
        gather(&self.tau, &idx.u_cbr_tau, &mut x);
        DVector::from_vec(x)
    }

    /// Inverse of [`Variables::to_x`].
    pub fn set_x(&mut self, idx: &ControlIndices, x: &DVector<f64>) {
        let o = idx.x_offsets();
        let w = idx.x_widths();
        let part = |g: usize| &x.as_slice()[o[g]..o[g] + w[g]];
        scatter(&mut self.va, &idx.i_u_va, part(0));
        scatter(&mut self.vm, &idx.i_u_vm, part(1));
        scatter(&mut self.vsc_pfp, &idx.u_vsc_pfp, part(2));
        scatter(&mut self.vsc_pfn, &idx.u_vsc_pfn, part(3));
        scatter(&mut self.vsc_pt, &idx.u_vsc_pt, part(4));
        scatter(&mut self.vsc_qt, &idx.u_vsc_qt, part(5));
        self.hvdc_pf.copy_from_slice(part(6));
        self.hvdc_pt.copy_from_slice(part(7));
        self.hvdc_qf.copy_from_slice(part(8));
        self.hvdc_qt.copy_from_slice(part(9));
        scatter(&mut self.m, &idx.u_cbr_m, part(10));
        scatter(&mut self.tau, &idx.u_cbr_tau, part(11));
    }

    /// Imposes the set-points carried by the index sets.
    pub fn apply_targets(&mut self, idx: &ControlIndices) {
        for &(bus, v) in &idx.vm_targets {
            self.vm[bus] = v;
        }
        for &(bus, a) in &idx.va_targets {
            self.va[bus] = a;
        }
        for &(k, p) in &idx.pfp_targets {
            self.vsc_pfp[k] = p;
        }
        for &(k, p) in &idx.pt_targets {
            self.vsc_pt[k] = p;
        }
        for &(k, q) in &idx.qt_targets {
            self.vsc_qt[k] = q;
        }
    }

    /// Moves converters on a current row away from zero AC power, where the row has no slope.
    pub fn seed_current_limits(&mut self, net: &NetworkSnapshot, idx: &ControlIndices) {
        for (&k, &imax) in idx.k_vsc_i.iter().zip(&idx.vsc_i_set) {
            if self.vsc_pt[k].hypot(self.vsc_qt[k]) > 1e-6 {
                continue;
            }
            let s = imax * self.vm[net.vscs[k].bus_ac];
            if idx.qt_pos[k].is_some() {
                self.vsc_qt[k] = s;
            } else if idx.pt_pos[k].is_some() {
                self.vsc_pt[k] = s;
            }
        }
    }
}

/// ZIP injection schedule. `s0` is edited by the reactive limit and slack controls.
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub s0: DVector<Complex64>,
    pub i0: DVector<Complex64>,
    pub y0: DVector<Complex64>,
}

impl Scheduled {
    pub fn from_network(net: &NetworkSnapshot) -> Self {
        Self {
            s0: DVector::from_column_slice(&net.s0),
            i0: DVector::from_column_slice(&net.i0),
            y0: DVector::from_column_slice(&net.y0),
        }
    }

    /// `S0 + I0 Vm + Y0 Vm^2`
    pub fn sbus(&self, vm: &DVector<f64>) -> DVector<Complex64> {
        DVector::from_fn(self.s0.len(), |i, _| {
            self.s0[i] + self.i0[i] * vm[i] + self.y0[i] * (vm[i] * vm[i])
        })
    }

    pub fn dsbus_dvm(&self, vm: &DVector<f64>) -> DVector<Complex64> {
        DVector::from_fn(self.s0.len(), |i, _| self.i0[i] + self.y0[i] * (2.0 * vm[i]))
    }
}

/// Borrowed view handed to the residual and Jacobian routines.
#[derive(Clone, Copy)]
pub struct StateRef<'a> {
    pub net: &'a NetworkSnapshot,
    pub idx: &'a ControlIndices,
    pub vars: &'a Variables,
    pub sched: &'a Scheduled,
    pub adm: &'a AdmittanceCache,
}

pub struct AcDcProblem<'a> {
    pub net: &'a NetworkSnapshot,
    pub options: &'a PowerFlowOptions,
    pub state: ControlState,
    pub idx: ControlIndices,
    pub vars: Variables,
    pub sched: Scheduled,
    pub adm: AdmittanceCache,
    /// Residual and calculated injections at `vars`.
    pub eval: Evaluation,
    controlled: Vec<usize>,
}

impl<'a> AcDcProblem<'a> {
    /// Validates the snapshot, classifies its controls and evaluates the initial residual.
    pub fn new(net: &'a NetworkSnapshot, options: &'a PowerFlowOptions) -> Result<Self, ConfigError> {
        net.validate()?;
        let mut state = ControlState::from_network(net);
        if !options.control_taps_modules {
            state.tap_module.fill(Status::Fixed);
        }
        if !options.control_taps_phase {
            state.tap_phase.fill(Status::Fixed);
        }
        let mut vars = Variables::from_network(net);
        let idx = classify(net, &state)?;
        vars.apply_targets(&idx);
        vars.seed_current_limits(net, &idx);
        let adm = AdmittanceCache::build(net, &vars.m, &vars.tau)?;
        let sched = Scheduled::from_network(net);
        let eval = Evaluation::default();
        let mut problem = Self {
            net,
            options,
            state,
            controlled: idx.controlled_branches(),
            idx,
            vars,
            sched,
            adm,
            eval,
        };
        problem.check_square()?;
        problem.refresh();
        Ok(problem)
    }

    fn check_square(&self) -> Result<(), ConfigError> {
        let (unknowns, equations) = (self.idx.n_unknowns(), self.idx.n_equations());
        if unknowns != equations {
            return Err(ConfigError::NotSquare {
                unknowns,
                equations,
            });
        }
        Ok(())
    }

    pub fn view(&self) -> StateRef<'_> {
        StateRef {
            net: self.net,
            idx: &self.idx,
            vars: &self.vars,
            sched: &self.sched,
            adm: &self.adm,
        }
    }

    /// Reclassifies after a control change and refreshes the residual.
    pub fn rebuild(&mut self) -> Result<(), ConfigError> {
        self.idx = classify(self.net, &self.state)?;
        self.vars.apply_targets(&self.idx);
        self.vars.seed_current_limits(self.net, &self.idx);
        self.controlled = self.idx.controlled_branches();
        self.check_square()?;
        self.refresh();
        debug!(
            unknowns = self.idx.n_unknowns(),
            "control layout rebuilt"
        );
        Ok(())
    }

    pub fn var2x(&self) -> DVector<f64> {
        self.vars.to_x(&self.idx)
    }

    /// Writes `x` into the variables and patches the admittance of controlled branches.
    pub fn x2var(&mut self, x: &DVector<f64>) {
        self.vars.set_x(&self.idx, x);
        self.adm
            .patch_taps(self.net, &self.controlled, &self.vars.m, &self.vars.tau);
    }

    /// `x2var` followed by a residual evaluation.
    pub fn update(&mut self, x: &DVector<f64>) {
        self.x2var(x);
        self.refresh();
    }

    pub fn refresh(&mut self) {
        self.eval = evaluate(self.view());
    }

    /// Patches the admittance entries of `branches` after an edit of `vars.m`/`vars.tau`.
    pub fn patch_branches(&mut self, branches: &[usize]) {
        self.adm
            .patch_taps(self.net, branches, &self.vars.m, &self.vars.tau);
    }

    /// Residual at `x` without touching the problem state.
    pub fn residual_at(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut vars = self.vars.clone();
        vars.set_x(&self.idx, x);
        let mut adm = self.adm.clone();
        adm.patch_taps(self.net, &self.controlled, &vars.m, &vars.tau);
        evaluate(StateRef {
            net: self.net,
            idx: &self.idx,
            vars: &vars,
            sched: &self.sched,
            adm: &adm,
        })
        .f
    }

    pub fn jacobian(&self) -> CscMatrix<f64> {
        match self.options.jacobian {
            JacobianMode::ClosedForm => closed_form_jacobian(self.view()),
            JacobianMode::FiniteDifference => finite_difference_jacobian(
                |x| self.residual_at(x),
                &self.var2x(),
                self.options.fd_step,
            ),
        }
    }

    /// Infinity norm of the current residual.
    pub fn error(&self) -> f64 {
        self.eval.norm_inf()
    }

    /// Label of every unknown, in `x` order.
    pub fn x_names(&self) -> Vec<String> {
        let net = self.net;
        let idx = &self.idx;
        let bus = |i: usize| net.buses[i].name.as_str();
        let vsc = |k: usize| net.vscs[k].name.as_str();
        let mut names = Vec::with_capacity(idx.n_unknowns());
        names.extend(idx.i_u_va.iter().map(|&i| format!("Va {}", bus(i))));
        names.extend(idx.i_u_vm.iter().map(|&i| format!("Vm {}", bus(i))));
        names.extend(idx.u_vsc_pfp.iter().map(|&k| format!("Pfp {}", vsc(k))));
        names.extend(idx.u_vsc_pfn.iter().map(|&k| format!("Pfn {}", vsc(k))));
        names.extend(idx.u_vsc_pt.iter().map(|&k| format!("Pt {}", vsc(k))));
        names.extend(idx.u_vsc_qt.iter().map(|&k| format!("Qt {}", vsc(k))));
        for prefix in ["Pf", "Pt", "Qf", "Qt"] {
            names.extend(net.hvdcs.iter().map(|h| format!("{prefix} {}", h.name)));
        }
        names.extend(idx.u_cbr_m.iter().map(|&k| format!("m {}", net.branches[k].name)));
        names.extend(idx.u_cbr_tau.iter().map(|&k| format!("tau {}", net.branches[k].name)));
        names
    }

    /// Label of every residual entry, in `f` order.
    pub fn fx_names(&self) -> Vec<String> {
        let net = self.net;
        let idx = &self.idx;
        let bus = |i: usize| net.buses[i].name.as_str();
        let branch = |k: usize| net.branches[k].name.as_str();
        let mut names = Vec::with_capacity(idx.n_equations());
        names.extend(idx.i_k_p.iter().map(|&i| format!("P {}", bus(i))));
        names.extend(idx.i_k_q.iter().map(|&i| format!("Q {}", bus(i))));
        names.extend(net.vscs.iter().map(|v| format!("loss {}", v.name)));
        names.extend(net.vscs.iter().map(|v| format!("balance {}", v.name)));
        names.extend(idx.k_vsc_i.iter().map(|&k| format!("Imax {}", net.vscs[k].name)));
        names.extend(net.hvdcs.iter().map(|h| format!("loss {}", h.name)));
        names.extend(net.hvdcs.iter().map(|h| format!("inj {}", h.name)));
        names.extend(idx.k_cbr_pf.iter().map(|&k| format!("Pf {}", branch(k))));
        names.extend(idx.k_cbr_pt.iter().map(|&k| format!("Pt {}", branch(k))));
        names.extend(idx.k_cbr_qf.iter().map(|&k| format!("Qf {}", branch(k))));
        names.extend(idx.k_cbr_qt.iter().map(|&k| format!("Qt {}", branch(k))));
        names
    }
}
