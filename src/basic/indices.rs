//! Control classification.
//!
//! [`ControlState`] is the mutable, tagged description of which physical quantities are free,
//! fixed by the user, or frozen at a limit. [`classify`] turns it into a fresh
//! [`ControlIndices`]: the unknown/equation index sets, the set-points they carry and lookup
//! tables from device to position. Nothing is ever deleted from an index set in place; a
//! reclassification edits the state and classifies again.

use tracing::warn;

use super::error::ConfigError;
use super::system::network::{
    ControlSlot, ConverterControl, HvdcControlMode, NetworkSnapshot, TapModuleControl,
    TapPhaseControl,
};
use super::vsc_table;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Solved for.
    Free,
    /// Given as input.
    Fixed,
    /// Frozen by the solver after hitting a limit.
    AtLimit,
}

impl Status {
    #[inline]
    pub fn is_known(self) -> bool {
        self != Status::Free
    }

    fn from_known(known: bool) -> Self {
        if known { Status::Fixed } else { Status::Free }
    }
}

/// `vm`/`va` known means the voltage quantity is given; `p`/`q` known means the injection is
/// scheduled, i.e. the bus has a balance equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusControl {
    pub vm: Status,
    pub va: Status,
    pub p: Status,
    pub q: Status,
}

#[derive(Debug, Clone)]
pub struct ControlState {
    pub bus: Vec<BusControl>,
    /// `Free` while the tap module is a controlled unknown.
    pub tap_module: Vec<Status>,
    pub tap_phase: Vec<Status>,
    pub vsc_slots: Vec<[ControlSlot; 2]>,
}

impl ControlState {
    pub fn from_network(net: &NetworkSnapshot) -> Self {
        let bus = net
            .buses
            .iter()
            .map(|b| {
                if b.grounded {
                    BusControl {
                        vm: Status::Fixed,
                        va: Status::Fixed,
                        p: Status::Free,
                        q: Status::Free,
                    }
                } else {
                    BusControl {
                        vm: Status::from_known(b.vm_fixed),
                        va: Status::from_known(b.va_fixed),
                        p: Status::from_known(b.p_balance),
                        q: Status::from_known(b.q_balance),
                    }
                }
            })
            .collect();
        let tap_module = net
            .branches
            .iter()
            .map(|b| Status::from_known(b.tap_module_control == TapModuleControl::Fixed))
            .collect();
        let tap_phase = net
            .branches
            .iter()
            .map(|b| Status::from_known(b.tap_phase_control == TapPhaseControl::Fixed))
            .collect();
        let vsc_slots = net.vscs.iter().map(|v| v.controls).collect();
        Self {
            bus,
            tap_module,
            tap_phase,
            vsc_slots,
        }
    }
}

/// Column groups of the unknown vector, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XGroup {
    Va,
    Vm,
    PfpVsc,
    PfnVsc,
    PtVsc,
    QtVsc,
    PfHvdc,
    PtHvdc,
    QfHvdc,
    QtHvdc,
    M,
    Tau,
}

impl XGroup {
    pub const COUNT: usize = 12;
}

/// Row groups of the residual vector, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FGroup {
    P,
    Q,
    LossVsc,
    BalanceVsc,
    CurrentVsc,
    LossHvdc,
    InjHvdc,
    Pf,
    Pt,
    Qf,
    Qt,
}

impl FGroup {
    pub const COUNT: usize = 11;
}

#[derive(Debug, Clone, Default)]
pub struct ControlIndices {
    pub nbus: usize,
    pub nvsc: usize,
    pub nhvdc: usize,

    // effective bus bookkeeping after device controls
    pub vm_known: Vec<bool>,
    pub va_known: Vec<bool>,
    pub p_row: Vec<bool>,
    pub q_row: Vec<bool>,

    pub i_u_va: Vec<usize>,
    pub i_u_vm: Vec<usize>,
    pub i_k_p: Vec<usize>,
    pub i_k_q: Vec<usize>,

    pub u_vsc_pfp: Vec<usize>,
    pub u_vsc_pfn: Vec<usize>,
    pub u_vsc_pt: Vec<usize>,
    pub u_vsc_qt: Vec<usize>,
    pub k_vsc_i: Vec<usize>,
    /// Current limit (p.u.) of each converter in `k_vsc_i`.
    pub vsc_i_set: Vec<f64>,

    pub hvdc_droop_idx: Vec<usize>,

    pub u_cbr_m: Vec<usize>,
    pub u_cbr_tau: Vec<usize>,
    pub k_cbr_pf: Vec<usize>,
    pub k_cbr_pt: Vec<usize>,
    pub k_cbr_qf: Vec<usize>,
    pub k_cbr_qt: Vec<usize>,
    // set-points (p.u.) aligned with the k_cbr_* sets
    pub cbr_pf_set: Vec<f64>,
    pub cbr_pt_set: Vec<f64>,
    pub cbr_qf_set: Vec<f64>,
    pub cbr_qt_set: Vec<f64>,

    /// Values imposed on the state whenever the layout is rebuilt.
    pub vm_targets: Vec<(usize, f64)>,
    pub va_targets: Vec<(usize, f64)>,
    pub pfp_targets: Vec<(usize, f64)>,
    pub pt_targets: Vec<(usize, f64)>,
    pub qt_targets: Vec<(usize, f64)>,

    // device -> position inside its group
    pub va_pos: Vec<Option<usize>>,
    pub vm_pos: Vec<Option<usize>>,
    pub p_pos: Vec<Option<usize>>,
    pub q_pos: Vec<Option<usize>>,
    pub pfp_pos: Vec<Option<usize>>,
    pub pfn_pos: Vec<Option<usize>>,
    pub pt_pos: Vec<Option<usize>>,
    pub qt_pos: Vec<Option<usize>>,
    pub m_pos: Vec<Option<usize>>,
    pub tau_pos: Vec<Option<usize>>,
}

fn positions(set: &[usize], n: usize) -> Vec<Option<usize>> {
    let mut pos = vec![None; n];
    for (i, &k) in set.iter().enumerate() {
        pos[k] = Some(i);
    }
    pos
}

fn offsets<const N: usize>(widths: [usize; N]) -> [usize; N] {
    let mut out = [0; N];
    let mut acc = 0;
    for (o, w) in out.iter_mut().zip(widths) {
        *o = acc;
        acc += w;
    }
    out
}

impl ControlIndices {
    pub fn x_widths(&self) -> [usize; XGroup::COUNT] {
        [
            self.i_u_va.len(),
            self.i_u_vm.len(),
            self.u_vsc_pfp.len(),
            self.u_vsc_pfn.len(),
            self.u_vsc_pt.len(),
            self.u_vsc_qt.len(),
            self.nhvdc,
            self.nhvdc,
            self.nhvdc,
            self.nhvdc,
            self.u_cbr_m.len(),
            self.u_cbr_tau.len(),
        ]
    }

    pub fn f_widths(&self) -> [usize; FGroup::COUNT] {
        [
            self.i_k_p.len(),
            self.i_k_q.len(),
            self.nvsc,
            self.nvsc,
            self.k_vsc_i.len(),
            self.nhvdc,
            self.nhvdc,
            self.k_cbr_pf.len(),
            self.k_cbr_pt.len(),
            self.k_cbr_qf.len(),
            self.k_cbr_qt.len(),
        ]
    }

    pub fn x_offsets(&self) -> [usize; XGroup::COUNT] {
        offsets(self.x_widths())
    }

    pub fn f_offsets(&self) -> [usize; FGroup::COUNT] {
        offsets(self.f_widths())
    }

    pub fn n_unknowns(&self) -> usize {
        self.x_widths().iter().sum()
    }

    pub fn n_equations(&self) -> usize {
        self.f_widths().iter().sum()
    }

    /// Branches whose admittance depends on the unknown vector.
    pub fn controlled_branches(&self) -> Vec<usize> {
        let mut k: Vec<usize> = self.u_cbr_m.iter().chain(&self.u_cbr_tau).copied().collect();
        k.sort_unstable();
        k.dedup();
        k
    }

    fn finish(&mut self, nbr: usize) {
        let n = self.nbus;
        self.i_u_va = (0..n).filter(|&i| !self.va_known[i]).collect();
        self.i_u_vm = (0..n).filter(|&i| !self.vm_known[i]).collect();
        self.i_k_p = (0..n).filter(|&i| self.p_row[i]).collect();
        self.i_k_q = (0..n).filter(|&i| self.q_row[i]).collect();

        self.va_pos = positions(&self.i_u_va, n);
        self.vm_pos = positions(&self.i_u_vm, n);
        self.p_pos = positions(&self.i_k_p, n);
        self.q_pos = positions(&self.i_k_q, n);
        self.pfp_pos = positions(&self.u_vsc_pfp, self.nvsc);
        self.pfn_pos = positions(&self.u_vsc_pfn, self.nvsc);
        self.pt_pos = positions(&self.u_vsc_pt, self.nvsc);
        self.qt_pos = positions(&self.u_vsc_qt, self.nvsc);
        self.m_pos = positions(&self.u_cbr_m, nbr);
        self.tau_pos = positions(&self.u_cbr_tau, nbr);
    }
}

/// Picks the regulated bus of a converter slot, falling back to the converter terminal.
fn resolve_bus(slot: &ControlSlot, default: usize, nbus: usize, vsc: &str) -> usize {
    match slot.bus {
        Some(b) if b < nbus => b,
        Some(b) => {
            warn!(
                vsc,
                bus = b,
                control = ?slot.kind,
                "controlled bus outside of the island, using the converter terminal"
            );
            default
        }
        None => default,
    }
}

/// Builds the index sets for the current control state.
pub fn classify(net: &NetworkSnapshot, state: &ControlState) -> Result<ControlIndices, ConfigError> {
    let nbus = net.nbus();
    let sbase = net.sbase;
    let mut idx = ControlIndices {
        nbus,
        nvsc: net.vscs.len(),
        nhvdc: net.hvdcs.len(),
        vm_known: state.bus.iter().map(|b| b.vm.is_known()).collect(),
        va_known: state.bus.iter().map(|b| b.va.is_known()).collect(),
        p_row: state.bus.iter().map(|b| b.p.is_known()).collect(),
        q_row: state.bus.iter().map(|b| b.q.is_known()).collect(),
        ..Default::default()
    };

    for (k, br) in net.branches.iter().enumerate() {
        if state.tap_module[k] == Status::Free {
            match br.tap_module_control {
                TapModuleControl::Vm => {
                    let bus = br.regulated_bus.unwrap_or(br.to);
                    if bus >= nbus {
                        warn!(
                            branch = br.name.as_str(),
                            bus, "controlled bus outside of the island, skipping control"
                        );
                    } else if idx.vm_known[bus] {
                        warn!(
                            branch = br.name.as_str(),
                            bus, "controlled bus voltage already fixed, skipping control"
                        );
                    } else {
                        idx.vm_known[bus] = true;
                        idx.vm_targets.push((bus, br.vset));
                        idx.u_cbr_m.push(k);
                    }
                }
                TapModuleControl::Qf => {
                    idx.u_cbr_m.push(k);
                    idx.k_cbr_qf.push(k);
                    idx.cbr_qf_set.push(br.qset / sbase);
                }
                TapModuleControl::Qt => {
                    idx.u_cbr_m.push(k);
                    idx.k_cbr_qt.push(k);
                    idx.cbr_qt_set.push(br.qset / sbase);
                }
                TapModuleControl::Fixed => {}
            }
        }

        if state.tap_phase[k] == Status::Free {
            match br.tap_phase_control {
                TapPhaseControl::Pf => {
                    idx.u_cbr_tau.push(k);
                    idx.k_cbr_pf.push(k);
                    idx.cbr_pf_set.push(br.pset / sbase);
                }
                TapPhaseControl::Pt => {
                    idx.u_cbr_tau.push(k);
                    idx.k_cbr_pt.push(k);
                    idx.cbr_pt_set.push(br.pset / sbase);
                }
                TapPhaseControl::Fixed => {}
            }
        }
    }

    for (k, vsc) in net.vscs.iter().enumerate() {
        let slots = state.vsc_slots[k];
        let effect = vsc_table::lookup(slots[0].kind, slots[1].kind).ok_or_else(|| {
            ConfigError::DuplicateVscControl {
                vsc: vsc.name.clone(),
                control: slots[0].kind,
            }
        })?;

        for slot in &slots {
            match slot.kind {
                ConverterControl::VmDc | ConverterControl::VmAc => {
                    let default = if slot.kind == ConverterControl::VmDc {
                        vsc.bus_dc_p
                    } else {
                        vsc.bus_ac
                    };
                    let bus = resolve_bus(slot, default, nbus, &vsc.name);
                    if idx.vm_known[bus] {
                        warn!(vsc = vsc.name.as_str(), bus, "bus voltage magnitude fixed twice");
                    }
                    idx.vm_known[bus] = true;
                    idx.vm_targets.push((bus, slot.value));
                }
                ConverterControl::VaAc => {
                    let bus = resolve_bus(slot, vsc.bus_ac, nbus, &vsc.name);
                    idx.va_known[bus] = true;
                    idx.va_targets.push((bus, slot.value));
                }
                ConverterControl::Pdc => idx.pfp_targets.push((k, slot.value / sbase)),
                ConverterControl::Pac => idx.pt_targets.push((k, slot.value / sbase)),
                ConverterControl::Qac => idx.qt_targets.push((k, slot.value / sbase)),
                ConverterControl::Imax => {
                    // the rating governs; the slot value only serves unrated converters
                    let imax = if vsc.rate > 0.0 { vsc.rate / sbase } else { slot.value };
                    idx.k_vsc_i.push(k);
                    idx.vsc_i_set.push(imax);
                }
            }
        }

        if effect.free_pfp() {
            idx.u_vsc_pfp.push(k);
        }
        idx.u_vsc_pfn.push(k);
        if effect.free_pt() {
            idx.u_vsc_pt.push(k);
        }
        if effect.free_qt() {
            idx.u_vsc_qt.push(k);
        }
    }

    for (k, hvdc) in net.hvdcs.iter().enumerate() {
        for (bus, vset) in [(hvdc.from, hvdc.vset_f), (hvdc.to, hvdc.vset_t)] {
            idx.q_row[bus] = true;
            if !idx.vm_known[bus] {
                idx.vm_known[bus] = true;
                idx.vm_targets.push((bus, vset));
            }
        }
        if hvdc.mode == HvdcControlMode::Free {
            idx.hvdc_droop_idx.push(k);
        }
    }

    idx.finish(net.nbr());
    Ok(idx)
}
