//! Discrete control review.
//!
//! Called by the Newton driver once the residual is small enough. Each check edits the tagged
//! control state, the variables or the injection schedule, and reports what it touched through
//! [`ReviewFlags`]. The driver decides what to rebuild.

use ordered_float::OrderedFloat;
use tracing::{info, warn};

use super::indices::Status;
use super::problem::AcDcProblem;
use super::residual::vsc_current;
use super::system::network::{ConverterControl, ControlSlot, Limit};
use super::vsc_table::CURRENT_LIMIT_PRIORITY;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewFlags {
    /// A quantity changed status; index sets and the unknown layout must be rebuilt.
    pub structure_dirty: bool,
    /// Tap values were edited and patched into the admittance matrix.
    pub admit_dirty: bool,
    /// The injection schedule changed.
    pub injection_dirty: bool,
}

impl ReviewFlags {
    pub fn changed(&self) -> bool {
        self.structure_dirty || self.admit_dirty || self.injection_dirty
    }
}

/// Runs the enabled checks in priority order: reactive limits, distributed slack, tap modules,
/// tap phases, converter current.
pub fn review_controls(pb: &mut AcDcProblem<'_>) -> ReviewFlags {
    let options = pb.options;
    let mut flags = ReviewFlags::default();
    if options.control_q {
        check_q_limits(pb, &mut flags);
    }
    if options.distributed_slack {
        distribute_slack(pb, &mut flags);
    }
    if options.control_taps_modules {
        check_tap_modules(pb, &mut flags);
    }
    if options.control_taps_phase {
        check_tap_phases(pb, &mut flags);
    }
    if options.limit_i_vsc {
        check_vsc_current(pb, &mut flags);
    }
    flags
}

/// Releases the voltage of generator buses whose reactive injection left its limits and pins
/// their net reactive injection at the violated bound.
fn check_q_limits(pb: &mut AcDcProblem<'_>, flags: &mut ReviewFlags) {
    let idx = &pb.idx;
    let nbus = idx.nbus;
    // at least one generator bus besides the slack, seen from both bookkeeping sides
    if nbus - idx.i_u_vm.len() < 2 || nbus - idx.i_k_q.len() < 2 {
        return;
    }
    for i in 0..nbus {
        let ctrl = pb.state.bus[i];
        let candidate = ctrl.vm == Status::Fixed
            && ctrl.q == Status::Free
            && pb.idx.p_row[i]
            && !pb.idx.q_row[i];
        if !candidate {
            continue;
        }
        let bus = &pb.net.buses[i];
        let q = pb.eval.scalc[i].im;
        if let Some(bound) = bus.q_limit.violated_bound(q) {
            info!(
                bus = bus.name.as_str(),
                q, bound, "reactive power limit reached, releasing voltage set-point"
            );
            // the whole reactive schedule becomes the bound, voltage dependent parts included
            pb.sched.s0[i].im = bound;
            pb.sched.i0[i].im = 0.0;
            pb.sched.y0[i].im = 0.0;
            pb.state.bus[i].vm = Status::Free;
            pb.state.bus[i].q = Status::AtLimit;
            flags.structure_dirty = true;
            flags.injection_dirty = true;
        }
    }
}

/// Spreads the active power taken by the reference buses over all buses by installed power.
fn distribute_slack(pb: &mut AcDcProblem<'_>, flags: &mut ReviewFlags) {
    let net = pb.net;
    let total: f64 = net.buses.iter().map(|b| b.installed_power).sum();
    if total <= 0.0 {
        warn!("distributed slack enabled but no installed power declared");
        return;
    }
    let sbus = pb.sched.sbus(&pb.vars.vm);
    let mismatch: f64 = (0..pb.idx.nbus)
        .filter(|&i| pb.idx.vm_known[i] && pb.idx.va_known[i] && !net.buses[i].grounded)
        .map(|i| pb.eval.scalc[i].re - sbus[i].re)
        .sum();

    let mut max_delta: f64 = 0.0;
    for (i, bus) in net.buses.iter().enumerate() {
        let delta = mismatch * bus.installed_power / total;
        pb.sched.s0[i].re += delta;
        if pb.idx.p_row[i] {
            max_delta = max_delta.max(delta.abs());
        }
    }
    if max_delta > pb.options.tolerance {
        info!(mismatch, "slack power distributed");
        flags.injection_dirty = true;
    }
}

/// Outcome of checking one controlled tap value.
struct TapReview {
    value: f64,
    status: Status,
}

/// Snaps to the nearest discrete position when asked, then clamps to the limits.
fn review_tap(value: f64, limit: &Limit, steps: Option<&Vec<f64>>, orthogonalize: bool) -> TapReview {
    let mut out = TapReview {
        value,
        status: Status::Free,
    };
    if orthogonalize {
        if let Some(step) = steps.and_then(|s| s.iter().copied().min_by_key(|s| OrderedFloat((s - value).abs()))) {
            out.value = step;
            out.status = Status::Fixed;
        }
    }
    if let Some(bound) = limit.violated_bound(out.value) {
        out.value = bound;
        out.status = Status::AtLimit;
    }
    out
}

fn check_tap_modules(pb: &mut AcDcProblem<'_>, flags: &mut ReviewFlags) {
    let orthogonalize = pb.options.orthogonalize_controls;
    let mut touched = Vec::new();
    for k in pb.idx.u_cbr_m.clone() {
        let br = &pb.net.branches[k];
        let m = pb.vars.m[k];
        let review = review_tap(m, &br.tap_module_limit, br.tap_module_steps.as_ref(), orthogonalize);
        if review.status == Status::Free {
            continue;
        }
        info!(
            branch = br.name.as_str(),
            from = m,
            to = review.value,
            status = ?review.status,
            "tap module frozen"
        );
        pb.vars.m[k] = review.value;
        pb.state.tap_module[k] = review.status;
        touched.push(k);
    }
    if !touched.is_empty() {
        pb.patch_branches(&touched);
        flags.structure_dirty = true;
        flags.admit_dirty = true;
    }
}

fn check_tap_phases(pb: &mut AcDcProblem<'_>, flags: &mut ReviewFlags) {
    let orthogonalize = pb.options.orthogonalize_controls;
    let mut touched = Vec::new();
    for k in pb.idx.u_cbr_tau.clone() {
        let br = &pb.net.branches[k];
        let tau = pb.vars.tau[k];
        let review = review_tap(tau, &br.tap_phase_limit, br.tap_phase_steps.as_ref(), orthogonalize);
        if review.status == Status::Free {
            continue;
        }
        info!(
            branch = br.name.as_str(),
            from = tau,
            to = review.value,
            status = ?review.status,
            "tap phase frozen"
        );
        pb.vars.tau[k] = review.value;
        pb.state.tap_phase[k] = review.status;
        touched.push(k);
    }
    if !touched.is_empty() {
        pb.patch_branches(&touched);
        flags.structure_dirty = true;
        flags.admit_dirty = true;
    }
}

/// Current the converter would carry from a power set-point alone; zero for other controls.
fn set_point_current(slot: &ControlSlot, sbase: f64, vm_ac: f64) -> f64 {
    match slot.kind {
        ConverterControl::Pdc | ConverterControl::Pac | ConverterControl::Qac if vm_ac > 0.0 => {
            (slot.value / sbase).abs() / vm_ac
        }
        _ => 0.0,
    }
}

/// Swaps a control for the current limit of overloaded converters, then zeroes the power
/// set-point of converters that cannot honour it within the rating.
fn check_vsc_current(pb: &mut AcDcProblem<'_>, flags: &mut ReviewFlags) {
    let options = pb.options;
    let sbase = pb.net.sbase;
    for (k, vsc) in pb.net.vscs.iter().enumerate() {
        if vsc.rate <= 0.0 {
            continue;
        }
        let imax = vsc.rate / sbase;
        let it = vsc_current(vsc, &pb.vars, k);
        let vm_ac = pb.vars.vm[vsc.bus_ac];
        let slots = &mut pb.state.vsc_slots[k];
        let mut limited = slots.iter().position(|s| s.kind == ConverterControl::Imax);
        // the current seen before a swap belongs to the released control
        let mut measured = it;
        if limited.is_none() && it > imax * (1.0 + options.vsc_current_margin) {
            limited = CURRENT_LIMIT_PRIORITY
                .iter()
                .find_map(|c| slots.iter().position(|s| s.kind == *c));
            if let Some(pos) = limited {
                info!(
                    vsc = vsc.name.as_str(),
                    current = it,
                    imax,
                    released = ?slots[pos].kind,
                    "converter current limit reached"
                );
                slots[pos] = ControlSlot::new(ConverterControl::Imax, imax);
                flags.structure_dirty = true;
                measured = 0.0;
            }
        }
        let Some(pos) = limited else {
            continue;
        };
        let other = &mut slots[1 - pos];
        let is_power = matches!(
            other.kind,
            ConverterControl::Pdc | ConverterControl::Pac | ConverterControl::Qac
        );
        let demand = measured.max(set_point_current(other, sbase, vm_ac));
        if is_power && other.value != 0.0 && demand > imax * options.vsc_saturation_factor {
            warn!(
                vsc = vsc.name.as_str(),
                current = demand,
                imax,
                control = ?other.kind,
                "converter saturated under current limiting, zeroing power set-point"
            );
            other.value = 0.0;
            flags.structure_dirty = true;
        }
    }
}
