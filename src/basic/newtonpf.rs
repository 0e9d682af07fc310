use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use derive_more::Display;
use nalgebra::DVector;
use nalgebra_sparse::pattern::SparsityPattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::controls::review_controls;
use super::error::{ConfigError, SolveError};
use super::options::PowerFlowOptions;
use super::problem::AcDcProblem;
use super::results::{extract_solution, PowerFlowSolution};
use super::solver::Solve;
use super::system::network::NetworkSnapshot;

/// States of the Newton driver.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverState {
    Iterating,
    ControlReview,
    Converged,
    Diverged,
}

/// Why the driver gave up.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum Divergence {
    #[display("maximum number of iterations ({_0}) reached")]
    MaxIterations(usize),
    #[display("control review did not settle after {_0} sweeps")]
    ControlsNotSettled(usize),
    #[display("cancelled by the caller")]
    Cancelled,
    #[display("{_0}")]
    Numerical(SolveError),
}

/// One Newton step with backtracking. On success `x` and the problem hold the new iterate.
fn newton_step<S: Solve>(
    pb: &mut AcDcProblem<'_>,
    x: &mut DVector<f64>,
    solver: &mut S,
    pattern: &mut Option<SparsityPattern>,
) -> Result<(), SolveError> {
    let jac = pb.jacobian();
    if pattern.as_ref() != Some(jac.pattern()) {
        solver.reset();
        *pattern = Some(jac.pattern().clone());
    }
    let n = jac.nrows();
    let mut dx = -&pb.eval.f;
    let (mut ap, mut ai, mut ax) = jac.disassemble();
    solver
        .solve(&mut ap, &mut ai, &mut ax, dx.as_mut_slice(), n)
        .map_err(SolveError::LinearSolver)?;
    if !dx.iter().all(|v| v.is_finite()) {
        return Err(SolveError::NonFiniteStep);
    }

    let options = pb.options;
    let error0 = pb.error();
    let mut alpha = 1.0;
    let mut candidate = &*x + &dx;
    for _ in 0..options.max_backtracks {
        let error = pb.residual_at(&candidate).amax();
        if error.is_finite() && error < error0 {
            break;
        }
        alpha *= options.backtrack_factor;
        trace!(alpha, error, "step shortened");
        candidate = &*x + &dx * alpha;
    }

    *x = candidate;
    pb.update(x);
    if !pb.eval.is_finite() {
        return Err(SolveError::NonFiniteResidual);
    }
    Ok(())
}

/// Solves the mixed AC/DC power flow of one island.
///
/// Invalid input is reported as [`ConfigError`] before iterating. Numerical trouble and
/// non-convergence are reported through [`PowerFlowSolution::converged`] and
/// [`PowerFlowSolution::message`], with the last iterate kept in the solution.
///
/// `cancel` is polled once per Newton step.
pub fn newton_acdc_pf<S: Solve>(
    net: &NetworkSnapshot,
    options: &PowerFlowOptions,
    solver: &mut S,
    cancel: Option<&AtomicBool>,
) -> Result<PowerFlowSolution, ConfigError> {
    let start = Instant::now();
    let mut pb = AcDcProblem::new(net, options)?;
    let mut x = pb.var2x();
    let mut pattern: Option<SparsityPattern> = None;
    solver.reset();

    let any_control = options.any_control();
    let mut state = SolverState::Iterating;
    let mut iterations = 0;
    let mut reviews = 0;
    // outcome of the last control review since the previous Newton step: Some(changed)
    let mut reviewed: Option<bool> = None;
    let mut divergence: Option<Divergence> = None;

    while !matches!(state, SolverState::Converged | SolverState::Diverged) {
        match state {
            SolverState::Iterating => {
                if !pb.eval.is_finite() {
                    divergence = Some(Divergence::Numerical(SolveError::NonFiniteResidual));
                    state = SolverState::Diverged;
                    continue;
                }
                let error = pb.error();
                if options.verbose > 0 {
                    debug!(iteration = iterations, error, "newton iteration");
                }
                if options.verbose > 1 && !pb.eval.f.is_empty() {
                    let worst = pb.eval.f.iamax();
                    trace!(equation = pb.fx_names()[worst].as_str(), "largest mismatch");
                }

                if error < options.tolerance && (!any_control || reviewed == Some(false)) {
                    state = SolverState::Converged;
                } else if any_control && reviewed.is_none() && error < options.controls_tolerance {
                    state = SolverState::ControlReview;
                } else if iterations >= options.max_iter {
                    divergence = Some(Divergence::MaxIterations(options.max_iter));
                    state = SolverState::Diverged;
                } else if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    divergence = Some(Divergence::Cancelled);
                    state = SolverState::Diverged;
                } else {
                    match newton_step(&mut pb, &mut x, solver, &mut pattern) {
                        Ok(()) => {
                            iterations += 1;
                            reviewed = None;
                        }
                        Err(e) => {
                            divergence = Some(Divergence::Numerical(e));
                            state = SolverState::Diverged;
                        }
                    }
                }
            }
            SolverState::ControlReview => {
                reviews += 1;
                if reviews > options.max_iter {
                    divergence = Some(Divergence::ControlsNotSettled(reviews - 1));
                    state = SolverState::Diverged;
                    continue;
                }
                let flags = review_controls(&mut pb);
                if flags.structure_dirty {
                    pb.rebuild()?;
                    x = pb.var2x();
                    pattern = None;
                    solver.reset();
                } else if flags.changed() {
                    pb.refresh();
                }
                reviewed = Some(flags.changed());
                state = SolverState::Iterating;
            }
            SolverState::Converged | SolverState::Diverged => {}
        }
    }

    let message = match &divergence {
        None => {
            info!(iterations, error = pb.error(), "power flow converged");
            String::from("converged")
        }
        Some(reason) => {
            warn!(iterations, error = pb.error(), %reason, "power flow did not converge");
            reason.to_string()
        }
    };
    Ok(extract_solution(&pb, state, message, iterations, start.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::indices::Status;
    use crate::basic::options::JacobianMode;
    use crate::basic::residual::{hvdc_rpu, vsc_current};
    use crate::basic::solver::DefaultSolver;
    use crate::basic::system::network::ConverterControl::*;
    use crate::basic::system::network::{Bus, Limit};
    use crate::testcases::*;
    use num_complex::Complex64;

    fn solve(net: &NetworkSnapshot, options: &PowerFlowOptions) -> PowerFlowSolution {
        let mut solver = DefaultSolver::default();
        let sol = newton_acdc_pf(net, options, &mut solver, None).unwrap();
        assert!(sol.converged, "{}", sol.message);
        sol
    }

    #[test]
    fn test_two_bus_matches_analytic_solution() {
        let (p, q, x) = (0.5, 0.2, 0.1);
        let net = two_bus_network(p, q);
        let sol = solve(&net, &PowerFlowOptions::default());

        let a = 1.0 - 2.0 * q * x;
        let v2 = ((a + (a * a - 4.0 * x * x * (p * p + q * q)).sqrt()) / 2.0).sqrt();
        let delta = (-p * x / v2).asin();
        let v = sol.buses[1].v;
        println!("V2 = {} (analytic {v2} /_ {delta})", v);
        assert!((v.norm() - v2).abs() < 1e-8);
        assert!((v.arg() - delta).abs() < 1e-8);
        assert!(sol.norm_f < 1e-8);
    }

    #[test]
    fn test_finite_difference_mode_converges_to_the_same_point() {
        let net = tap_network();
        let closed = solve(&net, &PowerFlowOptions::default());
        let options = PowerFlowOptions {
            jacobian: JacobianMode::FiniteDifference,
            ..Default::default()
        };
        let fd = solve(&net, &options);
        for (a, b) in closed.buses.iter().zip(&fd.buses) {
            assert!((a.v - b.v).norm() < 1e-7);
        }
    }

    #[test]
    fn test_converged_point_is_idempotent() {
        let net = hvdc_network(Some(1.5));
        let options = PowerFlowOptions::default();
        let mut solver = DefaultSolver::default();
        let sol = newton_acdc_pf(&net, &options, &mut solver, None).unwrap();
        assert!(sol.converged);

        let mut pb = AcDcProblem::new(&net, &options).unwrap();
        pb.vars.vm = DVector::from_iterator(net.nbus(), sol.buses.iter().map(|b| b.v.norm()));
        pb.vars.va = DVector::from_iterator(net.nbus(), sol.buses.iter().map(|b| b.v.arg()));
        for (k, h) in sol.hvdcs.iter().enumerate() {
            pb.vars.hvdc_pf[k] = h.sf.re / net.sbase;
            pb.vars.hvdc_qf[k] = h.sf.im / net.sbase;
            pb.vars.hvdc_pt[k] = h.st.re / net.sbase;
            pb.vars.hvdc_qt[k] = h.st.im / net.sbase;
        }
        pb.refresh();
        assert!(pb.error() < options.tolerance * 10.0, "{}", pb.error());
    }

    #[test]
    fn test_reactive_limit_reclassifies_generator() {
        let net = three_bus_pv_network();
        let options = PowerFlowOptions {
            control_q: true,
            ..Default::default()
        };
        let sol = solve(&net, &options);
        let qmax = net.buses[1].q_limit.max;
        let q = sol.buses[1].s.im / net.sbase;
        assert!((q - qmax).abs() < 1e-6, "Q = {q}, Qmax = {qmax}");
        // released voltage drops below the former set-point
        assert!(sol.buses[1].v.norm() < net.v0[1].norm());

        let free = solve(&net, &PowerFlowOptions::default());
        assert!(free.buses[1].s.im / net.sbase > qmax);
    }

    #[test]
    fn test_reactive_limit_holds_with_voltage_dependent_injection() {
        let mut net = three_bus_pv_network();
        net.i0[1] = Complex64::new(0.0, -0.05);
        let options = PowerFlowOptions {
            control_q: true,
            ..Default::default()
        };
        let sol = solve(&net, &options);
        let qmax = net.buses[1].q_limit.max;
        let q = sol.buses[1].s.im / net.sbase;
        assert!((q - qmax).abs() < 1e-6, "Q = {q}, Qmax = {qmax}");
    }

    #[test]
    fn test_reactive_lower_limit_raises_voltage() {
        let mut net = three_bus_pv_network();
        net.buses[1] = Bus::pv("gen", 110.0).with_q_limit(-0.05, 1.0);
        net.v0[1] = Complex64::new(0.95, 0.0);
        net.s0[2] = Complex64::new(-0.1, 0.0);

        let free = solve(&net, &PowerFlowOptions::default());
        let qmin = net.buses[1].q_limit.min;
        assert!(free.buses[1].s.im / net.sbase < qmin);

        let options = PowerFlowOptions {
            control_q: true,
            ..Default::default()
        };
        let sol = solve(&net, &options);
        let q = sol.buses[1].s.im / net.sbase;
        assert!((q - qmin).abs() < 1e-6, "Q = {q}, Qmin = {qmin}");
        assert!(sol.buses[1].v.norm() > 0.95);
    }

    #[test]
    fn test_tap_module_clamped_at_limit() {
        let net = tap_network();
        let sol = solve(&net, &PowerFlowOptions::default());
        let lim = net.branches[0].tap_module_limit;
        assert!((sol.branches[0].m - lim.min).abs() < 1e-12);
        // the set-point cannot be met once the tap is frozen
        assert!(sol.buses[1].v.norm() < net.branches[0].vset);
    }

    #[test]
    fn test_tap_module_regulates_voltage_within_limits() {
        let mut net = tap_network();
        net.s0[2] = Complex64::new(-0.1, -0.05);
        let sol = solve(&net, &PowerFlowOptions::default());
        let m = sol.branches[0].m;
        assert!(m > 0.95 && m < 1.1, "m = {m}");
        assert!((sol.buses[1].v.norm() - net.branches[0].vset).abs() < 1e-8);
    }

    #[test]
    fn test_disabled_tap_control_keeps_nominal_tap() {
        let net = tap_network();
        let options = PowerFlowOptions {
            control_taps_modules: false,
            ..Default::default()
        };
        let sol = solve(&net, &options);
        assert!(sol.branches[0].m == net.branches[0].tap_module);
    }

    #[test]
    fn test_orthogonalized_tap_lands_on_a_step() {
        let mut net = tap_network();
        net.s0[2] = Complex64::new(-0.1, -0.05);
        let steps = vec![0.95, 0.975, 1.0, 1.025, 1.05, 1.075, 1.1];
        net.branches[0] = net.branches[0].clone().with_tap_module_steps(steps.clone());
        let options = PowerFlowOptions {
            orthogonalize_controls: true,
            ..Default::default()
        };
        let sol = solve(&net, &options);
        assert!(steps.contains(&sol.branches[0].m), "m = {}", sol.branches[0].m);
    }

    #[test]
    fn test_phase_shifter_meets_active_power_set_point() {
        let net = phase_shifter_network();
        let sol = solve(&net, &PowerFlowOptions::default());
        let br = &net.branches[1];
        assert!((sol.branches[1].sf.re - br.pset).abs() < 1e-5);
        assert!(sol.branches[1].tau != br.tap_phase);
    }

    #[test]
    fn test_phase_shifter_clamped_at_limit() {
        let mut net = phase_shifter_network();
        net.branches[1].pset = 50.0;
        net.branches[1].tap_phase_limit = Limit::from((-0.03, 0.03));
        let sol = solve(&net, &PowerFlowOptions::default());
        let tau = sol.branches[1].tau;
        assert!((tau.abs() - 0.03).abs() < 1e-12, "tau = {tau}");
        // the frozen angle cannot push the full set-point through
        assert!(sol.branches[1].sf.re < 50.0 - 1.0);
        assert!(sol.branches[1].sf.re > 30.0);
    }

    #[test]
    fn test_vsc_voltage_pair() {
        let net = vsc_network(VmDc, VmAc);
        let sol = solve(&net, &PowerFlowOptions::default());
        let vsc = &net.vscs[0];
        assert!((sol.buses[vsc.bus_dc_p].v.norm() - 1.02).abs() < 1e-12);
        assert!((sol.buses[vsc.bus_ac].v.norm() - 0.99).abs() < 1e-12);

        let r = &sol.vscs[0];
        let balance = r.pfp * 0.0 + r.pfn * sol.buses[vsc.bus_dc_p].v.norm();
        assert!(balance.abs() < 1e-9);
        // the converter feeds the dc load plus dc line losses and its own losses
        assert!(r.st.re > 30.0 && r.losses > 0.0);
    }

    #[test]
    fn test_vsc_current_limit() {
        let mut net = vsc_network(VmDc, Qac);
        net.vscs[0].controls[1].value = 0.0;
        net.s0[3] = Complex64::new(0.0, 0.0);
        net.y0[3] = Complex64::new(-0.5, 0.0);
        let options = PowerFlowOptions {
            limit_i_vsc: true,
            ..Default::default()
        };

        let unlimited = solve(&net, &PowerFlowOptions::default());
        let imax = net.vscs[0].rate / net.sbase;
        assert!(unlimited.vscs[0].current > imax);

        let sol = solve(&net, &options);
        let it = sol.vscs[0].current;
        assert!(it <= imax * (1.0 + options.vsc_current_margin), "I = {it}");
        assert!(it <= imax * options.vsc_saturation_factor);
        assert!((it - imax).abs() < 1e-6);
    }

    #[test]
    fn test_declared_current_limit_solves_from_flat_start() {
        let net = vsc_network(VmDc, Imax);
        let sol = solve(&net, &PowerFlowOptions::default());
        let vsc = &net.vscs[0];
        let imax = vsc.rate / net.sbase;
        assert!((sol.vscs[0].current - imax).abs() < 1e-8, "I = {}", sol.vscs[0].current);
        assert!((sol.buses[vsc.bus_dc_p].v.norm() - 1.02).abs() < 1e-12);
        assert!(sol.vscs[0].st.re > 30.0);
    }

    #[test]
    fn test_saturated_converter_drops_power_set_point() {
        let mut net = vsc_network(VmAc, Pac);
        net.buses[3] = Bus::dc_slack("dc3", 320.0);
        net.s0[3] = Complex64::new(0.0, 0.0);
        net.vscs[0].rate = 15.0;
        let options = PowerFlowOptions {
            limit_i_vsc: true,
            ..Default::default()
        };
        let sol = solve(&net, &options);
        let imax = net.vscs[0].rate / net.sbase;
        let r = &sol.vscs[0];
        assert!(r.st.re.abs() < 1e-6, "P = {}", r.st.re);
        assert!((r.current - imax).abs() < 1e-6, "I = {}", r.current);
        assert!(r.current <= imax * options.vsc_saturation_factor);
    }

    #[test]
    fn test_current_limited_layout_stays_square() {
        let mut net = vsc_network(VmDc, Qac);
        net.vscs[0].controls[1].value = 0.0;
        net.s0[3] = Complex64::new(0.0, 0.0);
        net.y0[3] = Complex64::new(-0.5, 0.0);
        let options = PowerFlowOptions {
            limit_i_vsc: true,
            ..Default::default()
        };
        let mut pb = AcDcProblem::new(&net, &options).unwrap();
        pb.state.vsc_slots[0][0] = crate::basic::system::network::ControlSlot::new(Imax, 0.4);
        pb.rebuild().unwrap();
        assert!(pb.idx.k_vsc_i == vec![0]);
        assert!(!pb.idx.vm_known[net.vscs[0].bus_dc_p]);
        assert!(pb.var2x().len() == pb.eval.f.len());
        assert!(vsc_current(&net.vscs[0], &pb.vars, 0).is_finite());
    }

    #[test]
    fn test_hvdc_fixed_power_delivery() {
        let net = hvdc_network(None);
        let sol = solve(&net, &PowerFlowOptions::default());
        let line = &net.hvdcs[0];
        let pf = line.pset / net.sbase;
        let rpu = hvdc_rpu(line, net.sbase);
        let delivered = pf - rpu * (pf / line.vset_f).powi(2);
        let h = &sol.hvdcs[0];
        assert!((h.sf.re / net.sbase - pf).abs() < 1e-7);
        assert!((-h.st.re / net.sbase - delivered).abs() < 1e-7);
        assert!((-h.st.re / net.sbase - 0.198).abs() < 1e-7);
    }

    #[test]
    fn test_hvdc_droop_is_linear() {
        let base = solve(&hvdc_network(Some(1.0)), &PowerFlowOptions::default());
        let more = solve(&hvdc_network(Some(3.0)), &PowerFlowOptions::default());
        let net = hvdc_network(Some(1.0));
        let line = &net.hvdcs[0];
        let dv = line.vset_f - line.vset_t;
        let dp = (more.hvdcs[0].sf.re - base.hvdcs[0].sf.re) / net.sbase;
        assert!((dp - 2.0 * dv).abs() < 1e-7, "dP = {dp}");
    }

    #[test]
    fn test_distributed_slack_shares_power() {
        let mut net = three_bus_pv_network();
        net.buses[0].installed_power = 100.0;
        net.buses[1].installed_power = 100.0;
        let options = PowerFlowOptions {
            distributed_slack: true,
            ..Default::default()
        };
        let shared = solve(&net, &options);
        let single = solve(&net, &PowerFlowOptions::default());
        // the generator bus picks up part of the slack power
        assert!(shared.buses[1].s.re > single.buses[1].s.re + 1.0);
        assert!(shared.buses[0].s.re < single.buses[0].s.re);
    }

    #[test]
    fn test_layout_stays_square_across_reclassification() {
        let net = three_bus_pv_network();
        let options = PowerFlowOptions {
            control_q: true,
            ..Default::default()
        };
        let mut pb = AcDcProblem::new(&net, &options).unwrap();
        pb.state.bus[1].vm = Status::Free;
        pb.state.bus[1].q = Status::AtLimit;
        pb.rebuild().unwrap();
        assert!(pb.var2x().len() == pb.eval.f.len());
        assert!(pb.idx.q_row[1]);
    }

    #[test]
    fn test_iteration_budget_exhausted() {
        let net = two_bus_network(0.5, 0.2);
        let options = PowerFlowOptions {
            max_iter: 1,
            tolerance: 1e-14,
            ..Default::default()
        };
        let mut solver = DefaultSolver::default();
        let sol = newton_acdc_pf(&net, &options, &mut solver, None).unwrap();
        assert!(!sol.converged);
        assert!(sol.state == SolverState::Diverged);
        assert!(sol.iterations == 1);
        // the last iterate is kept
        assert!(sol.buses[1].v.norm() < 1.0);
    }

    #[test]
    fn test_verbose_run_matches_silent_run() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("trace"))
            .with_test_writer()
            .try_init();
        let net = three_bus_pv_network();
        let loud = PowerFlowOptions {
            verbose: 2,
            control_q: true,
            ..Default::default()
        };
        let quiet = PowerFlowOptions {
            control_q: true,
            ..Default::default()
        };
        let a = solve(&net, &loud);
        let b = solve(&net, &quiet);
        assert!(a.iterations == b.iterations);
        println!("{a}");
    }

    #[test]
    fn test_cancellation() {
        let net = two_bus_network(0.5, 0.2);
        let flag = AtomicBool::new(true);
        let mut solver = DefaultSolver::default();
        let sol =
            newton_acdc_pf(&net, &PowerFlowOptions::default(), &mut solver, Some(&flag)).unwrap();
        assert!(!sol.converged);
        assert!(sol.iterations == 0);
        assert!(sol.message.contains("cancelled"));
    }

    #[test]
    fn test_duplicate_controls_fail_fast() {
        let mut net = vsc_network(VmDc, VmAc);
        net.vscs[0].controls[1].kind = VmDc;
        let mut solver = DefaultSolver::default();
        let res = newton_acdc_pf(&net, &PowerFlowOptions::default(), &mut solver, None);
        assert!(matches!(res, Err(ConfigError::DuplicateVscControl { .. })));
    }
}
