//! Small networks used by the unit tests and as usage examples.
//!
//! All of them use a 100 MVA base.

use num_complex::Complex64;

use crate::basic::system::network::{
    Bus, ControlSlot, ConverterControl, HvdcLine, Limit, NetworkSnapshot, PassiveBranch,
    TapPhaseControl, Vsc,
};

const SBASE: f64 = 100.0;

/// Slack feeding a load `p + jq` (p.u.) over a lossless line with `x = 0.1`.
pub fn two_bus_network(p: f64, q: f64) -> NetworkSnapshot {
    let mut net = NetworkSnapshot::new(SBASE, vec![Bus::slack("slack", 110.0), Bus::pq("load", 110.0)]);
    net.branches.push(PassiveBranch::line("line", 0, 1, 0.0, 0.1));
    net.s0[1] = Complex64::new(-p, -q);
    net
}

/// Slack, a 1.05 p.u. generator injecting 0.3 p.u. with `Q <= 0.1`, and a load, meshed.
pub fn three_bus_pv_network() -> NetworkSnapshot {
    let buses = vec![
        Bus::slack("slack", 110.0),
        Bus::pv("gen", 110.0).with_q_limit(-0.5, 0.1),
        Bus::pq("load", 110.0),
    ];
    let mut net = NetworkSnapshot::new(SBASE, buses);
    net.branches = vec![
        PassiveBranch::line("l01", 0, 1, 0.01, 0.1),
        PassiveBranch::line("l12", 1, 2, 0.01, 0.1),
        PassiveBranch::line("l02", 0, 2, 0.01, 0.1),
    ];
    net.v0[1] = Complex64::new(1.05, 0.0);
    net.s0[1] = Complex64::new(0.3, 0.0);
    net.s0[2] = Complex64::new(-0.8, -0.6);
    net
}

/// Transformer regulating its secondary to 1.0 p.u. within `[0.95, 1.1]`, feeding a load
/// through a short line.
pub fn tap_network() -> NetworkSnapshot {
    let buses = vec![
        Bus::slack("hv", 220.0),
        Bus::pq("mv", 110.0),
        Bus::pq("load", 110.0),
    ];
    let mut net = NetworkSnapshot::new(SBASE, buses);
    net.branches = vec![
        PassiveBranch::line("trafo", 0, 1, 0.005, 0.2)
            .with_shunt(0.0, -0.01)
            .with_rate(100.0)
            .regulating_vm(None, 1.0, Limit::from((0.95, 1.1))),
        PassiveBranch::line("feeder", 1, 2, 0.01, 0.05).with_rate(80.0),
    ];
    net.s0[2] = Complex64::new(-0.5, -0.5);
    net
}

/// Two parallel paths to a load, one of them a phase shifter holding 40 MW at its from side.
pub fn phase_shifter_network() -> NetworkSnapshot {
    let mut net = NetworkSnapshot::new(SBASE, vec![Bus::slack("slack", 220.0), Bus::pq("load", 220.0)]);
    net.branches = vec![
        PassiveBranch::line("line", 0, 1, 0.01, 0.1),
        PassiveBranch::line("pst", 0, 1, 0.005, 0.1).regulating_p(
            TapPhaseControl::Pf,
            40.0,
            Limit::from((-0.5, 0.5)),
        ),
    ];
    net.s0[1] = Complex64::new(-0.6, -0.1);
    net
}

fn slot_value(kind: ConverterControl) -> f64 {
    match kind {
        ConverterControl::VmDc => 1.02,
        ConverterControl::VmAc => 0.99,
        ConverterControl::VaAc => -0.02,
        ConverterControl::Qac => 10.0,
        ConverterControl::Pdc => -30.0,
        ConverterControl::Pac => 31.0,
        ConverterControl::Imax => 0.4,
    }
}

/// AC slack, AC load bus, one converter and a DC line to a 0.3 p.u. DC load.
///
/// Bus 0 slack, bus 1 converter AC terminal, bus 2 converter DC terminal, bus 3 DC load.
pub fn vsc_network(c1: ConverterControl, c2: ConverterControl) -> NetworkSnapshot {
    let buses = vec![
        Bus::slack("ac0", 220.0),
        Bus::pq("ac1", 220.0),
        Bus::dc("dc2", 320.0),
        Bus::dc("dc3", 320.0),
    ];
    let mut net = NetworkSnapshot::new(SBASE, buses);
    net.branches = vec![
        PassiveBranch::line("ac01", 0, 1, 0.01, 0.05),
        PassiveBranch::line("dc23", 2, 3, 0.01, 0.0),
    ];
    net.vscs.push(
        Vsc::new(
            "vsc",
            2,
            1,
            [
                ControlSlot::new(c1, slot_value(c1)),
                ControlSlot::new(c2, slot_value(c2)),
            ],
        )
        .with_losses(0.001, 0.01, 0.01)
        .with_rate(40.0),
    );
    net.s0[3] = Complex64::new(-0.3, 0.0);
    net
}

/// Converter with both poles connected, each pole tied to its own DC voltage reference.
pub fn bipolar_vsc_network() -> NetworkSnapshot {
    let buses = vec![
        Bus::slack("ac0", 220.0),
        Bus::pq("ac1", 220.0),
        Bus::dc("dc_pos", 320.0),
        Bus::dc("dc_neg", 320.0),
        Bus::dc_slack("ref_pos", 320.0),
        Bus::dc_slack("ref_neg", 320.0),
    ];
    let mut net = NetworkSnapshot::new(SBASE, buses);
    net.branches = vec![
        PassiveBranch::line("ac01", 0, 1, 0.01, 0.05),
        PassiveBranch::line("dc_p", 2, 4, 0.02, 0.0),
        PassiveBranch::line("dc_n", 3, 5, 0.02, 0.0),
    ];
    net.vscs.push(
        Vsc::new(
            "bipole",
            2,
            1,
            [
                ControlSlot::new(ConverterControl::Pac, 20.0),
                ControlSlot::new(ConverterControl::Qac, 5.0),
            ],
        )
        .with_negative_pole(3)
        .with_losses(0.001, 0.01, 0.01)
        .with_rate(50.0),
    );
    net
}

/// HVDC link carrying 20 MW in parallel with an AC corridor, optionally with droop.
pub fn hvdc_network(droop: Option<f64>) -> NetworkSnapshot {
    let buses = vec![
        Bus::slack("slack", 220.0),
        Bus::pq("rect", 220.0),
        Bus::pq("inv", 220.0),
    ];
    let mut net = NetworkSnapshot::new(SBASE, buses);
    net.branches = vec![
        PassiveBranch::line("l01", 0, 1, 0.01, 0.1),
        PassiveBranch::line("l12", 1, 2, 0.02, 0.2),
        PassiveBranch::line("l02", 0, 2, 0.01, 0.1),
    ];
    let mut line = HvdcLine::new("hvdc", 1, 2, 5.0, 100.0, 20.0)
        .with_voltages(1.0, 0.98)
        .with_rate(50.0);
    if let Some(d) = droop {
        line = line.with_droop(d);
    }
    net.hvdcs.push(line);
    net.s0[1] = Complex64::new(-0.2, -0.05);
    net.s0[2] = Complex64::new(-0.4, -0.1);
    net
}
