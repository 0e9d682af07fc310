use derive_more::From;
use num_complex::Complex64;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::basic::error::ConfigError;

/// Closed interval used for tap and reactive power limits.
#[derive(Debug, Clone, Copy, PartialEq, From, Serialize, Deserialize)]
pub struct Limit {
    pub min: f64,
    pub max: f64,
}

impl Default for Limit {
    fn default() -> Self {
        Self {
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }
}

impl Limit {
    /// Returns the violated bound, if any.
    pub fn violated_bound(&self, value: f64) -> Option<f64> {
        if value < self.min {
            Some(self.min)
        } else if value > self.max {
            Some(self.max)
        } else {
            None
        }
    }
}

/// A network node.
///
/// The four flags describe the bookkeeping before any device control is applied:
/// `vm_fixed`/`va_fixed` mark known voltage quantities, `p_balance`/`q_balance` mark the presence of
/// an active/reactive balance equation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub name: String,
    /// Nominal voltage (kV).
    pub vnom: f64,
    pub vm_fixed: bool,
    pub va_fixed: bool,
    pub p_balance: bool,
    pub q_balance: bool,
    /// Net reactive injection limits (p.u.).
    pub q_limit: Limit,
    /// Installed generation (MW), the weight used by the distributed slack.
    pub installed_power: f64,
    /// Held at V = 0, typically the return pole of a converter.
    pub grounded: bool,
}

impl Bus {
    fn with_flags(name: &str, vnom: f64, flags: [bool; 4]) -> Self {
        let [vm_fixed, va_fixed, p_balance, q_balance] = flags;
        Self {
            name: name.to_string(),
            vnom,
            vm_fixed,
            va_fixed,
            p_balance,
            q_balance,
            q_limit: Limit::default(),
            installed_power: 0.0,
            grounded: false,
        }
    }

    pub fn slack(name: &str, vnom: f64) -> Self {
        Self::with_flags(name, vnom, [true, true, false, false])
    }

    pub fn pv(name: &str, vnom: f64) -> Self {
        Self::with_flags(name, vnom, [true, false, true, false])
    }

    pub fn pq(name: &str, vnom: f64) -> Self {
        Self::with_flags(name, vnom, [false, false, true, true])
    }

    /// DC node: the angle is pinned at zero and only active power balances.
    pub fn dc(name: &str, vnom: f64) -> Self {
        Self::with_flags(name, vnom, [false, true, true, false])
    }

    /// DC voltage reference.
    pub fn dc_slack(name: &str, vnom: f64) -> Self {
        Self::with_flags(name, vnom, [true, true, false, false])
    }

    pub fn ground(name: &str, vnom: f64) -> Self {
        let mut bus = Self::with_flags(name, vnom, [true, true, false, false]);
        bus.grounded = true;
        bus
    }

    pub fn with_q_limit(mut self, min: f64, max: f64) -> Self {
        self.q_limit = Limit::from((min, max));
        self
    }

    pub fn with_installed_power(mut self, mw: f64) -> Self {
        self.installed_power = mw;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TapModuleControl {
    #[default]
    Fixed,
    /// Regulate the voltage magnitude of `regulated_bus`.
    Vm,
    Qf,
    Qt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TapPhaseControl {
    #[default]
    Fixed,
    Pf,
    Pt,
}

/// Line or transformer in the pi model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassiveBranch {
    pub name: String,
    pub from: usize,
    pub to: usize,
    pub r: f64,
    pub x: f64,
    pub g: f64,
    pub b: f64,
    /// Thermal rating (MVA).
    pub rate: f64,
    pub tap_module: f64,
    /// Phase shift (rad).
    pub tap_phase: f64,
    /// Nominal voltage mismatch ratios at each side.
    pub vtap_f: f64,
    pub vtap_t: f64,
    pub tap_module_control: TapModuleControl,
    pub tap_phase_control: TapPhaseControl,
    /// Bus regulated in [`TapModuleControl::Vm`] mode, the `to` bus when absent.
    pub regulated_bus: Option<usize>,
    /// Voltage target (p.u.).
    pub vset: f64,
    /// Active power target (MW).
    pub pset: f64,
    /// Reactive power target (MVAr).
    pub qset: f64,
    pub tap_module_limit: Limit,
    pub tap_phase_limit: Limit,
    pub tap_module_steps: Option<Vec<f64>>,
    pub tap_phase_steps: Option<Vec<f64>>,
}

impl PassiveBranch {
    pub fn line(name: &str, from: usize, to: usize, r: f64, x: f64) -> Self {
        Self {
            name: name.to_string(),
            from,
            to,
            r,
            x,
            g: 0.0,
            b: 0.0,
            rate: 0.0,
            tap_module: 1.0,
            tap_phase: 0.0,
            vtap_f: 1.0,
            vtap_t: 1.0,
            tap_module_control: TapModuleControl::Fixed,
            tap_phase_control: TapPhaseControl::Fixed,
            regulated_bus: None,
            vset: 1.0,
            pset: 0.0,
            qset: 0.0,
            tap_module_limit: Limit::default(),
            tap_phase_limit: Limit::default(),
            tap_module_steps: None,
            tap_phase_steps: None,
        }
    }

    pub fn with_shunt(mut self, g: f64, b: f64) -> Self {
        self.g = g;
        self.b = b;
        self
    }

    pub fn with_rate(mut self, mva: f64) -> Self {
        self.rate = mva;
        self
    }

    pub fn with_tap(mut self, module: f64, phase: f64) -> Self {
        self.tap_module = module;
        self.tap_phase = phase;
        self
    }

    pub fn regulating_vm(mut self, bus: Option<usize>, vset: f64, limit: Limit) -> Self {
        self.tap_module_control = TapModuleControl::Vm;
        self.regulated_bus = bus;
        self.vset = vset;
        self.tap_module_limit = limit;
        self
    }

    pub fn regulating_q(mut self, mode: TapModuleControl, qset: f64, limit: Limit) -> Self {
        self.tap_module_control = mode;
        self.qset = qset;
        self.tap_module_limit = limit;
        self
    }

    pub fn regulating_p(mut self, mode: TapPhaseControl, pset: f64, limit: Limit) -> Self {
        self.tap_phase_control = mode;
        self.pset = pset;
        self.tap_phase_limit = limit;
        self
    }

    pub fn with_tap_module_steps(mut self, steps: Vec<f64>) -> Self {
        self.tap_module_steps = Some(steps);
        self
    }

    pub fn with_tap_phase_steps(mut self, steps: Vec<f64>) -> Self {
        self.tap_phase_steps = Some(steps);
        self
    }
}

/// Converter control objectives.
///
/// Slot values are interpreted per kind: `VmDc`/`VmAc` in p.u., `VaAc` in rad,
/// `Qac`/`Pdc`/`Pac` in MW or MVAr. An `Imax` slot limits the current to the converter rating
/// over the system base; its value is only read when the converter has no rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConverterControl {
    VmDc,
    VmAc,
    VaAc,
    Qac,
    Pdc,
    Pac,
    Imax,
}

impl ConverterControl {
    pub const ALL: [ConverterControl; 7] = [
        ConverterControl::VmDc,
        ConverterControl::VmAc,
        ConverterControl::VaAc,
        ConverterControl::Qac,
        ConverterControl::Pdc,
        ConverterControl::Pac,
        ConverterControl::Imax,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlSlot {
    pub kind: ConverterControl,
    pub value: f64,
    /// Bus whose voltage is regulated; the converter's own terminal when absent.
    pub bus: Option<usize>,
}

impl ControlSlot {
    pub fn new(kind: ConverterControl, value: f64) -> Self {
        Self {
            kind,
            value,
            bus: None,
        }
    }

    pub fn at_bus(mut self, bus: usize) -> Self {
        self.bus = Some(bus);
        self
    }
}

/// Voltage source converter bridging `bus_ac` and the DC poles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vsc {
    pub name: String,
    pub bus_ac: usize,
    /// Positive DC pole.
    pub bus_dc_p: usize,
    /// Negative DC pole; grounded when absent.
    pub bus_dc_n: Option<usize>,
    pub controls: [ControlSlot; 2],
    /// Loss model `alpha1 + alpha2 I + alpha3 I^2` (p.u.).
    pub alpha1: f64,
    pub alpha2: f64,
    pub alpha3: f64,
    /// Rating (MVA).
    pub rate: f64,
}

impl Vsc {
    pub fn new(name: &str, bus_dc_p: usize, bus_ac: usize, controls: [ControlSlot; 2]) -> Self {
        Self {
            name: name.to_string(),
            bus_ac,
            bus_dc_p,
            bus_dc_n: None,
            controls,
            alpha1: 0.0,
            alpha2: 0.0,
            alpha3: 0.0,
            rate: 0.0,
        }
    }

    pub fn with_losses(mut self, alpha1: f64, alpha2: f64, alpha3: f64) -> Self {
        self.alpha1 = alpha1;
        self.alpha2 = alpha2;
        self.alpha3 = alpha3;
        self
    }

    pub fn with_rate(mut self, mva: f64) -> Self {
        self.rate = mva;
        self
    }

    pub fn with_negative_pole(mut self, bus: usize) -> Self {
        self.bus_dc_n = Some(bus);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HvdcControlMode {
    #[default]
    FixedPower,
    /// Set-point plus droop on the terminal voltage difference.
    Free,
}

/// Point-to-point DC link represented by its terminal injections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HvdcLine {
    pub name: String,
    pub from: usize,
    pub to: usize,
    /// Resistance (ohm).
    pub r: f64,
    /// Rated DC voltage (kV).
    pub vnom: f64,
    pub mode: HvdcControlMode,
    /// Droop gain (p.u. power per p.u. voltage).
    pub angle_droop: f64,
    /// Transfer set-point (MW).
    pub pset: f64,
    /// Rating (MW).
    pub rate: f64,
    /// Terminal voltage set-points (p.u.).
    pub vset_f: f64,
    pub vset_t: f64,
}

impl HvdcLine {
    pub fn new(name: &str, from: usize, to: usize, r: f64, vnom: f64, pset: f64) -> Self {
        Self {
            name: name.to_string(),
            from,
            to,
            r,
            vnom,
            mode: HvdcControlMode::FixedPower,
            angle_droop: 0.0,
            pset,
            rate: 0.0,
            vset_f: 1.0,
            vset_t: 1.0,
        }
    }

    pub fn with_droop(mut self, droop: f64) -> Self {
        self.mode = HvdcControlMode::Free;
        self.angle_droop = droop;
        self
    }

    pub fn with_voltages(mut self, vset_f: f64, vset_t: f64) -> Self {
        self.vset_f = vset_f;
        self.vset_t = vset_t;
        self
    }

    pub fn with_rate(mut self, mw: f64) -> Self {
        self.rate = mw;
        self
    }
}

/// One island ready to be solved.
///
/// Injections are per unit on `sbase` with loads negative; `i0` and `y0` are the injections at
/// 1 p.u. voltage, so the scheduled injection is `s0 + i0 * Vm + y0 * Vm^2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// System base (MVA).
    pub sbase: f64,
    pub buses: Vec<Bus>,
    pub branches: Vec<PassiveBranch>,
    pub vscs: Vec<Vsc>,
    pub hvdcs: Vec<HvdcLine>,
    pub y_shunt: Vec<Complex64>,
    pub v0: Vec<Complex64>,
    pub s0: Vec<Complex64>,
    pub i0: Vec<Complex64>,
    pub y0: Vec<Complex64>,
}

impl NetworkSnapshot {
    /// Flat start with no injections.
    pub fn new(sbase: f64, buses: Vec<Bus>) -> Self {
        let n = buses.len();
        let zeros = vec![Complex64::zero(); n];
        Self {
            sbase,
            buses,
            branches: Vec::new(),
            vscs: Vec::new(),
            hvdcs: Vec::new(),
            y_shunt: zeros.clone(),
            v0: vec![Complex64::one(); n],
            s0: zeros.clone(),
            i0: zeros.clone(),
            y0: zeros,
        }
    }

    pub fn nbus(&self) -> usize {
        self.buses.len()
    }

    pub fn nbr(&self) -> usize {
        self.branches.len()
    }

    /// Structural checks that make the solve impossible when violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nbus = self.nbus();
        if nbus == 0 {
            return Err(ConfigError::NoBuses);
        }
        for (what, len) in [
            ("v0", self.v0.len()),
            ("s0", self.s0.len()),
            ("i0", self.i0.len()),
            ("y0", self.y0.len()),
            ("y_shunt", self.y_shunt.len()),
        ] {
            if len != nbus {
                return Err(ConfigError::DimensionMismatch {
                    what,
                    got: len,
                    expected: nbus,
                });
            }
        }
        let check = |device: &str, bus: usize| {
            if bus < nbus {
                Ok(())
            } else {
                Err(ConfigError::UnknownBus {
                    device: device.to_string(),
                    bus,
                    nbus,
                })
            }
        };
        for br in &self.branches {
            check(&br.name, br.from)?;
            check(&br.name, br.to)?;
            if br.from == br.to {
                return Err(ConfigError::SelfLoop(br.name.clone()));
            }
            if br.r == 0.0 && br.x == 0.0 {
                return Err(ConfigError::ZeroImpedance(br.name.clone()));
            }
        }
        for vsc in &self.vscs {
            check(&vsc.name, vsc.bus_ac)?;
            check(&vsc.name, vsc.bus_dc_p)?;
            if let Some(n) = vsc.bus_dc_n {
                check(&vsc.name, n)?;
            }
            let [c1, c2] = vsc.controls;
            if c1.kind == c2.kind {
                return Err(ConfigError::DuplicateVscControl {
                    vsc: vsc.name.clone(),
                    control: c1.kind,
                });
            }
        }
        for hvdc in &self.hvdcs {
            check(&hvdc.name, hvdc.from)?;
            check(&hvdc.name, hvdc.to)?;
            if hvdc.vnom <= 0.0 {
                return Err(ConfigError::HvdcRatedVoltage(hvdc.name.clone()));
            }
        }
        Ok(())
    }
}
