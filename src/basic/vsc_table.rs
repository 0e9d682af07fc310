//! Converter control-pair dispatch.
//!
//! Every converter carries two control slots. The ordered pair of slot types decides which
//! terminal voltages become known, which internal flows stay unknown and whether a current
//! limit row is added. The table below is built once at compile time from the per-type effect
//! and covers all 49 ordered pairs; the diagonal is invalid.

use super::system::network::ConverterControl;

/// Structural consequence of a converter control pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VscControlEffect {
    pub fix_vm_dc: bool,
    pub fix_vm_ac: bool,
    pub fix_va_ac: bool,
    /// Positive-pole DC power known.
    pub fix_pdc: bool,
    /// AC active power known.
    pub fix_pac: bool,
    /// AC reactive power known.
    pub fix_qac: bool,
    pub current_limit: bool,
}

impl VscControlEffect {
    pub const fn free_pfp(&self) -> bool {
        !self.fix_pdc
    }

    pub const fn free_pt(&self) -> bool {
        !self.fix_pac
    }

    pub const fn free_qt(&self) -> bool {
        !self.fix_qac
    }

    /// Degrees of freedom removed from the converter model. Always 2 for a valid pair.
    pub const fn constraints(&self) -> usize {
        self.fix_vm_dc as usize
            + self.fix_vm_ac as usize
            + self.fix_va_ac as usize
            + self.fix_pdc as usize
            + self.fix_pac as usize
            + self.fix_qac as usize
            + self.current_limit as usize
    }

    const fn single(kind: ConverterControl) -> Self {
        let mut e = Self {
            fix_vm_dc: false,
            fix_vm_ac: false,
            fix_va_ac: false,
            fix_pdc: false,
            fix_pac: false,
            fix_qac: false,
            current_limit: false,
        };
        match kind {
            ConverterControl::VmDc => e.fix_vm_dc = true,
            ConverterControl::VmAc => e.fix_vm_ac = true,
            ConverterControl::VaAc => e.fix_va_ac = true,
            ConverterControl::Qac => e.fix_qac = true,
            ConverterControl::Pdc => e.fix_pdc = true,
            ConverterControl::Pac => e.fix_pac = true,
            ConverterControl::Imax => e.current_limit = true,
        }
        e
    }

    const fn union(a: Self, b: Self) -> Self {
        Self {
            fix_vm_dc: a.fix_vm_dc || b.fix_vm_dc,
            fix_vm_ac: a.fix_vm_ac || b.fix_vm_ac,
            fix_va_ac: a.fix_va_ac || b.fix_va_ac,
            fix_pdc: a.fix_pdc || b.fix_pdc,
            fix_pac: a.fix_pac || b.fix_pac,
            fix_qac: a.fix_qac || b.fix_qac,
            current_limit: a.current_limit || b.current_limit,
        }
    }
}

const fn control_index(kind: ConverterControl) -> usize {
    match kind {
        ConverterControl::VmDc => 0,
        ConverterControl::VmAc => 1,
        ConverterControl::VaAc => 2,
        ConverterControl::Qac => 3,
        ConverterControl::Pdc => 4,
        ConverterControl::Pac => 5,
        ConverterControl::Imax => 6,
    }
}

const fn build_table() -> [[Option<VscControlEffect>; 7]; 7] {
    let mut table = [[None; 7]; 7];
    let mut i = 0;
    while i < 7 {
        let mut j = 0;
        while j < 7 {
            if i != j {
                let a = VscControlEffect::single(ConverterControl::ALL[i]);
                let b = VscControlEffect::single(ConverterControl::ALL[j]);
                table[i][j] = Some(VscControlEffect::union(a, b));
            }
            j += 1;
        }
        i += 1;
    }
    table
}

/// `VSC_CONTROL_TABLE[slot1][slot2]`, indexed in [`ConverterControl::ALL`] order.
pub const VSC_CONTROL_TABLE: [[Option<VscControlEffect>; 7]; 7] = build_table();

/// Looks up the effect of an ordered control pair; `None` for identical types.
pub fn lookup(c1: ConverterControl, c2: ConverterControl) -> Option<VscControlEffect> {
    VSC_CONTROL_TABLE[control_index(c1)][control_index(c2)]
}

/// Order in which a slot is surrendered when the converter current saturates.
pub const CURRENT_LIMIT_PRIORITY: [ConverterControl; 6] = [
    ConverterControl::VmAc,
    ConverterControl::VmDc,
    ConverterControl::Pdc,
    ConverterControl::Pac,
    ConverterControl::Qac,
    ConverterControl::VaAc,
];
