use std::fmt;

use tabled::Tabled;

/// A wrapper around a float that limits the number of decimal places when printed.
#[derive(Clone, Copy, PartialEq, PartialOrd)]
pub(crate) struct FloatWrapper {
    pub(crate) value: f64,
    pub(crate) precision: usize,
}

impl FloatWrapper {
    pub fn new(value: f64, precision: usize) -> Self {
        FloatWrapper { value, precision }
    }
}

impl fmt::Display for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

impl fmt::Debug for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

/// Table row for bus results.
#[derive(Debug, Tabled)]
#[allow(non_snake_case)]
pub(crate) struct BusResTable {
    pub(crate) Bus: String,
    pub(crate) Vm: FloatWrapper,
    pub(crate) Va: FloatWrapper,
    pub(crate) P_mw: FloatWrapper,
    pub(crate) Q_mvar: FloatWrapper,
}

/// Table row for passive branch results.
#[derive(Debug, Tabled)]
pub(crate) struct BranchResTable {
    pub(crate) branch: String,
    pub(crate) p_from_mw: FloatWrapper,
    pub(crate) q_from_mvar: FloatWrapper,
    pub(crate) p_to_mw: FloatWrapper,
    pub(crate) q_to_mvar: FloatWrapper,
    pub(crate) pl_mw: FloatWrapper,
    pub(crate) ql_mvar: FloatWrapper,
    pub(crate) m: FloatWrapper,
    pub(crate) tau_degree: FloatWrapper,
    pub(crate) loading_percent: FloatWrapper,
}

#[derive(Debug, Tabled)]
pub(crate) struct VscResTable {
    pub(crate) vsc: String,
    pub(crate) p_dc_pos_mw: FloatWrapper,
    pub(crate) p_dc_neg_mw: FloatWrapper,
    pub(crate) p_ac_mw: FloatWrapper,
    pub(crate) q_ac_mvar: FloatWrapper,
    pub(crate) i_pu: FloatWrapper,
    pub(crate) pl_mw: FloatWrapper,
    pub(crate) loading_percent: FloatWrapper,
}

#[derive(Debug, Tabled)]
pub(crate) struct HvdcResTable {
    pub(crate) hvdc: String,
    pub(crate) p_from_mw: FloatWrapper,
    pub(crate) q_from_mvar: FloatWrapper,
    pub(crate) p_to_mw: FloatWrapper,
    pub(crate) q_to_mvar: FloatWrapper,
    pub(crate) pl_mw: FloatWrapper,
    pub(crate) loading_percent: FloatWrapper,
}
