use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// How the Newton step obtains its Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JacobianMode {
    #[default]
    ClosedForm,
    FiniteDifference,
}

/// Solver configuration.
///
/// Every field has a default, so a JSON document only needs the keys it overrides:
///
/// ```json
/// { "tolerance": 1e-10, "control_q": true, "verbose": 1 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerFlowOptions {
    /// Convergence threshold on the infinity norm of the residual.
    pub tolerance: f64,
    /// Maximum number of Newton steps.
    pub max_iter: usize,
    /// Controls are only reviewed once the residual drops below this value.
    pub controls_tolerance: f64,
    /// Generator reactive power limits.
    pub control_q: bool,
    /// Spread the slack active power over buses by installed power.
    pub distributed_slack: bool,
    pub control_taps_modules: bool,
    pub control_taps_phase: bool,
    /// Converter current limiting.
    pub limit_i_vsc: bool,
    /// Snap controlled taps to their discrete positions during control review.
    pub orthogonalize_controls: bool,
    /// Relative margin above the rating before a converter switches to current limiting.
    pub vsc_current_margin: f64,
    /// Ratio over the rating that still counts as saturated once current limiting is active.
    pub vsc_saturation_factor: f64,
    /// Maximum step halvings per Newton step; zero disables the line search.
    pub max_backtracks: usize,
    pub backtrack_factor: f64,
    pub jacobian: JacobianMode,
    /// Perturbation used by the finite-difference Jacobian.
    pub fd_step: f64,
    /// 0 is silent, 1 logs every iteration, 2 also logs the residual labels.
    pub verbose: u8,
}

impl Default for PowerFlowOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iter: 50,
            controls_tolerance: 1e-2,
            control_q: false,
            distributed_slack: false,
            control_taps_modules: true,
            control_taps_phase: true,
            limit_i_vsc: false,
            orthogonalize_controls: false,
            vsc_current_margin: 1e-3,
            vsc_saturation_factor: 1.1,
            max_backtracks: 5,
            backtrack_factor: 0.5,
            jacobian: JacobianMode::ClosedForm,
            fd_step: 1e-6,
            verbose: 0,
        }
    }
}

impl PowerFlowOptions {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// True when at least one discrete control can trigger a review.
    pub fn any_control(&self) -> bool {
        self.control_q
            || self.distributed_slack
            || self.control_taps_modules
            || self.control_taps_phase
            || self.limit_i_vsc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let opts =
            PowerFlowOptions::from_json(r#"{"tolerance": 1e-10, "control_q": true}"#).unwrap();
        assert!(opts.tolerance == 1e-10);
        assert!(opts.control_q);
        assert!(opts.max_iter == PowerFlowOptions::default().max_iter);
        assert!(opts.jacobian == JacobianMode::ClosedForm);
    }

    #[test]
    fn test_jacobian_mode_names() {
        let opts = PowerFlowOptions::from_json(r#"{"jacobian": "finite_difference"}"#).unwrap();
        assert!(opts.jacobian == JacobianMode::FiniteDifference);
        assert!(PowerFlowOptions::from_json(r#"{"jacobian": "magic"}"#).is_err());
    }
}
