mod basic;
pub mod testcases;
pub mod prelude {
    use crate::basic;
    pub use basic::error::{ConfigError, SolveError};
    pub use basic::newton_acdc_pf;
    pub use basic::newtonpf::{Divergence, SolverState};
    pub use basic::options::{JacobianMode, PowerFlowOptions};
    pub use basic::results::{BranchResult, BusResult, HvdcResult, PowerFlowSolution, VscResult};
    pub use basic::solver::{DefaultSolver, Solve};
    pub use basic::system::network::*;
    pub use basic::vsc_table::{lookup as vsc_control_effect, VscControlEffect};
}
