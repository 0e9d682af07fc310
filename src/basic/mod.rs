pub mod controls;
pub(crate) mod derivatives;
pub(crate) mod dsbus_dv;
pub mod error;
pub mod indices;
pub mod jacobian;
pub mod newtonpf;
pub mod options;
pub mod problem;
pub mod residual;
pub mod results;
pub mod solver;
pub(crate) mod sparse;
pub mod system;
pub mod vsc_table;

pub use newtonpf::newton_acdc_pf;
