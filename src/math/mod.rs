//! Small numerical building blocks: grids, numeric derivatives, and the
//! local optimizers used by the fitting stages.

pub mod grids;
pub mod optim;

pub use grids::{linspace, log_space};
pub use optim::{conjugate_gradient, numeric_gradient, numeric_hessian, quasi_newton};
