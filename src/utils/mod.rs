//! Numerical utilities shared by the fit strategies.

pub mod finite_difference;

pub use finite_difference::jacobian;
