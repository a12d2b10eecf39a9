//! Application Layer
//!
//! Use cases that orchestrate the infrastructure components.

pub mod optimizer;

pub use optimizer::{
    HealthReport, HealthState, Optimizer, OptimizerBuilder, OptimizerError, OptimizerStatus,
};
