//! Adapters Layer
//!
//! Implementations of the domain ports.

pub mod outbound;
