//! Domain Services
//!
//! Pure logic with no locking and no I/O.

pub mod selector;
pub mod statistics;

pub use selector::{BackendSelector, SelectionParams};
pub use statistics::{Trend, WindowStats};
