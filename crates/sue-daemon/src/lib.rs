//! sue-daemon library surface.
//!
//! The binary in `main.rs` only wires these modules together; the scenario
//! tests in `tests/` drive them directly.

pub mod api_types;
pub mod metrics;
pub mod routes;
pub mod scheduler;
pub mod state;
