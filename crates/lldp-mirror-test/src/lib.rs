//! Test infrastructure for the LLDP mirror tools
//!
//! Provides:
//! - An in-memory fake of `ip`/`tc` with failure injection
//! - Mirror file and host directory fixtures
//! - Kernel and state file verification helpers

pub mod fake_kernel;
pub mod fixtures;
mod verification;

pub use fake_kernel::{FakeFilter, FakeKernel};
pub use fixtures::*;
pub use verification::*;
