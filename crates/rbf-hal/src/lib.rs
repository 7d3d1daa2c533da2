//! rbf host abstraction layer (HAL).
//!
//! Everything that touches the build host (spawning scripts, asking `losetup` for a free
//! device, probing `PATH`) goes through the traits in [`hal`], so the workflow can be driven
//! against [`FakeHal`] in tests.

pub mod hal;
pub mod path;

pub use hal::*;
pub use rbf_error::{HalError, HalResult};
