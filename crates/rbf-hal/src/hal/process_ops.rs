//! Process execution helpers.
//!
//! External commands are considered "world-touching" and must go through the HAL so we can
//! test workflows without spawning real processes.

use crate::HalResult;
use std::path::Path;
use std::process::Output;

/// Process execution trait (external command runner).
///
/// There is deliberately no timeout: a hung stage blocks the run until an operator steps in.
pub trait ProcessOps {
    fn command_output(&self, program: &str, args: &[&str]) -> HalResult<Output>;

    /// Run a generated script with `shell` and return its exit status.
    ///
    /// A script killed by a signal reports `-1`.
    fn run_script(&self, shell: &Path, script: &Path, cwd: Option<&Path>) -> HalResult<i32>;
}
