//! rbf run orchestration.
//!
//! This crate turns a template path into artifacts on disk and, in build mode, drives the
//! generated scripts through the HAL. Planning itself lives in `rbf-core`.

pub mod artifacts;
pub mod run;

pub use artifacts::{
    ArtifactPaths, ArtifactSet, BOOT_SCRIPT, CLEANUP_SCRIPT, LOG_FILE, MAIN_SCRIPT, PLAN_JSON,
};
pub use run::{run, Mode, RunOptions, RunReport, DEFAULT_BOARDS_DIR};
