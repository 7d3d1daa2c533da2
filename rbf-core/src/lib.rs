//! rbf core: board templates, MBR layout planning and provisioning plan compilation.
//!
//! Pipeline, leaves first: [`template`] → [`partitioning`] → [`provisioning`] →
//! [`cleanup`] / [`emit`]. [`preflight`] and [`logging`] are the host-facing edges.

pub mod cleanup;
pub mod emit;
pub mod logging;
pub mod partitioning;
pub mod preflight;
pub mod provisioning;
pub mod template;

pub use cleanup::build_cleanup;
pub use emit::{render, render_script, ScriptOptions};
pub use partitioning::{compute_layout, compute_layout_with, LayoutEntry, PARTITION_BEGIN_MB};
pub use provisioning::{build_plan, compile, CompiledPlans, HostBinding, ProvisioningPlan};
pub use template::{SizeMb, Template};
