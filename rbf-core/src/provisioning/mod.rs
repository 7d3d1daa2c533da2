//! Provisioning plan compiler.
//!
//! [`build_plan`] walks the stages in their fixed order, threading an immutable
//! [`BuildContext`] through them, and freezes the result into a [`ProvisioningPlan`].

pub mod context;
pub mod directive;
pub mod plan;
pub mod stages;

pub use context::{BuildContext, HostBinding};
pub use directive::{Directive, PartedEntry, YumAction, KERNEL_VERSION};
pub use plan::{FailurePolicy, PlanBuilder, ProvisioningPlan, ProvisioningStage};

use crate::cleanup::build_cleanup;
use crate::partitioning::{compute_layout, LayoutEntry};
use crate::template::Template;
use rbf_error::RbfResult;

/// Stages that make the image bootable; also rendered on their own as the boot sub-script.
pub const BOOT_STAGES: [&str; 2] = ["build-initramfs", "configure-bootloader"];

/// Order the full build for `template` on top of an already computed layout.
pub fn build_plan(template: &Template, layout: &[LayoutEntry], host: &HostBinding) -> ProvisioningPlan {
    let ctx = BuildContext::new(template, layout, host);
    let mut builder = PlanBuilder::new();

    builder
        .push(stages::detach_stale_device(&ctx))
        .push(stages::allocate_image(template))
        .push(stages::partition_image(template, &ctx))
        .push(stages::attach_device(template, &ctx))
        .push(stages::create_filesystems(&ctx))
        .push(stages::mount_partitions(&ctx))
        .push(stages::register_repositories(template, &ctx));

    let (kernel_stage, ctx) = stages::install_kernel(template, &ctx);
    builder
        .push(kernel_stage)
        .push(stages::copy_firmware(template, &ctx))
        .push(stages::init_rpmdb(&ctx))
        .push(stages::install_groups(&ctx))
        .push(stages::install_packages(&ctx))
        .push(stages::copy_etc_overlay(template, &ctx))
        .push(stages::write_fstab(&ctx))
        .push(stages::build_initramfs(template, &ctx))
        .push(stages::configure_bootloader(template, &ctx))
        .push(stages::configure_network(template, &ctx))
        .push_all(stages::finalization(template, &ctx));

    let plan = builder.finish();
    log::info!("Planned {} provisioning stages", plan.len());
    plan
}

/// Layout, main plan and cleanup plan for one run.
#[derive(Debug, Clone)]
pub struct CompiledPlans {
    pub layout: Vec<LayoutEntry>,
    pub plan: ProvisioningPlan,
    pub cleanup: ProvisioningPlan,
}

impl CompiledPlans {
    /// Boot stages on their own, for the standalone boot sub-script.
    pub fn boot(&self) -> ProvisioningPlan {
        self.plan.subset(&BOOT_STAGES)
    }
}

/// Compute the layout and both plans. Layout errors stop the run before any stage exists.
pub fn compile(template: &Template, host: &HostBinding) -> RbfResult<CompiledPlans> {
    let layout = compute_layout(template.image.size, &template.partitions)?;
    let plan = build_plan(template, &layout, host);
    let cleanup = build_cleanup(template, &layout, host);
    Ok(CompiledPlans {
        layout,
        plan,
        cleanup,
    })
}
