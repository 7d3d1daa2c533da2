//! Teardown plan.
//!
//! Unmounts everything the main plan mounts, in exactly the reverse order, then releases the
//! loop device. Produced on every run; it is the only plan allowed to run after an abort.

use crate::partitioning::LayoutEntry;
use crate::provisioning::stages::PSEUDO_FILESYSTEMS;
use crate::provisioning::{
    BuildContext, Directive, HostBinding, PlanBuilder, ProvisioningPlan, ProvisioningStage,
};
use crate::template::Template;
use rbf_error::ProvisionCode;

pub fn build_cleanup(template: &Template, layout: &[LayoutEntry], host: &HostBinding) -> ProvisioningPlan {
    let ctx = BuildContext::new(template, layout, host);
    let order = ctx.mount_order();
    let (root, rest) = match order.split_first() {
        Some((first, rest)) if first.is_root() => (Some(*first), rest),
        _ => (None, order.as_slice()),
    };

    let pseudo = PSEUDO_FILESYSTEMS
        .into_iter()
        .rev()
        .map(|(_, dir)| Directive::Unmount {
            target: ctx.in_root(dir),
        });
    let partitions = rest.iter().rev().filter_map(|e| {
        e.mountpoint.as_ref().map(|mp| Directive::Unmount {
            target: ctx.in_root(mp.as_str()),
        })
    });
    let root = root.map(|_| Directive::Unmount {
        target: ctx.workdir.clone(),
    });

    let mut builder = PlanBuilder::new();
    builder
        .push(
            ProvisioningStage::warn(
                "unmount-pseudo",
                "Unmounting pseudo filesystems",
                ProvisionCode::Mounting,
            )
            .with_all(pseudo),
        )
        .push(
            ProvisioningStage::warn(
                "unmount-partitions",
                "Unmounting partitions",
                ProvisionCode::Mounting,
            )
            .with_all(partitions),
        )
        .push(
            ProvisioningStage::warn(
                "unmount-root",
                format!("Unmounting {}", ctx.workdir.display()),
                ProvisionCode::Mounting,
            )
            .with_all(root),
        )
        .push(
            ProvisioningStage::abort(
                "detach-device",
                format!("Detaching {}", ctx.loop_device),
                ProvisionCode::LoopDeviceDelete,
            )
            .with(Directive::DetachLoop {
                device: ctx.loop_device.clone(),
            })
            .with(Directive::Settle { seconds: 2 }),
        );
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioning::compute_layout;
    use crate::provisioning::{build_plan, FailurePolicy};
    use crate::template::{FsKind, MountPoint, PartitionKind, PartitionSpec};
    use std::path::{Path, PathBuf};

    const BASE: &str = r#"
board = "b"
workdir = "/mnt/rbf"
hostname = "h"
etc_overlay = "etc"
finalize_script = "true"

[image]
size = "2G"
type = "raw"
path = "b.img"

[kernel]
type = "none"
"#;

    fn template_with(specs: Vec<PartitionSpec>) -> Template {
        let mut t = Template::from_toml_str(BASE, Path::new("b.toml")).unwrap();
        t.partitions = specs;
        t
    }

    fn part(index: u32, kind: PartitionKind, fs: FsKind, mp: &str) -> PartitionSpec {
        PartitionSpec::new(index, "64M", kind, fs, MountPoint::parse(mp).unwrap())
    }

    fn layouts() -> Vec<Vec<PartitionSpec>> {
        use FsKind::*;
        use PartitionKind::*;
        vec![
            vec![part(1, Primary, Ext4, "/")],
            vec![
                part(1, Primary, Vfat, "/boot"),
                part(2, Primary, Swap, "swap"),
                part(3, Primary, Ext4, "/"),
                part(4, Primary, Ext4, "/boot/efi"),
            ],
            vec![
                part(1, Primary, Ext4, "/var/log"),
                part(2, Primary, Ext4, "/"),
                PartitionSpec::extended(3, "512M"),
                part(4, Logical, Ext4, "/var"),
                part(5, Logical, Xfs, "/home"),
            ],
            vec![],
        ]
    }

    #[test]
    fn unmounts_are_the_exact_reverse_of_mounts() {
        let host = HostBinding::new("/dev/loop1");
        for specs in layouts() {
            let t = template_with(specs);
            let layout = compute_layout(t.image.size, &t.partitions).unwrap();
            let plan = build_plan(&t, &layout, &host);
            let cleanup = build_cleanup(&t, &layout, &host);

            let mut mounted = plan.mount_sequence();
            mounted.reverse();
            assert_eq!(cleanup.unmount_sequence(), mounted);
        }
    }

    #[test]
    fn root_is_unmounted_last_and_device_detached_after() {
        let t = template_with(layouts().remove(2));
        let layout = compute_layout(t.image.size, &t.partitions).unwrap();
        let cleanup = build_cleanup(&t, &layout, &HostBinding::new("/dev/loop1"));
        assert_eq!(
            cleanup.stage_names(),
            vec![
                "unmount-pseudo",
                "unmount-partitions",
                "unmount-root",
                "detach-device"
            ]
        );
        assert_eq!(
            cleanup.unmount_sequence().last(),
            Some(&&PathBuf::from("/mnt/rbf"))
        );
        let detach = cleanup.stage("detach-device").unwrap();
        assert_eq!(detach.policy, FailurePolicy::Abort);
        assert_eq!(detach.code, ProvisionCode::LoopDeviceDelete);
        assert!(cleanup
            .stages()
            .iter()
            .filter(|s| s.name.starts_with("unmount"))
            .all(|s| s.policy == FailurePolicy::Warn));
    }

    #[test]
    fn empty_layout_still_releases_the_device() {
        let t = template_with(Vec::new());
        let cleanup = build_cleanup(&t, &[], &HostBinding::new("/dev/loop1"));
        assert_eq!(
            cleanup.stage_names(),
            vec!["unmount-pseudo", "detach-device"]
        );
    }
}
