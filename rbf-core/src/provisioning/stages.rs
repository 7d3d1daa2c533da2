//! One function per provisioning stage.
//!
//! Each function reads the template and the current [`BuildContext`] and returns the stage it
//! plans. Stages with nothing to do come back empty and are dropped by the builder.

use super::context::BuildContext;
use super::directive::{Directive, PartedEntry, YumAction, KERNEL_VERSION};
use super::plan::ProvisioningStage;
use crate::partitioning::root_entry;
use crate::template::{CustomKernel, InterfaceConfig, KernelSpec, Template};
use rbf_error::ProvisionCode;
use std::path::{Path, PathBuf};

/// Packages a stock kernel needs: the kernel itself and dracut's generic initramfs config.
pub const STOCK_KERNEL_PACKAGES: [&str; 2] = ["kernel", "dracut-config-generic"];

const SETTLE_SECONDS: u32 = 2;

pub fn detach_stale_device(ctx: &BuildContext) -> ProvisioningStage {
    ProvisioningStage::abort(
        "detach-stale-device",
        format!("Detaching loop device if busy: {}", ctx.loop_device),
        ProvisionCode::LoopDeviceExists,
    )
    .with(Directive::DetachLoop {
        device: ctx.loop_device.clone(),
    })
    .with(Directive::Settle {
        seconds: SETTLE_SECONDS,
    })
}

pub fn allocate_image(template: &Template) -> ProvisioningStage {
    ProvisioningStage::abort(
        "allocate-image",
        format!("Creating {}", template.image.path.display()),
        ProvisionCode::Fallocate,
    )
    .with(Directive::Fallocate {
        path: template.image.path.clone(),
        size: template.image.size,
    })
}

pub fn partition_image(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    let entries = ctx
        .layout
        .iter()
        .map(|e| PartedEntry {
            kind: e.kind,
            fs: e.fs.map(|fs| fs.parted_name()),
            begin: e.begin,
            end: e.end,
        })
        .collect::<Vec<_>>();
    let stage = ProvisioningStage::abort(
        "partition-image",
        "Creating partitions",
        ProvisionCode::Parted,
    );
    if entries.is_empty() {
        return stage;
    }
    stage.with(Directive::Parted {
        image: template.image.path.clone(),
        entries,
    })
}

pub fn attach_device(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    ProvisioningStage::abort(
        "attach-device",
        format!("Attaching {} to {}", template.image.path.display(), ctx.loop_device),
        ProvisionCode::LoopDeviceCreate,
    )
    .with(Directive::AttachLoop {
        device: ctx.loop_device.clone(),
        image: template.image.path.clone(),
    })
    .with(Directive::Partprobe {
        device: ctx.loop_device.clone(),
    })
    .with(Directive::Settle {
        seconds: SETTLE_SECONDS,
    })
    .with_teardown()
}

pub fn create_filesystems(ctx: &BuildContext) -> ProvisioningStage {
    let directives = ctx.layout.iter().filter(|e| !e.is_extended()).flat_map(|e| {
        let device = ctx.partition_device(e);
        let mkfs = e.fs.map(|fs| Directive::Mkfs {
            fs,
            device: device.clone(),
            identifier: e.identifier.clone(),
        });
        std::iter::once(Directive::RequireBlockDevice { device }).chain(mkfs)
    });
    ProvisioningStage::abort(
        "create-filesystems",
        "Creating filesystems",
        ProvisionCode::Mkfs,
    )
    .with_all(directives)
}

/// Root first, then every other partition by depth, then the pseudo filesystems. Swap is
/// never mounted.
pub fn mount_partitions(ctx: &BuildContext) -> ProvisioningStage {
    let order = ctx.mount_order();
    let mut stage = ProvisioningStage::abort(
        "mount-partitions",
        format!("Mounting partitions on {}", ctx.workdir.display()),
        ProvisionCode::Mounting,
    )
    .with(Directive::MakeDir {
        path: ctx.workdir.clone(),
    })
    .with_teardown();

    let (root, rest) = match order.split_first() {
        Some((first, rest)) if first.is_root() => (Some(*first), rest),
        _ => (None, order.as_slice()),
    };
    if let Some(root) = root {
        stage = stage.with(Directive::Mount {
            device: ctx.partition_device(root),
            target: ctx.workdir.clone(),
        });
    }
    // A mount point directory is only created once its parent partition is mounted.
    for entry in rest {
        if let Some(mp) = &entry.mountpoint {
            let target = ctx.in_root(mp.as_str());
            stage = stage
                .with(Directive::MakeDir {
                    path: target.clone(),
                })
                .with(Directive::Mount {
                    device: ctx.partition_device(entry),
                    target,
                });
        }
    }

    stage
        .with_all(PSEUDO_FILESYSTEMS.into_iter().map(|(_, dir)| Directive::MakeDir {
            path: ctx.in_root(dir),
        }))
        .with_all(
            PSEUDO_FILESYSTEMS
                .into_iter()
                .map(|(fstype, dir)| Directive::MountPseudo {
                    fstype,
                    target: ctx.in_root(dir),
                }),
        )
}

/// Pseudo filesystems mounted into the image root, in mount order.
pub const PSEUDO_FILESYSTEMS: [(&str, &str); 2] = [("proc", "/proc"), ("sysfs", "/sys")];

pub fn register_repositories(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    let stage = ProvisioningStage::abort(
        "register-repositories",
        "Writing repository configuration",
        ProvisionCode::WriteRepo,
    );
    if template.repos.is_empty() {
        return stage;
    }
    let repo_dir = ctx.in_root("/etc/yum.repos.d");
    stage
        .with(Directive::RemoveTree {
            path: repo_dir.clone(),
        })
        .with(Directive::MakeDir {
            path: repo_dir.clone(),
        })
        .with_all(template.repos.iter().map(|repo| {
            log::info!("Found repo: {} {}", repo.name, repo.url);
            Directive::WriteFile {
                path: repo_dir.join(format!("{}.repo", repo.name)),
                contents: format!(
                    "[{name}]\nname={name}\nbaseurl={url}\ngpgcheck=0\nenabled=1\n",
                    name = repo.name,
                    url = repo.url
                ),
                append: false,
            }
        }))
}

/// Kernel stage plus the context the package stages see.
///
/// A stock kernel adds its packages to the context instead of copying anything.
pub fn install_kernel(
    template: &Template,
    ctx: &BuildContext,
) -> (ProvisioningStage, BuildContext) {
    let stage = ProvisioningStage::abort(
        "install-kernel",
        "Installing kernel",
        ProvisionCode::CopyKernel,
    );
    match &template.kernel {
        KernelSpec::Custom(kernel) => {
            log::info!("Using custom kernel: {}", kernel.image.display());
            log::info!("Using DTB: {}", kernel.dtb);
            let stage = ProvisioningStage {
                description: format!(
                    "Installing kernel {} for {}",
                    kernel.image.display(),
                    kernel.dtb
                ),
                ..stage
            };
            (custom_kernel(stage, kernel, ctx), ctx.clone())
        }
        KernelSpec::Stock => {
            log::info!("Using stock kernel");
            (stage, ctx.with_packages(&STOCK_KERNEL_PACKAGES))
        }
        KernelSpec::None => {
            log::info!("Not installing any kernel");
            (stage, ctx.clone())
        }
    }
}

fn custom_kernel(
    stage: ProvisioningStage,
    kernel: &CustomKernel,
    ctx: &BuildContext,
) -> ProvisioningStage {
    let mut boot_sources = vec![kernel.image.clone()];
    boot_sources.extend(kernel.initrd.clone());
    boot_sources.push(kernel.dtb_dir.clone());
    let modules_dir = ctx.in_root("/lib/modules");
    stage
        .with(Directive::MakeDir {
            path: ctx.in_root("/boot"),
        })
        .with(Directive::Copy {
            sources: boot_sources,
            dest: ctx.in_root("/boot"),
            preserve: false,
        })
        .with(Directive::MakeDir {
            path: modules_dir.clone(),
        })
        .with(Directive::Copy {
            sources: vec![kernel.modules.clone()],
            dest: modules_dir,
            preserve: false,
        })
}

pub fn copy_firmware(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    let stage = ProvisioningStage::abort(
        "copy-firmware",
        "Copying firmware",
        ProvisionCode::CopyFirmware,
    );
    let Some(firmware) = &template.firmware else {
        return stage;
    };
    let dest = ctx.in_root("/lib/firmware");
    stage
        .with(Directive::MakeDir { path: dest.clone() })
        .with(Directive::Copy {
            sources: vec![contents_of(firmware)],
            dest,
            preserve: false,
        })
}

pub fn init_rpmdb(ctx: &BuildContext) -> ProvisioningStage {
    ProvisioningStage::abort(
        "init-rpmdb",
        "Initializing RPM database",
        ProvisionCode::RpmDbInit,
    )
    .with(Directive::RpmInitDb {
        root: ctx.workdir.clone(),
    })
}

pub fn install_groups(ctx: &BuildContext) -> ProvisioningStage {
    log::info!("Installing package groups: {}", ctx.groups.join(" "));
    yum_stage(
        ProvisioningStage::warn(
            "install-groups",
            "Installing package groups. Please wait",
            ProvisionCode::GroupInstall,
        ),
        ctx,
        YumAction::GroupInstall,
        &ctx.groups,
    )
}

pub fn install_packages(ctx: &BuildContext) -> ProvisioningStage {
    log::info!("Installing packages: {}", ctx.packages.join(" "));
    yum_stage(
        ProvisioningStage::warn(
            "install-packages",
            "Installing packages. Please wait",
            ProvisionCode::PackageInstall,
        ),
        ctx,
        YumAction::Install,
        &ctx.packages,
    )
}

fn yum_stage(
    stage: ProvisioningStage,
    ctx: &BuildContext,
    action: YumAction,
    items: &[String],
) -> ProvisioningStage {
    if items.is_empty() {
        return stage;
    }
    stage.with(Directive::Yum {
        repos: ctx.repo_names.clone(),
        root: ctx.workdir.clone(),
        action,
        items: items.to_vec(),
    })
}

pub fn copy_etc_overlay(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    log::info!("Copying etc overlay: {}", template.etc_overlay.display());
    let etc = ctx.in_root("/etc");
    ProvisioningStage::warn(
        "copy-etc-overlay",
        format!("Copying {} over /etc", template.etc_overlay.display()),
        ProvisionCode::EtcOverlay,
    )
    .with(Directive::MakeDir { path: etc.clone() })
    .with(Directive::Copy {
        sources: vec![contents_of(&template.etc_overlay)],
        dest: etc,
        preserve: true,
    })
}

pub fn write_fstab(ctx: &BuildContext) -> ProvisioningStage {
    let mut contents = String::from("#Generated by RootFS Build Factory\n");
    for entry in ctx.layout.iter().filter(|e| e.has_filesystem()) {
        let (Some(fs), Some(mp)) = (entry.fs, &entry.mountpoint) else {
            continue;
        };
        contents.push_str(&format!("{} {} {} noatime 0 0\n", entry.fs_reference(), mp, fs));
    }
    ProvisioningStage::abort("write-fstab", "Writing /etc/fstab", ProvisionCode::Fstab).with(
        Directive::WriteFile {
            path: ctx.in_root("/etc/fstab"),
            contents,
            append: false,
        },
    )
}

pub fn build_initramfs(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    let stage = ProvisioningStage::warn(
        "build-initramfs",
        "Creating initramfs",
        ProvisionCode::Initramfs,
    );
    if template.kernel != KernelSpec::Stock {
        return stage;
    }
    stage.with(Directive::ForEachKernel {
        modules_dir: ctx.in_root("/lib/modules"),
        body: vec![Directive::Chroot {
            root: ctx.workdir.clone(),
            program: "/usr/bin/dracut".to_string(),
            args: vec![
                "--no-compress".to_string(),
                "-f".to_string(),
                format!("/boot/initramfs-{KERNEL_VERSION}.img"),
                KERNEL_VERSION.to_string(),
            ],
        }],
    })
}

pub fn configure_bootloader(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    let stage = ProvisioningStage::abort(
        "configure-bootloader",
        "Creating /boot/extlinux/extlinux.conf",
        ProvisionCode::ExtlinuxConf,
    );
    if !template.extlinux || template.kernel == KernelSpec::None {
        return stage;
    }
    let Some(root) = root_entry(&ctx.layout) else {
        log::warn!("No root partition; skipping extlinux.conf");
        return stage;
    };
    let root_ref = root.fs_reference();
    let dir = ctx.in_root("/boot/extlinux");
    let conf = dir.join("extlinux.conf");
    let header = extlinux_header(&template.distro);
    let stage = stage.with(Directive::MakeDir { path: dir });

    match &template.kernel {
        KernelSpec::Custom(kernel) => {
            let mut entry = format!(
                "label {distro}\n\tkernel {kernel}\n\tappend enforcing=0 root={root_ref}\n\tfdtdir {fdtdir}\n",
                distro = template.distro,
                kernel = boot_path(&kernel.image),
                fdtdir = boot_path(&kernel.dtb_dir),
            );
            if let Some(initrd) = &kernel.initrd {
                entry.push_str(&format!("\tinitrd {}\n", boot_path(initrd)));
            }
            stage.with(Directive::WriteFile {
                path: conf,
                contents: header + &entry,
                append: false,
            })
        }
        KernelSpec::Stock => stage
            .with(Directive::WriteFile {
                path: conf.clone(),
                contents: header,
                append: false,
            })
            .with(Directive::ForEachKernel {
                modules_dir: ctx.in_root("/lib/modules"),
                body: vec![Directive::WriteFile {
                    path: conf,
                    contents: format!(
                        "label {distro}\n\tkernel /vmlinuz-{v}\n\tappend enforcing=0 root={root_ref}\n\tfdtdir /dtb-{v}\n\tinitrd /initramfs-{v}.img\n\n",
                        distro = template.distro,
                        v = KERNEL_VERSION,
                    ),
                    append: true,
                }],
            }),
        KernelSpec::None => stage,
    }
}

fn extlinux_header(distro: &str) -> String {
    format!(
        "#Created by RootFS Build Factory\nui menu.c32\nmenu autoboot {distro}\nmenu title {distro} Options\n#menu hidden\ntimeout 60\ntotaltimeout 600\n"
    )
}

/// Path of a copied boot artifact as the bootloader sees it (`/` + file name).
fn boot_path(path: &Path) -> String {
    match path.file_name() {
        Some(name) => format!("/{}", name.to_string_lossy()),
        None => format!("/{}", path.display()),
    }
}

pub fn configure_network(template: &Template, ctx: &BuildContext) -> ProvisioningStage {
    let stage = ProvisioningStage::warn(
        "configure-network",
        "Writing network configuration",
        ProvisionCode::NetworkConfig,
    );
    if template.interfaces.is_empty() {
        return stage;
    }
    let scripts = ctx.in_root("/etc/sysconfig/network-scripts");
    let mut nameservers = String::new();
    let mut stage = stage.with(Directive::MakeDir {
        path: scripts.clone(),
    });
    for iface in &template.interfaces {
        let mut contents = format!("DEVICE={}\n", iface.name);
        match &iface.config {
            InterfaceConfig::Dhcp => {
                log::info!("Found network interface: {} dhcp", iface.name);
                contents.push_str("BOOTPROTO=dhcp\nNM_CONTROLLED=no\nONBOOT=yes\n");
            }
            InterfaceConfig::Static {
                address,
                mask,
                gateway,
                nameserver,
            } => {
                log::info!("Found network interface: {} static {}", iface.name, address);
                contents.push_str(&format!(
                    "BOOTPROTO=static\nNM_CONTROLLED=no\nONBOOT=yes\nIPADDR={address}\nNETMASK={mask}\nGATEWAY={gateway}\n"
                ));
                nameservers.push_str(&format!("nameserver {nameserver}\n"));
            }
        }
        stage = stage.with(Directive::WriteFile {
            path: scripts.join(format!("ifcfg-{}", iface.name)),
            contents,
            append: false,
        });
    }
    if !nameservers.is_empty() {
        stage = stage.with(Directive::WriteFile {
            path: ctx.in_root("/etc/resolv.conf"),
            contents: nameservers,
            append: false,
        });
    }
    stage
}

pub fn finalization(template: &Template, ctx: &BuildContext) -> Vec<ProvisioningStage> {
    let etc = ctx.in_root("/etc");
    let mut stages = vec![
        ProvisioningStage::warn(
            "set-hostname",
            format!("Setting hostname to {}", template.hostname),
            ProvisionCode::Hostname,
        )
        .with(Directive::WriteFile {
            path: etc.join("hostname"),
            contents: format!("{}\n", template.hostname),
            append: false,
        }),
        ProvisioningStage::warn(
            "reset-root-password",
            "Setting empty root pass",
            ProvisionCode::RootPass,
        )
        .with(Directive::Sed {
            expression: "s/root:x:/root::/".to_string(),
            file: etc.join("passwd"),
        }),
        ProvisioningStage::warn(
            "set-selinux",
            format!("Setting SELinux status to {}", template.selinux),
            ProvisionCode::Selinux,
        )
        .with(Directive::Sed {
            expression: format!("s/SELINUX=enforcing/SELINUX={}/", template.selinux),
            file: etc.join("selinux/config"),
        }),
    ];

    if let Some(hook) = &ctx.board_hook {
        log::info!("Board script: {}", hook.display());
        stages.push(
            ProvisioningStage::warn(
                "board-hook",
                format!("Running board script: {}", hook.display()),
                ProvisionCode::BoardScript,
            )
            .with(Directive::RunHook {
                program: hook.clone(),
                args: vec![
                    template.image.path.display().to_string(),
                    template
                        .uboot
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| crate::template::NONE_SENTINEL.to_string()),
                    ctx.workdir.display().to_string(),
                    template.root_files.clone(),
                ],
            }),
        );
    }

    log::info!("Finalize script: {}", template.finalize_script.display());
    stages.push(
        ProvisioningStage::warn(
            "finalize-hook",
            format!(
                "Running finalize script: {}",
                template.finalize_script.display()
            ),
            ProvisionCode::FinalizeScript,
        )
        .with(Directive::RunHook {
            program: template.finalize_script.clone(),
            args: Vec::new(),
        }),
    );
    stages
}

/// `dir/.`, so `cp -r` copies the directory's contents rather than the directory itself.
fn contents_of(dir: &Path) -> PathBuf {
    dir.join(".")
}
