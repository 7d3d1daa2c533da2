//! Read-only host checks that run before anything destructive.

use crate::partitioning::LayoutEntry;
use crate::template::{FsKind, Template};
use log::{info, warn};
use rbf_error::{RbfError, RbfResult};
use rbf_hal::{BinaryStatus, HostInfoOps, ProbeOps};
use std::path::PathBuf;

/// Host tools the generated scripts call directly.
pub const REQUIRED_COMMANDS: [&str; 14] = [
    "fallocate",
    "parted",
    "losetup",
    "mount",
    "umount",
    "mkdir",
    "rm",
    "cat",
    "cp",
    "rpm",
    "yum",
    "sed",
    "chroot",
    "partprobe",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreflightConfig {
    pub require_root: bool,
    /// Warn when the host is not an ARM machine.
    pub expect_arm_host: bool,
    pub required_commands: Vec<String>,
    pub filesystems: Vec<FsKind>,
    pub image_path: PathBuf,
    pub uboot: Option<PathBuf>,
    pub firmware: Option<PathBuf>,
    pub etc_overlay: PathBuf,
}

impl PreflightConfig {
    /// Checks for a run over `template`; `build` adds the ones that only matter on execution.
    pub fn for_template(template: &Template, layout: &[LayoutEntry], build: bool) -> Self {
        let mut filesystems = Vec::new();
        for fs in layout.iter().filter(|e| e.has_filesystem()).filter_map(|e| e.fs) {
            if !filesystems.contains(&fs) {
                filesystems.push(fs);
            }
        }
        Self {
            require_root: build,
            expect_arm_host: build,
            required_commands: REQUIRED_COMMANDS.iter().map(|c| c.to_string()).collect(),
            filesystems,
            image_path: template.image.path.clone(),
            uboot: template.uboot.clone(),
            firmware: template.firmware.clone(),
            etc_overlay: template.etc_overlay.clone(),
        }
    }
}

pub fn run<H>(hal: &H, cfg: &PreflightConfig) -> RbfResult<()>
where
    H: HostInfoOps + ProbeOps + ?Sized,
{
    info!("Preflight checks");
    if cfg.require_root && !hal.is_root() {
        return Err(RbfError::NotRoot);
    }
    if cfg.expect_arm_host {
        check_host_arch(hal);
    }
    check_commands(hal, &cfg.required_commands)?;
    check_format_tools(hal, &cfg.filesystems)?;

    if hal.path_exists(&cfg.image_path) {
        return Err(RbfError::ImageExists(cfg.image_path.clone()));
    }
    if let Some(uboot) = &cfg.uboot {
        if !hal.path_exists(uboot) {
            return Err(RbfError::NoUboot(uboot.clone()));
        }
    }
    if let Some(firmware) = &cfg.firmware {
        if !hal.path_exists(firmware) {
            return Err(RbfError::NoFirmware(firmware.clone()));
        }
    }
    if !hal.path_exists(&cfg.etc_overlay) {
        return Err(RbfError::NoEtcOverlay(cfg.etc_overlay.clone()));
    }
    info!("Preflight complete");
    Ok(())
}

fn check_host_arch<H: HostInfoOps + ?Sized>(hal: &H) {
    match hal.machine() {
        Ok(machine) if machine.starts_with("arm") || machine == "aarch64" => {}
        Ok(machine) => warn!("This tool is not meant to be run on {}", machine),
        Err(err) => warn!("Could not determine host architecture: {}", err),
    }
}

fn check_commands<H: ProbeOps + ?Sized>(hal: &H, commands: &[String]) -> RbfResult<()> {
    let mut missing = Vec::new();
    let mut not_executable = Vec::new();
    for command in commands {
        match hal.locate_binary(command) {
            BinaryStatus::Found(_) => {}
            BinaryStatus::NotExecutable(_) => not_executable.push(command.clone()),
            BinaryStatus::Missing => missing.push(command.clone()),
        }
    }
    if !missing.is_empty() {
        log::error!("Commands not found: {}", missing.join(", "));
    }
    if !not_executable.is_empty() {
        log::error!("Commands not executable: {}", not_executable.join(", "));
    }
    if missing.is_empty() && not_executable.is_empty() {
        info!("All commands found. Continuing");
        Ok(())
    } else {
        Err(RbfError::CommandsNotFound {
            missing,
            not_executable,
        })
    }
}

fn check_format_tools<H: ProbeOps + ?Sized>(hal: &H, filesystems: &[FsKind]) -> RbfResult<()> {
    for fs in filesystems {
        let tool = fs.format_tool();
        if !matches!(hal.locate_binary(tool), BinaryStatus::Found(_)) {
            return Err(RbfError::FormatToolMissing {
                tool: tool.to_string(),
                fs: fs.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbf_hal::FakeHal;

    fn config() -> PreflightConfig {
        PreflightConfig {
            require_root: true,
            expect_arm_host: true,
            required_commands: REQUIRED_COMMANDS.iter().map(|c| c.to_string()).collect(),
            filesystems: vec![FsKind::Ext4, FsKind::Vfat],
            image_path: PathBuf::from("board.img"),
            uboot: None,
            firmware: None,
            etc_overlay: PathBuf::from("etc"),
        }
    }

    fn hal() -> FakeHal {
        let hal = FakeHal::new();
        hal.add_path("etc");
        hal
    }

    #[test]
    fn passes_on_a_prepared_host() {
        run(&hal(), &config()).unwrap();
    }

    #[test]
    fn root_is_only_required_when_asked() {
        let hal = hal();
        hal.set_root(false);
        assert!(matches!(run(&hal, &config()), Err(RbfError::NotRoot)));

        let cfg = PreflightConfig {
            require_root: false,
            ..config()
        };
        run(&hal, &cfg).unwrap();
    }

    #[test]
    fn missing_and_non_executable_commands_are_reported_together() {
        let hal = hal();
        hal.mark_missing("parted");
        hal.mark_not_executable("yum");
        let err = run(&hal, &config()).unwrap_err();
        match &err {
            RbfError::CommandsNotFound {
                missing,
                not_executable,
            } => {
                assert_eq!(missing, &vec!["parted".to_string()]);
                assert_eq!(not_executable, &vec!["yum".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.code(), 115);
    }

    #[test]
    fn format_tool_is_checked_per_filesystem() {
        let hal = hal();
        hal.mark_missing("mkfs.vfat");
        let err = run(&hal, &config()).unwrap_err();
        assert!(matches!(err, RbfError::FormatToolMissing { ref tool, .. } if tool == "mkfs.vfat"));
        assert_eq!(err.code(), 116);
    }

    #[test]
    fn existing_image_is_refused() {
        let hal = hal();
        hal.add_path("board.img");
        assert_eq!(run(&hal, &config()).unwrap_err().code(), 107);
    }

    #[test]
    fn declared_inputs_must_exist() {
        let cfg = PreflightConfig {
            uboot: Some(PathBuf::from("u-boot.bin")),
            ..config()
        };
        assert_eq!(run(&hal(), &cfg).unwrap_err().code(), 108);

        let cfg = PreflightConfig {
            firmware: Some(PathBuf::from("firmware")),
            ..config()
        };
        assert_eq!(run(&hal(), &cfg).unwrap_err().code(), 117);

        assert_eq!(run(&FakeHal::new(), &config()).unwrap_err().code(), 218);
    }

    #[test]
    fn foreign_host_only_warns() {
        let hal = hal();
        hal.set_machine("x86_64");
        run(&hal, &config()).unwrap();
    }
}
